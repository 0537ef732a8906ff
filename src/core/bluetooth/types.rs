//! Defines shared data structures for the Bluetooth module.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use crate::core::bluetooth::constants::{SWITCH_OFF, SWITCH_ON};
use crate::core::bluetooth::error::BleError;

static MAC_ADDRESS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok());

/// A discovered peripheral. Immutable once created by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceHandle {
    /// Platform-specific unique identifier for the device
    pub id: String,
    /// The advertised local name
    pub name: String,
}

impl DeviceHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// The MAC address embedded in the platform id, if there is one.
    /// macOS ids are UUIDs and carry no address.
    pub fn address(&self) -> Option<String> {
        MAC_ADDRESS
            .as_ref()?
            .find_iter(&self.id)
            .last()
            .map(|m| m.as_str().to_uppercase())
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// A single advertisement report from the radio.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub id: String,
    /// Local name, absent for many advertisers
    pub name: Option<String>,
    /// Service UUIDs listed in the advertisement
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

impl Advertisement {
    pub fn new(id: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            name: name.map(str::to_string),
            services: Vec::new(),
            rssi: None,
        }
    }

    pub fn with_services(mut self, services: &[Uuid]) -> Self {
        self.services = services.to_vec();
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// The device handle for this advertiser. Nameless advertisers produce none.
    pub fn device_handle(&self) -> Option<DeviceHandle> {
        self.name
            .as_ref()
            .map(|name| DeviceHandle::new(self.id.clone(), name.clone()))
    }
}

/// Match criteria for a scan. Every criterion that is set must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Exact, case-sensitive local name
    pub name: Option<String>,
    /// A service UUID the advertisement must list
    pub service: Option<Uuid>,
    /// Weakest signal still accepted
    pub min_rssi: Option<i16>,
}

impl ScanFilter {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn by_service(service: Uuid) -> Self {
        Self {
            service: Some(service),
            ..Self::default()
        }
    }

    /// Advertisements without a name never match; the scanner has nothing to hand out for them.
    pub fn is_match(&self, advertisement: &Advertisement) -> bool {
        let Some(adv_name) = advertisement.name.as_deref() else {
            return false;
        };
        if let Some(name) = &self.name {
            if name != adv_name {
                return false;
            }
        }
        if let Some(service) = &self.service {
            if !advertisement.services.contains(service) {
                return false;
            }
        }
        if let Some(min_rssi) = self.min_rssi {
            match advertisement.rssi {
                Some(rssi) if rssi >= min_rssi => {}
                _ => return false,
            }
        }
        true
    }
}

/// Stable coordinate of a characteristic. Resolved against the
/// `ServiceCatalog` on every operation, never a live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicRef {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Services and their characteristics, as reported by discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCatalog {
    services: BTreeMap<Uuid, BTreeSet<Uuid>>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_service<I>(&mut self, service: Uuid, characteristics: I)
    where
        I: IntoIterator<Item = Uuid>,
    {
        self.services
            .entry(service)
            .or_default()
            .extend(characteristics);
    }

    pub fn with_service(mut self, service: Uuid, characteristics: &[Uuid]) -> Self {
        self.insert_service(service, characteristics.iter().copied());
        self
    }

    pub fn contains_service(&self, service: &Uuid) -> bool {
        self.services.contains_key(service)
    }

    pub fn contains(&self, reference: &CharacteristicRef) -> bool {
        self.services
            .get(&reference.service)
            .is_some_and(|chars| chars.contains(&reference.characteristic))
    }

    pub fn services(&self) -> impl Iterator<Item = &Uuid> {
        self.services.keys()
    }
}

/// Lifecycle of one `GattSession`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ServicesDiscovered,
    Failed(String),
}

impl ConnectionState {
    /// Legal edges of the state graph: forward by one step, to `Disconnected`
    /// once a connection was attempted, or to `Failed` from anything live.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Failed(_), _) => false,
            (_, Failed(_)) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, ServicesDiscovered) => true,
            (Connecting | Connected | ServicesDiscovered, Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::ServicesDiscovered => f.write_str("services discovered"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Position of the remote light switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchState {
    Off,
    On,
}

impl SwitchState {
    /// Decodes the switch characteristic. Any non-zero first byte is "on".
    pub fn from_bytes(value: &[u8]) -> Result<Self, BleError> {
        match value.first() {
            Some(&SWITCH_OFF) => Ok(Self::Off),
            Some(_) => Ok(Self::On),
            None => Err(BleError::InvalidValue(value.to_vec())),
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::Off => Self::On,
            Self::On => Self::Off,
        }
    }

    /// Encodes the state as the single-byte switch value.
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            Self::Off => vec![SWITCH_OFF],
            Self::On => vec![SWITCH_ON],
        }
    }
}

impl From<bool> for SwitchState {
    fn from(on: bool) -> Self {
        if on { Self::On } else { Self::Off }
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => f.write_str("off"),
            Self::On => f.write_str("on"),
        }
    }
}
