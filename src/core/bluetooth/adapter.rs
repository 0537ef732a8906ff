//! Abstract BLE adapter capability
//! The scanner and session only talk to the radio through these traits, so the
//! platform stack (bluest) and the simulated peripheral are interchangeable.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::types::{
    Advertisement, CharacteristicRef, DeviceHandle, ScanFilter, ServiceCatalog,
};

/// Stream of advertisement reports produced by an active scan.
pub type AdvertisementStream = BoxStream<'static, Advertisement>;

/// How a write is delivered to the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Resolves once the peripheral acknowledged the write
    WithResponse,
    /// Resolves once the write was handed to the radio
    WithoutResponse,
}

impl WriteMode {
    pub fn from_ack(ack_required: bool) -> Self {
        if ack_required {
            Self::WithResponse
        } else {
            Self::WithoutResponse
        }
    }
}

/// The radio: scanning and opening connections.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Whether the radio is powered and usable.
    async fn is_radio_enabled(&self) -> bool;

    /// Devices the platform already knows about (bonded or connected), reported
    /// as advertisements so the scanner can match them with the same filter.
    async fn known_devices(&self) -> Result<Vec<Advertisement>, BleError>;

    /// Starts a radio scan. The stream keeps yielding until `stop_scan` is called.
    async fn start_scan(&self, filter: &ScanFilter) -> Result<AdvertisementStream, BleError>;

    /// Stops the active radio scan, if any.
    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Opens a GATT connection. Each call produces an independent transport.
    async fn connect(&self, device: &DeviceHandle) -> Result<Box<dyn GattTransport>, BleError>;
}

/// One open GATT connection. Only one operation may be outstanding at a time;
/// `GattSession` guarantees that, implementations may rely on it.
#[async_trait]
pub trait GattTransport: Send + Sync {
    async fn discover_services(&self) -> Result<ServiceCatalog, BleError>;

    async fn read_characteristic(&self, characteristic: &CharacteristicRef) -> Result<Vec<u8>, BleError>;

    async fn write_characteristic(
        &self,
        characteristic: &CharacteristicRef,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError>;

    /// Resolves once the link is lost, whoever initiated it.
    async fn disconnected(&self);

    async fn disconnect(&self) -> Result<(), BleError>;
}
