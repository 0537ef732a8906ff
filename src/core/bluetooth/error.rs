//! Error taxonomy for the Bluetooth layer
//! Every failure the scanner, session, or controller can hit is one of these variants.

use thiserror::Error;

use crate::core::bluetooth::types::{CharacteristicRef, ConnectionState};

/// Errors surfaced by scanning, connecting, and characteristic I/O.
///
/// All variants are recoverable from the caller's point of view; session-level
/// failures additionally leave the owning `GattSession` terminal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    #[error("required Bluetooth permissions were not granted")]
    PermissionDenied,

    #[error("the Bluetooth radio is off or unavailable")]
    AdapterDisabled,

    #[error("no matching device was found")]
    ScanNotFound,

    #[error("the scan was stopped before a device was found")]
    ScanCancelled,

    #[error("connection failed: {0}")]
    ConnectError(String),

    #[error("service discovery failed: {0}")]
    DiscoveryError(String),

    #[error("unknown characteristic {0}")]
    UnknownCharacteristic(CharacteristicRef),

    #[error("session is not ready for characteristic I/O (state: {0})")]
    NotReady(ConnectionState),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("the device disconnected")]
    Disconnected,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("unexpected characteristic value: {0:02x?}")]
    InvalidValue(Vec<u8>),
}

impl BleError {
    /// Whether this failure leaves a session unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectError(_) | Self::DiscoveryError(_) | Self::Disconnected | Self::Timeout(_)
        )
    }
}
