//! Bluetooth functionality for the Light Wizard client
//! This module handles all bluetooth operations including scanning,
//! connecting, and reading/writing characteristics of the Light Wizard.

mod adapter;
#[cfg(feature = "bluest")]
mod bluest_backend;
mod constants;
mod error;
pub mod fake;
mod scanner;
mod session;
mod types;

// Re-export types that should be publicly accessible
pub use adapter::{AdvertisementStream, BleAdapter, GattTransport, WriteMode};
#[cfg(feature = "bluest")]
pub use bluest_backend::BluestAdapter;
pub use constants::*; // Re-export all constants
pub use error::BleError;
pub use fake::{FakeAdapter, FakePeripheral, TransportCall};
pub use scanner::DeviceScanner;
pub use session::GattSession;
pub use types::{
    Advertisement, CharacteristicRef, ConnectionState, DeviceHandle, ScanFilter, ServiceCatalog,
    SwitchState,
};
