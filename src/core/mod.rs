//! Core functionality for the Light Wizard client
//! This module contains permission handling, the Bluetooth layer, and the
//! controller that ties them together for the Light Wizard.

pub mod bluetooth;
pub mod controller;
pub mod permission;

// Re-export commonly used types
pub use controller::{WizardController, WizardStatus};
pub use permission::{Capability, DesktopPermissions, PermissionGate, PermissionProvider};
