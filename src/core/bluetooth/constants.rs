//! Constants used throughout the application
//! This module contains the wire-level identifiers of the Light Wizard
//! peripheral and the default timing values for Bluetooth operations.

use uuid::Uuid;

/// The advertised local name of the Light Wizard
pub const WIZARD_NAME: &str = "Light Wizard";

/// The UUID of the Light Wizard light-switch service
pub const UUID_LIGHT_SWITCH_SERVICE: Uuid = Uuid::from_u128(0x0ca2d9fa_785e_4811_a8c2_d4233409d79f);

/// The UUID of the switch characteristic inside the light-switch service
pub const UUID_SWITCH_CHAR: Uuid = Uuid::from_u128(0xe11d545a_908c_4e0d_b765_97d13c33aa50);

/// Switch value byte for "off"
pub const SWITCH_OFF: u8 = 0x00;

/// Switch value byte for "on"
pub const SWITCH_ON: u8 = 0x01;

/// Scan duration in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 10;

/// Timeout for connect, discovery, read and write in seconds
pub const BLUETOOTH_OPERATION_TIMEOUT_SECS: u64 = 10;
