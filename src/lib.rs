//! Light Wizard client library
//! Finds a Light Wizard over Bluetooth LE, connects to it, and reads or flips
//! its light switch.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;

use log::Level;

use logging::UiLogger;

/// Installs the UI logger, falling back to env_logger if a logger is already set.
pub fn setup_logging(level: Level) -> Option<&'static UiLogger> {
    match UiLogger::init(level) {
        Ok(logger) => {
            log::info!("Logging initialized");
            Some(logger)
        }
        Err(_) => {
            let _ = env_logger::builder()
                .filter_level(level.to_level_filter())
                .try_init();
            None
        }
    }
}
