use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::{
    BLUETOOTH_OPERATION_TIMEOUT_SECS, DEFAULT_SCAN_DURATION_SECS, ScanFilter,
    UUID_LIGHT_SWITCH_SERVICE, WIZARD_NAME,
};
use crate::utils::ensure_directory_exists;

const CONFIG_FILE_NAME: &str = "wizard_config.json";
const CONFIG_DIR_NAME: &str = "light-wizard";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WizardConfig {
    /// Advertised local name to look for. Matched exactly.
    pub device_name: String,

    /// Also require the light-switch service UUID in the advertisement.
    pub match_service: bool,

    /// How long one scan listens before giving up.
    pub scan_timeout_secs: u64,

    /// Bound on connect, service discovery and every read or write.
    pub operation_timeout_secs: u64,

    /// End the scan at the first match instead of waiting out the timeout.
    pub stop_scan_on_match: bool,

    /// Ignore advertisements weaker than this (dBm).
    pub min_rssi: Option<i16>,
}

impl Default for WizardConfig {
    fn default() -> Self {
        WizardConfig {
            device_name: WIZARD_NAME.to_string(),
            match_service: false,
            scan_timeout_secs: DEFAULT_SCAN_DURATION_SECS,
            operation_timeout_secs: BLUETOOTH_OPERATION_TIMEOUT_SECS,
            stop_scan_on_match: true,
            min_rssi: None,
        }
    }
}

impl WizardConfig {
    pub fn scan_filter(&self) -> ScanFilter {
        ScanFilter {
            name: Some(self.device_name.clone()),
            service: self.match_service.then_some(UUID_LIGHT_SWITCH_SERVICE),
            min_rssi: self.min_rssi,
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Directory the configuration lives in, `None` if the platform has no config dir.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME))
    }

    /// Loads the config from the user's configuration directory.
    pub async fn load_config() -> Result<Self> {
        let config_dir = Self::config_dir().context("No configuration directory on this platform")?;
        Self::load_from(&config_dir.join(CONFIG_FILE_NAME)).await
    }

    /// Loads the config from `file_path`, falling back to defaults when the file does not exist.
    pub async fn load_from(file_path: &Path) -> Result<Self> {
        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let config: Self = serde_json::from_str(&config_json)
            .with_context(|| format!("Invalid config file {:?}", file_path))?;

        info!("Config loaded from {:?}", file_path);
        Ok(config)
    }

    /// Saves the current config to the user's configuration directory.
    pub async fn save_config(&self) -> Result<PathBuf> {
        let config_dir = Self::config_dir().context("No configuration directory on this platform")?;
        let file_path = config_dir.join(CONFIG_FILE_NAME);
        self.save_to(&file_path).await?;
        Ok(file_path)
    }

    pub async fn save_to(&self, file_path: &Path) -> Result<()> {
        if let Some(parent) = file_path.parent() {
            ensure_directory_exists(parent).await?;
        }

        let config_json = match serde_json::to_string_pretty(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize wizard config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;

        info!("Wizard config saved to {:?}.", file_path);
        Ok(())
    }
}
