pub mod wizard_config;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::wizard_config::WizardConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub wizard: WizardConfig,
}

impl AppConfig {
    pub async fn load() -> Result<Self> {
        Ok(AppConfig {
            wizard: WizardConfig::load_config().await?,
        })
    }
}
