//! Application state management
//! This module defines and manages the global application state.

use std::sync::Arc;

use anyhow::Result;
use log::info;

use crate::config::AppConfig;
use crate::core::bluetooth::{BleAdapter, FakeAdapter};
use crate::core::{DesktopPermissions, PermissionGate, WizardController};

/// Global application state
pub struct AppState {
    /// The Light Wizard controller instance
    pub controller: Arc<WizardController>,
    pub config: AppConfig,
}

impl AppState {
    /// Creates an AppState on top of the system's Bluetooth adapter
    #[cfg(feature = "bluest")]
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("Initializing Bluetooth adapter...");
        let adapter = crate::core::bluetooth::BluestAdapter::new().await?;
        let permissions = Arc::new(PermissionGate::new(Arc::new(DesktopPermissions)));
        Ok(Self::with_adapter(Arc::new(adapter), permissions, config))
    }

    /// Creates an AppState backed by the simulated Light Wizard
    pub fn simulated(config: AppConfig) -> Self {
        info!("Using simulated Bluetooth adapter");
        let adapter = FakeAdapter::simulated_wizard();
        let permissions = adapter.permission_gate();
        Self::with_adapter(adapter, permissions, config)
    }

    pub fn with_adapter(
        adapter: Arc<dyn BleAdapter>,
        permissions: Arc<PermissionGate>,
        config: AppConfig,
    ) -> Self {
        let controller = WizardController::new(adapter, permissions, config.wizard.clone());
        Self {
            controller: Arc::new(controller),
            config,
        }
    }

    /// Gets a reference to the controller
    pub fn get_controller_arc(&self) -> Arc<WizardController> {
        self.controller.clone()
    }
}
