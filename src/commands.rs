//! UI commands
//! This module defines all the commands a front end can invoke. Errors are
//! flattened to display strings for the UI.

use crate::core::WizardStatus;
use crate::core::bluetooth::{DeviceHandle, SwitchState};
use crate::state::AppState;

/// Scans for the Light Wizard, connects, and reads the switch
///
/// # Arguments
/// * `app_state` - The application state
///
/// # Returns
/// The switch position read right after connecting. Calling this while the
/// scan is still running stops the scan instead.
pub async fn start_scan(app_state: &AppState) -> Result<SwitchState, String> {
    let controller = app_state.get_controller_arc();
    controller.bootstrap().await.map_err(|e| e.to_string())
}

/// Stops a running scan. Returns whether one was running.
pub fn stop_scan(app_state: &AppState) -> bool {
    app_state.controller.stop_scan()
}

pub async fn get_switch_state(app_state: &AppState) -> Result<SwitchState, String> {
    let controller = app_state.get_controller_arc();
    controller.get_switch_state().await.map_err(|e| e.to_string())
}

/// Flips the switch and returns the verified new position
pub async fn toggle_switch(app_state: &AppState) -> Result<SwitchState, String> {
    let controller = app_state.get_controller_arc();
    controller.toggle().await.map_err(|e| e.to_string())
}

/// Disconnects from the currently connected device
pub async fn disconnect(app_state: &AppState) -> Result<(), String> {
    app_state.controller.disconnect().await;
    Ok(())
}

pub fn get_status(app_state: &AppState) -> WizardStatus {
    app_state.controller.status()
}

pub async fn get_device(app_state: &AppState) -> Option<DeviceHandle> {
    app_state.controller.device().await
}

pub async fn is_bluetooth_enabled(app_state: &AppState) -> bool {
    app_state.controller.is_radio_enabled().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[tokio::test]
    async fn commands_drive_the_simulated_wizard() {
        let state = AppState::simulated(AppConfig::default());
        assert!(is_bluetooth_enabled(&state).await);
        assert_eq!(get_status(&state), WizardStatus::Loading);

        assert_eq!(start_scan(&state).await, Ok(SwitchState::Off));
        assert_eq!(get_device(&state).await.unwrap().name, "Light Wizard");
        assert_eq!(toggle_switch(&state).await, Ok(SwitchState::On));
        assert_eq!(get_switch_state(&state).await, Ok(SwitchState::On));

        disconnect(&state).await.unwrap();
        assert!(get_switch_state(&state).await.is_err());
        assert!(!stop_scan(&state));
    }
}
