//! Light Wizard controller
//! Drives the bootstrap sequence (permissions, scan, connect, discover, initial read)
//! and user toggles, and publishes one three-state status for the UI to render.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, watch};

use crate::config::wizard_config::WizardConfig;
use crate::core::bluetooth::{
    BleAdapter, BleError, CharacteristicRef, ConnectionState, DeviceHandle, DeviceScanner,
    GattSession, SwitchState, UUID_LIGHT_SWITCH_SERVICE, UUID_SWITCH_CHAR,
};
use crate::core::permission::{Capability, PermissionGate};

/// The switch characteristic of the light-switch service.
pub const SWITCH_CHARACTERISTIC: CharacteristicRef =
    CharacteristicRef::new(UUID_LIGHT_SWITCH_SERVICE, UUID_SWITCH_CHAR);

/// What the UI shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum WizardStatus {
    Loading,
    Error(String),
    Ready(SwitchState),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Status and last known switch position, shared with the link watcher.
struct Published {
    status: watch::Sender<WizardStatus>,
    last_state: Mutex<Option<SwitchState>>,
    /// Bumped whenever the current session is replaced or closed on purpose.
    generation: AtomicU64,
}

impl Published {
    fn ready(&self, state: SwitchState) {
        *lock(&self.last_state) = Some(state);
        self.status.send_replace(WizardStatus::Ready(state));
    }

    fn error(&self, err: &BleError) {
        self.status.send_replace(WizardStatus::Error(err.to_string()));
    }
}

pub struct WizardController {
    adapter: Arc<dyn BleAdapter>,
    permissions: Arc<PermissionGate>,
    scanner: DeviceScanner,
    config: WizardConfig,
    session: AsyncMutex<Option<Arc<GattSession>>>,
    toggling: AsyncMutex<()>,
    published: Arc<Published>,
}

impl WizardController {
    pub fn new(adapter: Arc<dyn BleAdapter>, permissions: Arc<PermissionGate>, config: WizardConfig) -> Self {
        let scanner = DeviceScanner::new(adapter.clone(), permissions.clone())
            .with_stop_on_match(config.stop_scan_on_match);
        let (status, _) = watch::channel(WizardStatus::Loading);
        Self {
            adapter,
            permissions,
            scanner,
            config,
            session: AsyncMutex::new(None),
            toggling: AsyncMutex::new(()),
            published: Arc::new(Published {
                status,
                last_state: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn status(&self) -> WizardStatus {
        self.published.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<WizardStatus> {
        self.published.status.subscribe()
    }

    /// The switch position as last read from the device.
    pub fn last_known_state(&self) -> Option<SwitchState> {
        *lock(&self.published.last_state)
    }

    pub async fn is_radio_enabled(&self) -> bool {
        self.adapter.is_radio_enabled().await
    }

    /// The device of the current session, if any. Includes a session still connecting.
    pub async fn device(&self) -> Option<DeviceHandle> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.device().clone())
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn stop_scan(&self) -> bool {
        self.scanner.stop_scan()
    }

    /// Finds the Light Wizard, connects, and reads the switch.
    ///
    /// Calling it again while it is still scanning stops the scan. Calling it once
    /// connected replaces the current session with a fresh one.
    pub async fn bootstrap(&self) -> Result<SwitchState, BleError> {
        let generation = self.published.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.published.status.send_replace(WizardStatus::Loading);
        let result = self.try_bootstrap(generation).await;

        // a disconnect or a newer bootstrap owns the status now
        let superseded = self.published.generation.load(Ordering::SeqCst) != generation;
        match result {
            Ok(state) => {
                info!("Light Wizard ready, switch is {}", state);
                if !superseded {
                    self.published.ready(state);
                }
                Ok(state)
            }
            Err(e) => {
                error!("Bootstrap failed: {}", e);
                if !superseded {
                    self.published.error(&e);
                }
                Err(e)
            }
        }
    }

    async fn try_bootstrap(&self, generation: u64) -> Result<SwitchState, BleError> {
        if !self.permissions.ensure_granted(&Capability::ALL).await {
            return Err(BleError::PermissionDenied);
        }

        let device = self
            .scanner
            .scan(&self.config.scan_filter(), self.config.scan_timeout())
            .await?;
        info!("Found {}", device);

        let session = Arc::new(
            GattSession::new(self.adapter.clone(), device).with_operation_timeout(self.config.operation_timeout()),
        );
        // published before connecting so a disconnect can reach it
        let previous = {
            let mut current = self.session.lock().await;
            if self.published.generation.load(Ordering::SeqCst) != generation {
                return Err(BleError::ScanCancelled);
            }
            *lock(&self.published.last_state) = None;
            current.replace(session.clone())
        };
        if let Some(previous) = previous {
            info!("Replacing session with {}", previous.device());
            previous.disconnect().await;
        }

        let outcome = establish(&session).await;

        let mut current = self.session.lock().await;
        let owned = current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &session));
        match outcome {
            Ok(state) if owned && !session.is_terminal() => {
                tokio::spawn(watch_session(
                    session.subscribe_state(),
                    self.published.clone(),
                    generation,
                ));
                Ok(state)
            }
            outcome => {
                if owned {
                    *current = None;
                }
                drop(current);
                session.disconnect().await;
                Err(outcome.err().unwrap_or(BleError::Disconnected))
            }
        }
    }

    /// Reads the switch from the device.
    pub async fn get_switch_state(&self) -> Result<SwitchState, BleError> {
        let session = self.current_session().await?;
        match read_switch(&session).await {
            Ok(state) => {
                self.published.ready(state);
                Ok(state)
            }
            Err(e) => Err(self.fail(&session, e).await),
        }
    }

    /// Flips the switch and returns the position the device reports afterwards.
    ///
    /// A failed write leaves the switch where it was.
    pub async fn toggle(&self) -> Result<SwitchState, BleError> {
        let _toggling = self.toggling.lock().await;
        let session = self.current_session().await?;

        let current = match self.last_known_state() {
            Some(state) => state,
            None => match read_switch(&session).await {
                Ok(state) => state,
                Err(e) => return Err(self.fail(&session, e).await),
            },
        };
        let target = current.toggled();
        info!("Switching light {} -> {}", current, target);

        if let Err(e) = session.write(SWITCH_CHARACTERISTIC, &target.to_bytes(), true).await {
            return Err(self.fail(&session, e).await);
        }

        match read_switch(&session).await {
            Ok(state) => {
                if state != target {
                    warn!("Device reports {} after writing {}", state, target);
                }
                self.published.ready(state);
                Ok(state)
            }
            Err(e) => Err(self.fail(&session, e).await),
        }
    }

    /// Closes the connection, or abandons a bootstrap still scanning or connecting.
    /// The controller needs a new bootstrap afterwards.
    pub async fn disconnect(&self) {
        self.published.generation.fetch_add(1, Ordering::SeqCst);
        self.scanner.stop_scan();
        let session = self.session.lock().await.take();
        *lock(&self.published.last_state) = None;
        if let Some(session) = session {
            info!("Disconnecting from {}", session.device());
            session.disconnect().await;
        }
        self.published.error(&BleError::Disconnected);
    }

    async fn current_session(&self) -> Result<Arc<GattSession>, BleError> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or(BleError::NotReady(ConnectionState::Disconnected))
    }

    /// Publishes `err` and drops the session if it is finished.
    async fn fail(&self, session: &Arc<GattSession>, err: BleError) -> BleError {
        if let BleError::NotReady(_) = err {
            // still connecting; the bootstrap reports the outcome
            return err;
        }
        error!("Light Wizard operation failed: {}", err);
        if let BleError::InvalidValue(_) = err {
            *lock(&self.published.last_state) = None;
        }
        if session.is_terminal() {
            let mut current = self.session.lock().await;
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, session)) {
                *current = None;
                *lock(&self.published.last_state) = None;
            }
        }
        self.published.error(&err);
        err
    }
}

/// Connects, checks for the switch, and reads it.
async fn establish(session: &GattSession) -> Result<SwitchState, BleError> {
    session.connect().await?;
    let has_switch = session
        .catalog()
        .is_some_and(|catalog| catalog.contains(&SWITCH_CHARACTERISTIC));
    if !has_switch {
        return Err(BleError::DiscoveryError("light switch service not found".to_string()));
    }
    read_switch(session).await
}

async fn read_switch(session: &GattSession) -> Result<SwitchState, BleError> {
    let value = session.read(SWITCH_CHARACTERISTIC).await?;
    SwitchState::from_bytes(&value)
}

/// Reports the end of a session the controller did not close itself.
async fn watch_session(mut states: watch::Receiver<ConnectionState>, published: Arc<Published>, generation: u64) {
    let end = match states
        .wait_for(|state| matches!(state, ConnectionState::Disconnected | ConnectionState::Failed(_)))
        .await
    {
        Ok(end) => end.clone(),
        Err(_) => return,
    };
    if published.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    warn!("Light Wizard session ended: {}", end);
    *lock(&published.last_state) = None;
    let reason = match end {
        ConnectionState::Failed(reason) => reason,
        _ => BleError::Disconnected.to_string(),
    };
    published.status.send_replace(WizardStatus::Error(reason));
}
