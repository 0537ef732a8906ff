//! Permission gate for Bluetooth access
//! Tracks whether the runtime granted the capabilities scanning and connecting
//! need, and turns the platform's grant/deny prompts into one awaitable answer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::oneshot;

/// A runtime capability the BLE stack depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Location,
    BluetoothScan,
    BluetoothConnect,
}

impl Capability {
    /// Everything the full scan/connect/read/write flow needs.
    pub const ALL: [Capability; 3] = [
        Capability::Location,
        Capability::BluetoothScan,
        Capability::BluetoothConnect,
    ];

    /// What a radio scan needs.
    pub const SCAN: [Capability; 2] = [Capability::Location, Capability::BluetoothScan];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Location => f.write_str("location"),
            Self::BluetoothScan => f.write_str("bluetooth-scan"),
            Self::BluetoothConnect => f.write_str("bluetooth-connect"),
        }
    }
}

/// The platform's permission system.
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    fn check_granted(&self, capability: Capability) -> bool;

    /// Shows the platform prompt and resolves with the user's answer.
    async fn request_grant(&self, capability: Capability) -> bool;
}

/// Desktop platforms gate Bluetooth at the adapter, not per app.
#[derive(Debug, Clone, Copy, Default)]
pub struct DesktopPermissions;

#[async_trait]
impl PermissionProvider for DesktopPermissions {
    fn check_granted(&self, _capability: Capability) -> bool {
        true
    }

    async fn request_grant(&self, _capability: Capability) -> bool {
        true
    }
}

type Waiters = HashMap<Capability, Vec<oneshot::Sender<bool>>>;

/// Aggregates permission requests. Concurrent callers asking for the same
/// capability share one platform prompt.
pub struct PermissionGate {
    provider: Arc<dyn PermissionProvider>,
    in_flight: Mutex<Waiters>,
}

enum Ticket {
    Leader,
    Follower(oneshot::Receiver<bool>),
}

impl PermissionGate {
    pub fn new(provider: Arc<dyn PermissionProvider>) -> Self {
        Self {
            provider,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Checks current grants without prompting.
    pub fn is_granted(&self, capabilities: &[Capability]) -> bool {
        capabilities
            .iter()
            .all(|capability| self.provider.check_granted(*capability))
    }

    /// Resolves `true` once every capability is granted, prompting for the
    /// missing ones one after another. Resolves `false` on the first denial.
    pub async fn ensure_granted(&self, capabilities: &[Capability]) -> bool {
        for capability in capabilities {
            if self.provider.check_granted(*capability) {
                continue;
            }
            if !self.request(*capability).await {
                warn!("Permission {} was denied", capability);
                return false;
            }
        }
        true
    }

    async fn request(&self, capability: Capability) -> bool {
        let ticket = {
            let mut in_flight = self.lock();
            match in_flight.get_mut(&capability) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Ticket::Follower(rx)
                }
                None => {
                    in_flight.insert(capability, Vec::new());
                    Ticket::Leader
                }
            }
        };

        match ticket {
            Ticket::Follower(rx) => {
                debug!("Joining in-flight {} permission request", capability);
                rx.await.unwrap_or(false)
            }
            Ticket::Leader => {
                let mut resolution = Resolution {
                    gate: self,
                    capability,
                    granted: false,
                };
                info!("Requesting {} permission", capability);
                resolution.granted = self.provider.request_grant(capability).await;
                resolution.granted
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Waiters> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Answers every follower of one request. Runs on drop so a cancelled leader
/// still releases its followers (with a denial).
struct Resolution<'a> {
    gate: &'a PermissionGate,
    capability: Capability,
    granted: bool,
}

impl Drop for Resolution<'_> {
    fn drop(&mut self) {
        let waiters = self.gate.lock().remove(&self.capability).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(self.granted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Grants what is listed in `grantable` after a short delay.
    struct ScriptedPermissions {
        granted: Mutex<HashSet<Capability>>,
        grantable: HashSet<Capability>,
        prompts: AtomicUsize,
    }

    impl ScriptedPermissions {
        fn new(granted: &[Capability], grantable: &[Capability]) -> Arc<Self> {
            Arc::new(Self {
                granted: Mutex::new(granted.iter().copied().collect()),
                grantable: grantable.iter().copied().collect(),
                prompts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PermissionProvider for ScriptedPermissions {
        fn check_granted(&self, capability: Capability) -> bool {
            self.granted.lock().unwrap().contains(&capability)
        }

        async fn request_grant(&self, capability: Capability) -> bool {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            let ok = self.grantable.contains(&capability);
            if ok {
                self.granted.lock().unwrap().insert(capability);
            }
            ok
        }
    }

    #[tokio::test]
    async fn resolves_immediately_when_already_granted() {
        let provider = ScriptedPermissions::new(&Capability::ALL, &[]);
        let gate = PermissionGate::new(provider.clone());
        assert!(gate.ensure_granted(&Capability::ALL).await);
        assert_eq!(provider.prompts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prompts_only_for_missing_capabilities() {
        let provider = ScriptedPermissions::new(&[Capability::Location], &Capability::ALL);
        let gate = PermissionGate::new(provider.clone());
        assert!(gate.ensure_granted(&Capability::ALL).await);
        assert_eq!(provider.prompts.load(Ordering::SeqCst), 2);
        assert!(gate.is_granted(&Capability::ALL));
    }

    #[tokio::test]
    async fn any_denial_resolves_false() {
        let provider = ScriptedPermissions::new(&[], &[Capability::Location]);
        let gate = PermissionGate::new(provider);
        assert!(!gate.ensure_granted(&Capability::SCAN).await);
        assert!(!gate.is_granted(&Capability::SCAN));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_prompt() {
        let provider = ScriptedPermissions::new(&[], &[Capability::BluetoothScan]);
        let gate = Arc::new(PermissionGate::new(provider.clone()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.ensure_granted(&[Capability::BluetoothScan]).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(provider.prompts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_leader_releases_followers() {
        let provider = ScriptedPermissions::new(&[], &[Capability::BluetoothScan]);
        let gate = Arc::new(PermissionGate::new(provider));

        let leader = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ensure_granted(&[Capability::BluetoothScan]).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ensure_granted(&[Capability::BluetoothScan]).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let answered = tokio::time::timeout(Duration::from_secs(1), follower).await;
        assert!(!answered.unwrap().unwrap());
    }
}
