//! Device discovery for the Light Wizard
//! One scan is one cancellable, time-bounded unit of work that yields at most one device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::adapter::BleAdapter;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::types::{Advertisement, DeviceHandle, ScanFilter};
use crate::core::permission::{Capability, PermissionGate};

struct ActiveScan {
    id: u64,
    cancel_token: CancellationToken,
}

pub struct DeviceScanner {
    adapter: Arc<dyn BleAdapter>,
    permissions: Arc<PermissionGate>,
    active: Mutex<Option<ActiveScan>>,
    /// Held from starting the radio scan until it is stopped again.
    radio: AsyncMutex<()>,
    next_id: AtomicU64,
    stop_on_match: bool,
}

impl DeviceScanner {
    pub fn new(adapter: Arc<dyn BleAdapter>, permissions: Arc<PermissionGate>) -> Self {
        Self {
            adapter,
            permissions,
            active: Mutex::new(None),
            radio: AsyncMutex::new(()),
            next_id: AtomicU64::new(0),
            stop_on_match: true,
        }
    }

    /// Keep listening until the timeout even after a match. The result is the same
    /// first match either way.
    pub fn with_stop_on_match(mut self, stop_on_match: bool) -> Self {
        self.stop_on_match = stop_on_match;
        self
    }

    pub fn is_scanning(&self) -> bool {
        self.lock_active().is_some()
    }

    /// Scans for the first device matching `filter`.
    ///
    /// Calling this while a scan is running stops that scan instead and
    /// returns `ScanCancelled`; the stopped scan hands back whatever it matched so far.
    pub async fn scan(&self, filter: &ScanFilter, timeout: Duration) -> Result<DeviceHandle, BleError> {
        if self.stop_scan() {
            return Err(BleError::ScanCancelled);
        }

        if !self.permissions.is_granted(&Capability::SCAN) {
            warn!("Scan refused: scan permissions are missing");
            return Err(BleError::PermissionDenied);
        }
        if !self.adapter.is_radio_enabled().await {
            warn!("Scan refused: Bluetooth radio is off");
            return Err(BleError::AdapterDisabled);
        }

        info!("Checking for known devices");
        match self.adapter.known_devices().await {
            Ok(known) => {
                let device = known
                    .iter()
                    .find(|adv| filter.is_match(adv))
                    .and_then(Advertisement::device_handle);
                if let Some(device) = device {
                    info!("Found known device {}, skipping radio scan", device);
                    return Ok(device);
                }
            }
            Err(e) => warn!("Could not list known devices: {}", e),
        }

        let cancel_token = CancellationToken::new();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut active = self.lock_active();
            if active.is_some() {
                // another caller started a scan while the adapter was being checked
                return Err(BleError::ScanCancelled);
            }
            *active = Some(ActiveScan {
                id,
                cancel_token: cancel_token.clone(),
            });
        }

        let outcome = {
            // a stopped scan may still be shutting its radio scan down
            let _radio = self.radio.lock().await;
            if cancel_token.is_cancelled() {
                Err(BleError::ScanCancelled)
            } else {
                let outcome = self.run_scan(filter, timeout, &cancel_token).await;
                if let Err(e) = self.adapter.stop_scan().await {
                    error!("Failed to stop radio scan: {}", e);
                }
                outcome
            }
        };
        {
            let mut active = self.lock_active();
            if active.as_ref().is_some_and(|scan| scan.id == id) {
                *active = None;
            }
        }
        outcome
    }

    async fn run_scan(
        &self,
        filter: &ScanFilter,
        timeout: Duration,
        cancel_token: &CancellationToken,
    ) -> Result<DeviceHandle, BleError> {
        info!("Starting bluetooth scan for {:?}", filter);
        let mut scan_stream = self.adapter.start_scan(filter).await?;
        let deadline = Instant::now() + timeout;

        let mut candidates: Vec<Advertisement> = Vec::new();
        let mut first_match: Option<DeviceHandle> = None;
        let mut cancelled = false;

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(advertisement) => {
                            let Some(name) = advertisement.name.as_deref() else {
                                continue;
                            };
                            debug!("Found device - Name: {}, ID: {}, RSSI: {:?}", name, advertisement.id, advertisement.rssi);
                            if first_match.is_none() && filter.is_match(&advertisement) {
                                first_match = advertisement.device_handle();
                                info!("Matched device {:?}", first_match);
                            }
                            candidates.push(advertisement);
                            if first_match.is_some() && self.stop_on_match {
                                break;
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    info!("Scan timed out after {:?}", timeout);
                    break;
                }
                _ = cancel_token.cancelled() => {
                    info!("Scan stopped on request");
                    cancelled = true;
                    break;
                }
            }
        }
        drop(scan_stream);
        debug!("Scan saw {} named advertisements", candidates.len());

        match first_match {
            Some(device) => Ok(device),
            None if cancelled => Err(BleError::ScanCancelled),
            None => Err(BleError::ScanNotFound),
        }
    }

    /// Stops the running scan, if any. Returns whether one was running.
    pub fn stop_scan(&self) -> bool {
        match self.lock_active().take() {
            Some(scan) => {
                info!("Stopping Bluetooth scan.");
                scan.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveScan>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::fake::FakeAdapter;
    use crate::core::permission::DesktopPermissions;

    fn gate() -> Arc<PermissionGate> {
        Arc::new(PermissionGate::new(Arc::new(DesktopPermissions)))
    }

    fn wizard_filter() -> ScanFilter {
        ScanFilter::by_name("Light Wizard")
    }

    #[tokio::test]
    async fn returns_first_matching_advertisement() {
        let adapter = FakeAdapter::builder()
            .advertise(Advertisement::new("other", Some("Other")))
            .advertise(Advertisement::new("nameless", None))
            .advertise(Advertisement::new("wizard-1", Some("Light Wizard")))
            .advertise(Advertisement::new("wizard-2", Some("Light Wizard")))
            .build();
        let scanner = DeviceScanner::new(adapter.clone(), gate()).with_stop_on_match(false);

        let device = scanner.scan(&wizard_filter(), Duration::from_millis(200)).await.unwrap();
        assert_eq!(device, DeviceHandle::new("wizard-1", "Light Wizard"));
        assert!(!adapter.is_scan_active());
        assert!(!scanner.is_scanning());
    }

    #[tokio::test]
    async fn times_out_with_not_found() {
        let adapter = FakeAdapter::builder()
            .advertise(Advertisement::new("other", Some("Other")))
            .advertise(Advertisement::new("lower", Some("light wizard")))
            .build();
        let scanner = DeviceScanner::new(adapter.clone(), gate());

        let result = scanner.scan(&wizard_filter(), Duration::from_millis(100)).await;
        assert_eq!(result, Err(BleError::ScanNotFound));
        assert!(!adapter.is_scan_active());
    }

    #[tokio::test]
    async fn refuses_without_permission_and_skips_the_radio() {
        let adapter = FakeAdapter::builder().deny_permissions().build();
        let scanner = DeviceScanner::new(adapter.clone(), adapter.permission_gate());

        let result = scanner.scan(&wizard_filter(), Duration::from_millis(100)).await;
        assert_eq!(result, Err(BleError::PermissionDenied));
        assert_eq!(adapter.scans_started(), 0);
    }

    #[tokio::test]
    async fn refuses_when_radio_is_off() {
        let adapter = FakeAdapter::builder().radio_enabled(false).build();
        let scanner = DeviceScanner::new(adapter.clone(), gate());

        let result = scanner.scan(&wizard_filter(), Duration::from_millis(100)).await;
        assert_eq!(result, Err(BleError::AdapterDisabled));
        assert_eq!(adapter.scans_started(), 0);
    }

    #[tokio::test]
    async fn known_device_skips_the_scan() {
        let adapter = FakeAdapter::builder()
            .known(Advertisement::new("bonded", Some("Light Wizard")))
            .build();
        let scanner = DeviceScanner::new(adapter.clone(), gate());

        let device = scanner.scan(&wizard_filter(), Duration::from_millis(100)).await.unwrap();
        assert_eq!(device.id, "bonded");
        assert_eq!(adapter.scans_started(), 0);
    }

    #[tokio::test]
    async fn second_scan_call_toggles_the_first_off() {
        let adapter = FakeAdapter::builder()
            .advertise(Advertisement::new("other", Some("Other")))
            .build();
        let scanner = Arc::new(DeviceScanner::new(adapter.clone(), gate()));

        let first = {
            let scanner = scanner.clone();
            tokio::spawn(async move { scanner.scan(&wizard_filter(), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scanner.is_scanning());

        let toggle = scanner.scan(&wizard_filter(), Duration::from_secs(5)).await;
        assert_eq!(toggle, Err(BleError::ScanCancelled));

        let stopped = tokio::time::timeout(Duration::from_secs(1), first).await.unwrap().unwrap();
        assert_eq!(stopped, Err(BleError::ScanCancelled));
        assert!(!adapter.is_scan_active());
    }

    #[tokio::test]
    async fn rescan_right_after_stop_is_not_cut_short() {
        let adapter = FakeAdapter::builder()
            .advertise(Advertisement::new("other", Some("Other")))
            .advertise(Advertisement::new("wizard", Some("Light Wizard")))
            .advertise_interval(Duration::from_millis(50))
            .build();
        let scanner = Arc::new(DeviceScanner::new(adapter.clone(), gate()));

        let first = {
            let scanner = scanner.clone();
            tokio::spawn(async move { scanner.scan(&wizard_filter(), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(scanner.stop_scan());

        let second = scanner.scan(&wizard_filter(), Duration::from_secs(2)).await;
        assert_eq!(second, Ok(DeviceHandle::new("wizard", "Light Wizard")));
        assert_eq!(first.await.unwrap(), Err(BleError::ScanCancelled));
        assert_eq!(adapter.scans_started(), 2);
        assert!(!adapter.is_scan_active());
    }

    #[tokio::test]
    async fn radio_failure_is_not_reported_as_not_found() {
        let adapter = FakeAdapter::builder()
            .advertise(Advertisement::new("wizard", Some("Light Wizard")))
            .fail_scan("scan already in progress")
            .build();
        let scanner = DeviceScanner::new(adapter.clone(), gate());

        let result = scanner.scan(&wizard_filter(), Duration::from_millis(100)).await;
        assert_eq!(result, Err(BleError::TransportError("scan already in progress".to_string())));
        assert!(!scanner.is_scanning());
    }

    #[tokio::test]
    async fn stopped_scan_returns_partial_match() {
        let adapter = FakeAdapter::builder()
            .advertise(Advertisement::new("wizard", Some("Light Wizard")))
            .build();
        let scanner = Arc::new(DeviceScanner::new(adapter.clone(), gate()).with_stop_on_match(false));

        let running = {
            let scanner = scanner.clone();
            tokio::spawn(async move { scanner.scan(&wizard_filter(), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scanner.stop_scan());

        let result = tokio::time::timeout(Duration::from_secs(1), running).await.unwrap().unwrap();
        assert_eq!(result.unwrap().id, "wizard");
        assert!(!adapter.is_scan_active());
    }
}
