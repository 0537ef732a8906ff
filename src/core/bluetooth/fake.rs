//! Simulated BLE adapter
//! A scripted, in-memory radio with one peripheral behind it. Used by the
//! `--simulate` mode of the CLI and by the test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::debug;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::adapter::{AdvertisementStream, BleAdapter, GattTransport, WriteMode};
use crate::core::bluetooth::constants::{UUID_LIGHT_SWITCH_SERVICE, UUID_SWITCH_CHAR};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::types::{
    Advertisement, CharacteristicRef, DeviceHandle, ScanFilter, ServiceCatalog, SwitchState,
};
use crate::core::permission::{Capability, PermissionGate, PermissionProvider};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A transport-level call observed by the simulated peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect(String),
    Discover,
    Read(CharacteristicRef),
    Write(CharacteristicRef, Vec<u8>, WriteMode),
    Disconnect,
}

/// GATT server of the simulated device.
#[derive(Debug, Clone, Default)]
pub struct FakePeripheral {
    services: ServiceCatalog,
    values: HashMap<CharacteristicRef, Vec<u8>>,
    op_delay: Duration,
    discovery_delay: Duration,
    discovery_error: Option<String>,
    reject_writes: bool,
    ignore_writes: bool,
    unresponsive: bool,
}

impl FakePeripheral {
    pub fn new() -> Self {
        Self::default()
    }

    /// A Light Wizard exposing the switch characteristic with the given position.
    pub fn light_wizard(on: bool) -> Self {
        Self::new()
            .with_service(UUID_LIGHT_SWITCH_SERVICE, &[UUID_SWITCH_CHAR])
            .with_value(
                CharacteristicRef::new(UUID_LIGHT_SWITCH_SERVICE, UUID_SWITCH_CHAR),
                &SwitchState::from(on).to_bytes(),
            )
    }

    pub fn with_service(mut self, service: uuid::Uuid, characteristics: &[uuid::Uuid]) -> Self {
        self.services.insert_service(service, characteristics.iter().copied());
        self
    }

    pub fn with_value(mut self, characteristic: CharacteristicRef, value: &[u8]) -> Self {
        self.values.insert(characteristic, value.to_vec());
        self
    }

    /// Time every read/write/ack takes.
    pub fn op_delay(mut self, delay: Duration) -> Self {
        self.op_delay = delay;
        self
    }

    /// Time service discovery takes.
    pub fn discovery_delay(mut self, delay: Duration) -> Self {
        self.discovery_delay = delay;
        self
    }

    /// Discovery completes with a GATT error status.
    pub fn fail_discovery(mut self, reason: &str) -> Self {
        self.discovery_error = Some(reason.to_string());
        self
    }

    /// Writes are answered with an error status.
    pub fn reject_writes(mut self) -> Self {
        self.reject_writes = true;
        self
    }

    /// Writes are acknowledged but not applied.
    pub fn ignore_writes(mut self) -> Self {
        self.ignore_writes = true;
        self
    }

    /// Reads and writes never complete.
    pub fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }
}

struct FakePermissions {
    granted: AtomicBool,
}

#[async_trait]
impl PermissionProvider for FakePermissions {
    fn check_granted(&self, _capability: Capability) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    async fn request_grant(&self, _capability: Capability) -> bool {
        self.granted.load(Ordering::SeqCst)
    }
}

/// Counts operations that overlap in time.
#[derive(Default)]
struct OpCounter {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl OpCounter {
    fn enter(self: &Arc<Self>) -> OpGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        OpGuard(self.clone())
    }
}

struct OpGuard(Arc<OpCounter>);

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeAdapterBuilder {
    advertisements: Vec<Advertisement>,
    known: Vec<Advertisement>,
    advertise_interval: Duration,
    peripheral: Option<FakePeripheral>,
    radio_enabled: bool,
    permissions_granted: bool,
    scan_error: Option<String>,
    connect_error: Option<String>,
    connect_delay: Duration,
}

impl FakeAdapterBuilder {
    /// Appends an advertisement to the scan script. Reports are emitted in order.
    pub fn advertise(mut self, advertisement: Advertisement) -> Self {
        self.advertisements.push(advertisement);
        self
    }

    /// A bonded/connected device reported before any scan.
    pub fn known(mut self, advertisement: Advertisement) -> Self {
        self.known.push(advertisement);
        self
    }

    pub fn advertise_interval(mut self, interval: Duration) -> Self {
        self.advertise_interval = interval;
        self
    }

    pub fn peripheral(mut self, peripheral: FakePeripheral) -> Self {
        self.peripheral = Some(peripheral);
        self
    }

    pub fn radio_enabled(mut self, enabled: bool) -> Self {
        self.radio_enabled = enabled;
        self
    }

    pub fn deny_permissions(mut self) -> Self {
        self.permissions_granted = false;
        self
    }

    /// The radio refuses to start scanning.
    pub fn fail_scan(mut self, reason: &str) -> Self {
        self.scan_error = Some(reason.to_string());
        self
    }

    pub fn fail_connect(mut self, reason: &str) -> Self {
        self.connect_error = Some(reason.to_string());
        self
    }

    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn build(self) -> Arc<FakeAdapter> {
        Arc::new(FakeAdapter {
            advertisements: self.advertisements,
            known: self.known,
            advertise_interval: self.advertise_interval,
            peripheral: self.peripheral.map(|p| Arc::new(Mutex::new(p))),
            radio_enabled: self.radio_enabled,
            permissions: Arc::new(FakePermissions {
                granted: AtomicBool::new(self.permissions_granted),
            }),
            scan_error: self.scan_error,
            connect_error: self.connect_error,
            connect_delay: self.connect_delay,
            scan_token: Mutex::new(None),
            scans_started: AtomicUsize::new(0),
            calls: Arc::new(Mutex::new(Vec::new())),
            link: Mutex::new(None),
            in_flight: Arc::new(OpCounter::default()),
        })
    }
}

pub struct FakeAdapter {
    advertisements: Vec<Advertisement>,
    known: Vec<Advertisement>,
    advertise_interval: Duration,
    peripheral: Option<Arc<Mutex<FakePeripheral>>>,
    radio_enabled: bool,
    permissions: Arc<FakePermissions>,
    scan_error: Option<String>,
    connect_error: Option<String>,
    connect_delay: Duration,
    scan_token: Mutex<Option<CancellationToken>>,
    scans_started: AtomicUsize,
    calls: Arc<Mutex<Vec<TransportCall>>>,
    link: Mutex<Option<Arc<watch::Sender<bool>>>>,
    in_flight: Arc<OpCounter>,
}

impl FakeAdapter {
    pub fn builder() -> FakeAdapterBuilder {
        FakeAdapterBuilder {
            advertisements: Vec::new(),
            known: Vec::new(),
            advertise_interval: Duration::from_millis(5),
            peripheral: None,
            radio_enabled: true,
            permissions_granted: true,
            scan_error: None,
            connect_error: None,
            connect_delay: Duration::ZERO,
        }
    }

    /// A neighbourhood with some noise and one Light Wizard in it.
    pub fn simulated_wizard() -> Arc<Self> {
        Self::builder()
            .advertise(Advertisement::new("00:11:22:33:44:55", Some("Living Room TV")).with_rssi(-71))
            .advertise(Advertisement::new("66:77:88:99:AA:BB", None).with_rssi(-88))
            .advertise(
                Advertisement::new("C0:FF:EE:00:00:01", Some("Light Wizard"))
                    .with_services(&[UUID_LIGHT_SWITCH_SERVICE])
                    .with_rssi(-54),
            )
            .advertise_interval(Duration::from_millis(300))
            .peripheral(FakePeripheral::light_wizard(false).op_delay(Duration::from_millis(40)))
            .build()
    }

    pub fn permissions(&self) -> Arc<dyn PermissionProvider> {
        self.permissions.clone()
    }

    pub fn permission_gate(&self) -> Arc<PermissionGate> {
        Arc::new(PermissionGate::new(self.permissions()))
    }

    pub fn is_scan_active(&self) -> bool {
        lock(&self.scan_token).is_some()
    }

    pub fn scans_started(&self) -> usize {
        self.scans_started.load(Ordering::SeqCst)
    }

    /// Every transport call so far, in the order the peripheral saw them.
    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.calls).clone()
    }

    /// The largest number of GATT operations that were ever in progress at once.
    pub fn max_concurrent_ops(&self) -> usize {
        self.in_flight.max.load(Ordering::SeqCst)
    }

    /// The peripheral's current value of a characteristic.
    pub fn value(&self, characteristic: &CharacteristicRef) -> Option<Vec<u8>> {
        let peripheral = self.peripheral.as_ref()?;
        lock(peripheral).values.get(characteristic).cloned()
    }

    /// Changes a value on the peripheral side, as a physical switch would.
    pub fn set_value(&self, characteristic: CharacteristicRef, value: &[u8]) {
        if let Some(peripheral) = &self.peripheral {
            lock(peripheral).values.insert(characteristic, value.to_vec());
        }
    }

    /// The peripheral keeps the link up but stops answering reads and writes.
    pub fn stall(&self) {
        if let Some(peripheral) = &self.peripheral {
            lock(peripheral).unresponsive = true;
        }
    }

    /// The peripheral drops the link.
    pub fn drop_connection(&self) {
        if let Some(link) = lock(&self.link).as_ref() {
            debug!("Simulated peripheral dropped the connection");
            link.send_replace(false);
        }
    }
}

#[async_trait]
impl BleAdapter for FakeAdapter {
    async fn is_radio_enabled(&self) -> bool {
        self.radio_enabled
    }

    async fn known_devices(&self) -> Result<Vec<Advertisement>, BleError> {
        Ok(self.known.clone())
    }

    async fn start_scan(&self, _filter: &ScanFilter) -> Result<AdvertisementStream, BleError> {
        if !self.radio_enabled {
            return Err(BleError::AdapterDisabled);
        }
        if let Some(reason) = &self.scan_error {
            return Err(BleError::TransportError(reason.clone()));
        }
        self.scans_started.fetch_add(1, Ordering::SeqCst);

        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.scan_token).replace(token.clone()) {
            previous.cancel();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let script = self.advertisements.clone();
        let interval = self.advertise_interval;
        tokio::spawn(async move {
            for advertisement in script {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = token.cancelled() => return,
                }
                if tx.send(advertisement).is_err() {
                    return;
                }
            }
            // the radio keeps listening until told to stop
            token.cancelled().await;
        });

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|advertisement| (advertisement, rx))
        })
        .boxed())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        if let Some(token) = lock(&self.scan_token).take() {
            token.cancel();
        }
        Ok(())
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<Box<dyn GattTransport>, BleError> {
        lock(&self.calls).push(TransportCall::Connect(device.id.clone()));
        tokio::time::sleep(self.connect_delay).await;

        if let Some(reason) = &self.connect_error {
            return Err(BleError::ConnectError(reason.clone()));
        }
        let peripheral = self
            .peripheral
            .clone()
            .ok_or_else(|| BleError::ConnectError(format!("no peripheral answers at {}", device.id)))?;

        let (link, _) = watch::channel(true);
        let link = Arc::new(link);
        *lock(&self.link) = Some(link.clone());

        Ok(Box::new(FakeTransport {
            peripheral,
            calls: self.calls.clone(),
            link,
            in_flight: self.in_flight.clone(),
        }))
    }
}

struct FakeTransport {
    peripheral: Arc<Mutex<FakePeripheral>>,
    calls: Arc<Mutex<Vec<TransportCall>>>,
    link: Arc<watch::Sender<bool>>,
    in_flight: Arc<OpCounter>,
}

impl FakeTransport {
    fn record(&self, call: TransportCall) {
        lock(&self.calls).push(call);
    }

    fn ensure_linked(&self) -> Result<(), BleError> {
        if *self.link.borrow() {
            Ok(())
        } else {
            Err(BleError::Disconnected)
        }
    }

    /// Waits out the peripheral's response time.
    async fn respond(&self) {
        let (delay, unresponsive) = {
            let peripheral = lock(&self.peripheral);
            (peripheral.op_delay, peripheral.unresponsive)
        };
        if unresponsive {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl GattTransport for FakeTransport {
    async fn discover_services(&self) -> Result<ServiceCatalog, BleError> {
        self.record(TransportCall::Discover);
        let delay = lock(&self.peripheral).discovery_delay;
        tokio::time::sleep(delay).await;
        self.ensure_linked()?;
        let peripheral = lock(&self.peripheral);
        match &peripheral.discovery_error {
            Some(reason) => Err(BleError::DiscoveryError(reason.clone())),
            None => Ok(peripheral.services.clone()),
        }
    }

    async fn read_characteristic(&self, characteristic: &CharacteristicRef) -> Result<Vec<u8>, BleError> {
        let _op = self.in_flight.enter();
        self.record(TransportCall::Read(*characteristic));
        self.respond().await;
        self.ensure_linked()?;
        lock(&self.peripheral)
            .values
            .get(characteristic)
            .cloned()
            .ok_or_else(|| BleError::TransportError("read not permitted (status 0x02)".to_string()))
    }

    async fn write_characteristic(
        &self,
        characteristic: &CharacteristicRef,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        let _op = self.in_flight.enter();
        self.record(TransportCall::Write(*characteristic, value.to_vec(), mode));
        self.ensure_linked()?;

        let apply = {
            let peripheral = self.peripheral.clone();
            let characteristic = *characteristic;
            let value = value.to_vec();
            move || {
                let mut peripheral = lock(&peripheral);
                if peripheral.reject_writes {
                    return Err(BleError::TransportError(
                        "write not permitted (status 0x03)".to_string(),
                    ));
                }
                if !peripheral.ignore_writes {
                    peripheral.values.insert(characteristic, value);
                }
                Ok(())
            }
        };

        match mode {
            WriteMode::WithoutResponse => {
                let _ = apply();
                Ok(())
            }
            WriteMode::WithResponse => {
                // the acknowledgement arrives later, like a platform callback
                let (ack_tx, ack_rx) = oneshot::channel();
                self.respond().await;
                tokio::spawn(async move {
                    let _ = ack_tx.send(apply());
                });
                ack_rx
                    .await
                    .map_err(|_| BleError::TransportError("write acknowledgement lost".to_string()))?
            }
        }
    }

    async fn disconnected(&self) {
        let mut link = self.link.subscribe();
        let _ = link.wait_for(|linked| !*linked).await;
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.record(TransportCall::Disconnect);
        self.link.send_replace(false);
        Ok(())
    }
}
