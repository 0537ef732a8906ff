//! GATT session for one peripheral
//! Owns a single connection: connects, discovers services, then serialises every
//! characteristic read and write through one FIFO queue until the link goes away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::adapter::{BleAdapter, GattTransport, WriteMode};
use crate::core::bluetooth::constants::BLUETOOTH_OPERATION_TIMEOUT_SECS;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::types::{CharacteristicRef, ConnectionState, DeviceHandle, ServiceCatalog};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
enum Request {
    Read(CharacteristicRef),
    Write(CharacteristicRef, Vec<u8>, WriteMode),
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Self::Read(_) => "read",
            Self::Write(..) => "write",
        }
    }

    async fn run(&self, transport: &dyn GattTransport) -> Result<Vec<u8>, BleError> {
        match self {
            Self::Read(characteristic) => transport.read_characteristic(characteristic).await,
            Self::Write(characteristic, value, mode) => transport
                .write_characteristic(characteristic, value, *mode)
                .await
                .map(|()| Vec::new()),
        }
    }
}

struct Operation {
    request: Request,
    reply: oneshot::Sender<Result<Vec<u8>, BleError>>,
}

/// State shared with the session's background tasks.
struct Shared {
    device: DeviceHandle,
    state: watch::Sender<ConnectionState>,
    catalog: RwLock<Option<Arc<ServiceCatalog>>>,
    closed: CancellationToken,
}

impl Shared {
    /// Applies a legal transition. Entering `Disconnected` or `Failed` closes the
    /// session for good and invalidates the service catalog.
    fn transition(&self, next: ConnectionState) -> bool {
        let terminal = matches!(next, ConnectionState::Disconnected | ConnectionState::Failed(_));
        let moved = self.state.send_if_modified(|current| {
            if self.closed.is_cancelled() || !current.can_transition_to(&next) {
                return false;
            }
            info!("Session {}: {} -> {}", self.device, current, next);
            *current = next.clone();
            if terminal {
                self.closed.cancel();
            }
            true
        });
        if moved && terminal {
            *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = None;
        }
        moved
    }

    /// Records a session-ending error.
    fn fail(&self, err: &BleError) {
        let next = match err {
            BleError::Disconnected => ConnectionState::Disconnected,
            other => ConnectionState::Failed(other.to_string()),
        };
        self.transition(next);
    }
}

/// One connection to one peripheral. Never reused: once it reaches
/// `Disconnected` or `Failed` a new session has to be built.
pub struct GattSession {
    adapter: Arc<dyn BleAdapter>,
    shared: Arc<Shared>,
    op_timeout: Duration,
    started: AtomicBool,
    transport: Mutex<Option<Arc<dyn GattTransport>>>,
    queue: mpsc::UnboundedSender<Operation>,
    pending_queue: Mutex<Option<mpsc::UnboundedReceiver<Operation>>>,
}

impl GattSession {
    pub fn new(adapter: Arc<dyn BleAdapter>, device: DeviceHandle) -> Self {
        let (queue, pending_queue) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            adapter,
            shared: Arc::new(Shared {
                device,
                state,
                catalog: RwLock::new(None),
                closed: CancellationToken::new(),
            }),
            op_timeout: Duration::from_secs(BLUETOOTH_OPERATION_TIMEOUT_SECS),
            started: AtomicBool::new(false),
            transport: Mutex::new(None),
            queue,
            pending_queue: Mutex::new(Some(pending_queue)),
        }
    }

    /// Bound applied to connect, discovery, and each read or write.
    pub fn with_operation_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.shared.device
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Whether the session has ended and must be discarded.
    pub fn is_terminal(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// The discovered services. `None` before discovery and after the session ended.
    pub fn catalog(&self) -> Option<Arc<ServiceCatalog>> {
        self.shared
            .catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connects and then discovers services. Resolves once characteristic I/O is
    /// possible. There is no retry; a failed session stays failed.
    pub async fn connect(&self) -> Result<(), BleError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(if self.is_terminal() {
                BleError::Disconnected
            } else {
                BleError::ConnectError("session is already connecting".to_string())
            });
        }
        let device = self.shared.device.clone();
        self.shared.transition(ConnectionState::Connecting);

        info!("Initiating connection to {}...", device);
        let connecting = tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => {
                info!("Connection to {} abandoned", device);
                return Err(BleError::Disconnected);
            }
            result = timeout(self.op_timeout, self.adapter.connect(&device)) => result,
        };
        let transport: Arc<dyn GattTransport> = match connecting {
            Ok(Ok(transport)) => Arc::from(transport),
            Ok(Err(e)) => {
                let e = match e {
                    BleError::ConnectError(_) | BleError::Disconnected => e,
                    other => BleError::ConnectError(other.to_string()),
                };
                error!("Connection to {} failed: {}", device, e);
                self.shared.fail(&e);
                return Err(e);
            }
            Err(_) => {
                let e = BleError::Timeout("connect");
                error!("Connection to {} timed out", device);
                self.shared.fail(&e);
                return Err(e);
            }
        };

        if !self.shared.transition(ConnectionState::Connected) {
            // closed while the connection was being established
            release(transport).await;
            return Err(BleError::Disconnected);
        }
        *lock(&self.transport) = Some(transport.clone());
        tokio::spawn(watch_link(transport.clone(), self.shared.clone()));

        info!("Connection successful, discovering services...");
        let discovering = tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => return Err(self.abort(BleError::Disconnected).await),
            result = timeout(self.op_timeout, transport.discover_services()) => result,
        };
        let catalog = match discovering {
            Ok(Ok(catalog)) => catalog,
            Ok(Err(e)) => {
                let e = match e {
                    BleError::DiscoveryError(_) | BleError::Disconnected => e,
                    other => BleError::DiscoveryError(other.to_string()),
                };
                return Err(self.abort(e).await);
            }
            Err(_) => return Err(self.abort(BleError::Timeout("service discovery")).await),
        };
        for service in catalog.services() {
            debug!("Available service: {}", service);
        }

        let operations = lock(&self.pending_queue).take();
        let Some(operations) = operations else {
            return Err(self.abort(BleError::Disconnected).await);
        };
        *self.shared.catalog.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(catalog));
        if !self.shared.transition(ConnectionState::ServicesDiscovered) {
            return Err(self.abort(BleError::Disconnected).await);
        }
        tokio::spawn(drain_operations(
            operations,
            transport,
            self.shared.clone(),
            self.op_timeout,
        ));
        Ok(())
    }

    /// Reads a characteristic. Queued behind every earlier operation.
    pub async fn read(&self, characteristic: CharacteristicRef) -> Result<Vec<u8>, BleError> {
        self.submit(characteristic, Request::Read(characteristic)).await
    }

    /// Writes a characteristic. With `ack_required` the call resolves only once
    /// the peripheral acknowledged the write.
    pub async fn write(
        &self,
        characteristic: CharacteristicRef,
        value: &[u8],
        ack_required: bool,
    ) -> Result<(), BleError> {
        let request = Request::Write(characteristic, value.to_vec(), WriteMode::from_ack(ack_required));
        self.submit(characteristic, request).await.map(|_| ())
    }

    /// Closes the link. Queued and in-flight operations fail with `Disconnected`.
    pub async fn disconnect(&self) {
        self.started.store(true, Ordering::SeqCst);
        if !self.shared.transition(ConnectionState::Disconnected) {
            // never connected: nothing to tear down, but the session is spent
            self.shared.closed.cancel();
        }
        let transport = lock(&self.transport).take();
        if let Some(transport) = transport {
            info!("Disconnecting from device {}", self.shared.device);
            release(transport).await;
        }
    }

    async fn submit(
        &self,
        characteristic: CharacteristicRef,
        request: Request,
    ) -> Result<Vec<u8>, BleError> {
        let catalog = self.ready()?;
        if !catalog.contains(&characteristic) {
            return Err(BleError::UnknownCharacteristic(characteristic));
        }

        let (reply, outcome) = oneshot::channel();
        debug!("Queueing {:?}", request);
        self.queue
            .send(Operation { request, reply })
            .map_err(|_| BleError::Disconnected)?;
        outcome.await.unwrap_or(Err(BleError::Disconnected))
    }

    fn ready(&self) -> Result<Arc<ServiceCatalog>, BleError> {
        if self.is_terminal() {
            return Err(BleError::Disconnected);
        }
        match self.state() {
            ConnectionState::ServicesDiscovered => self.catalog().ok_or(BleError::Disconnected),
            other => Err(BleError::NotReady(other)),
        }
    }

    /// Ends the session with `err` and tears the link down.
    async fn abort(&self, err: BleError) -> BleError {
        error!("Session {} aborted: {}", self.shared.device, err);
        self.shared.fail(&err);
        let transport = lock(&self.transport).take();
        if let Some(transport) = transport {
            release(transport).await;
        }
        err
    }
}

impl Drop for GattSession {
    fn drop(&mut self) {
        if !self.shared.transition(ConnectionState::Disconnected) {
            self.shared.closed.cancel();
        }
        let transport = lock(&self.transport).take();
        if let (Some(transport), Ok(runtime)) = (transport, tokio::runtime::Handle::try_current()) {
            runtime.spawn(release(transport));
        }
    }
}

async fn release(transport: Arc<dyn GattTransport>) {
    if let Err(e) = transport.disconnect().await {
        warn!("Failed to close GATT connection: {}", e);
    }
}

/// Turns a remote disconnect into the terminal `Disconnected` transition.
async fn watch_link(transport: Arc<dyn GattTransport>, shared: Arc<Shared>) {
    tokio::select! {
        _ = transport.disconnected() => {
            if shared.transition(ConnectionState::Disconnected) {
                warn!("Device {} lost connection", shared.device);
            }
        }
        _ = shared.closed.cancelled() => {}
    }
}

/// The single consumer of the operation queue. Runs one operation at a time in
/// submission order; once the session closes every remaining caller gets `Disconnected`.
async fn drain_operations(
    mut operations: mpsc::UnboundedReceiver<Operation>,
    transport: Arc<dyn GattTransport>,
    shared: Arc<Shared>,
    op_timeout: Duration,
) {
    loop {
        let operation = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            next = operations.recv() => match next {
                Some(operation) => operation,
                None => return,
            },
        };
        if operation.reply.is_closed() {
            debug!("Dropping abandoned {}", operation.request.name());
            continue;
        }

        let result = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => Err(BleError::Disconnected),
            outcome = timeout(op_timeout, operation.request.run(transport.as_ref())) => {
                outcome.unwrap_or(Err(BleError::Timeout(operation.request.name())))
            }
        };
        match &result {
            Ok(value) => debug!("{} completed ({} bytes)", operation.request.name(), value.len()),
            Err(e) => {
                warn!("{} failed: {}", operation.request.name(), e);
                if e.is_fatal() {
                    shared.fail(e);
                }
            }
        }
        let _ = operation.reply.send(result);
    }

    operations.close();
    let mut failed = 0;
    while let Ok(operation) = operations.try_recv() {
        let _ = operation.reply.send(Err(BleError::Disconnected));
        failed += 1;
    }
    if failed > 0 {
        info!("Failed {} queued operations after the session closed", failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::{UUID_LIGHT_SWITCH_SERVICE, UUID_SWITCH_CHAR};
    use crate::core::bluetooth::fake::{FakeAdapter, FakePeripheral, TransportCall};

    const SWITCH: CharacteristicRef = CharacteristicRef::new(UUID_LIGHT_SWITCH_SERVICE, UUID_SWITCH_CHAR);

    fn wizard() -> DeviceHandle {
        DeviceHandle::new("C0:FF:EE:00:00:01", "Light Wizard")
    }

    fn session_for(adapter: &Arc<FakeAdapter>) -> GattSession {
        GattSession::new(adapter.clone(), wizard()).with_operation_timeout(Duration::from_millis(300))
    }

    #[tokio::test]
    async fn connect_discovers_services_automatically() {
        let adapter = FakeAdapter::builder().peripheral(FakePeripheral::light_wizard(false)).build();
        let session = session_for(&adapter);
        assert_eq!(session.state(), ConnectionState::Disconnected);

        session.connect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::ServicesDiscovered);
        assert!(session.catalog().unwrap().contains(&SWITCH));
        assert_eq!(
            adapter.calls(),
            vec![TransportCall::Connect(wizard().id), TransportCall::Discover]
        );
    }

    #[tokio::test]
    async fn io_before_discovery_is_not_ready_and_never_reaches_the_radio() {
        let adapter = FakeAdapter::builder().peripheral(FakePeripheral::light_wizard(false)).build();
        let session = session_for(&adapter);

        assert_eq!(
            session.read(SWITCH).await,
            Err(BleError::NotReady(ConnectionState::Disconnected))
        );
        assert_eq!(
            session.write(SWITCH, &[1], true).await,
            Err(BleError::NotReady(ConnectionState::Disconnected))
        );
        assert!(adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_characteristic_fails_without_transport_call() {
        let adapter = FakeAdapter::builder().peripheral(FakePeripheral::light_wizard(false)).build();
        let session = session_for(&adapter);
        session.connect().await.unwrap();

        let stale = CharacteristicRef::new(UUID_LIGHT_SWITCH_SERVICE, UUID_LIGHT_SWITCH_SERVICE);
        assert_eq!(session.read(stale).await, Err(BleError::UnknownCharacteristic(stale)));
        assert_eq!(adapter.calls().len(), 2);
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let adapter = FakeAdapter::builder().peripheral(FakePeripheral::light_wizard(false)).build();
        let session = session_for(&adapter);
        session.connect().await.unwrap();

        session.write(SWITCH, &[0x01], true).await.unwrap();
        assert_eq!(session.read(SWITCH).await.unwrap(), vec![0x01]);
        assert!(adapter
            .calls()
            .contains(&TransportCall::Write(SWITCH, vec![0x01], WriteMode::WithResponse)));
    }

    #[tokio::test]
    async fn concurrent_operations_run_one_at_a_time_in_submission_order() {
        let peripheral = FakePeripheral::light_wizard(false).op_delay(Duration::from_millis(20));
        let adapter = FakeAdapter::builder().peripheral(peripheral).build();
        let session = session_for(&adapter);
        session.connect().await.unwrap();

        let (first, second, third, fourth) = tokio::join!(
            session.read(SWITCH),
            session.write(SWITCH, &[0x01], true),
            session.read(SWITCH),
            session.write(SWITCH, &[0x00], false),
        );
        assert_eq!(first.unwrap(), vec![0x00]);
        second.unwrap();
        assert_eq!(third.unwrap(), vec![0x01]);
        fourth.unwrap();

        assert_eq!(adapter.max_concurrent_ops(), 1);
        assert_eq!(
            adapter.calls()[2..].to_vec(),
            vec![
                TransportCall::Read(SWITCH),
                TransportCall::Write(SWITCH, vec![0x01], WriteMode::WithResponse),
                TransportCall::Read(SWITCH),
                TransportCall::Write(SWITCH, vec![0x00], WriteMode::WithoutResponse),
            ]
        );
    }

    #[tokio::test]
    async fn remote_disconnect_fails_queued_operations_and_ends_the_session() {
        let peripheral = FakePeripheral::light_wizard(false).op_delay(Duration::from_millis(100));
        let adapter = FakeAdapter::builder().peripheral(peripheral).build();
        let session = Arc::new(session_for(&adapter).with_operation_timeout(Duration::from_secs(5)));
        session.connect().await.unwrap();

        let pending: Vec<_> = (0..3)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.read(SWITCH).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(30)).await;
        adapter.drop_connection();

        for handle in pending {
            assert_eq!(handle.await.unwrap(), Err(BleError::Disconnected));
        }
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.is_terminal());
        assert!(session.catalog().is_none());
        assert_eq!(session.read(SWITCH).await, Err(BleError::Disconnected));
        assert_eq!(session.connect().await, Err(BleError::Disconnected));
    }

    #[tokio::test]
    async fn explicit_disconnect_is_terminal() {
        let adapter = FakeAdapter::builder().peripheral(FakePeripheral::light_wizard(true)).build();
        let session = session_for(&adapter);
        session.connect().await.unwrap();

        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(adapter.calls().last(), Some(&TransportCall::Disconnect));
        assert_eq!(session.read(SWITCH).await, Err(BleError::Disconnected));
        assert_eq!(session.connect().await, Err(BleError::Disconnected));
    }

    #[tokio::test]
    async fn rejected_connection_fails_the_session() {
        let adapter = FakeAdapter::builder().fail_connect("remote refused").build();
        let session = session_for(&adapter);

        let result = session.connect().await;
        assert_eq!(result, Err(BleError::ConnectError("remote refused".to_string())));
        assert!(matches!(session.state(), ConnectionState::Failed(_)));
        assert!(session.is_terminal());
    }

    #[tokio::test]
    async fn slow_connection_times_out() {
        let adapter = FakeAdapter::builder()
            .peripheral(FakePeripheral::light_wizard(false))
            .connect_delay(Duration::from_secs(5))
            .build();
        let session = session_for(&adapter);

        assert_eq!(session.connect().await, Err(BleError::Timeout("connect")));
        assert!(matches!(session.state(), ConnectionState::Failed(_)));
    }

    #[tokio::test]
    async fn discovery_error_leaves_catalog_unset() {
        let peripheral = FakePeripheral::light_wizard(false).fail_discovery("GATT status 129");
        let adapter = FakeAdapter::builder().peripheral(peripheral).build();
        let session = session_for(&adapter);

        let result = session.connect().await;
        assert_eq!(result, Err(BleError::DiscoveryError("GATT status 129".to_string())));
        assert!(matches!(session.state(), ConnectionState::Failed(_)));
        assert!(session.catalog().is_none());
        assert_eq!(adapter.calls().last(), Some(&TransportCall::Disconnect));
    }

    #[tokio::test]
    async fn disconnect_abandons_a_pending_connect() {
        let adapter = FakeAdapter::builder()
            .peripheral(FakePeripheral::light_wizard(false))
            .connect_delay(Duration::from_secs(5))
            .build();
        let session = Arc::new(session_for(&adapter));
        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.disconnect().await;
        let result = tokio::time::timeout(Duration::from_millis(200), connecting).await;
        assert_eq!(result.unwrap().unwrap(), Err(BleError::Disconnected));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn hanging_discovery_times_out() {
        let peripheral = FakePeripheral::light_wizard(false).discovery_delay(Duration::from_secs(5));
        let adapter = FakeAdapter::builder().peripheral(peripheral).build();
        let session = session_for(&adapter);

        assert_eq!(session.connect().await, Err(BleError::Timeout("service discovery")));
        assert_eq!(
            session.state(),
            ConnectionState::Failed("service discovery timed out".to_string())
        );
        assert!(session.catalog().is_none());
    }

    #[tokio::test]
    async fn rejected_write_keeps_the_session_usable() {
        let adapter = FakeAdapter::builder()
            .peripheral(FakePeripheral::light_wizard(false).reject_writes())
            .build();
        let session = session_for(&adapter);
        session.connect().await.unwrap();

        assert!(matches!(
            session.write(SWITCH, &[0x01], true).await,
            Err(BleError::TransportError(_))
        ));
        assert_eq!(session.state(), ConnectionState::ServicesDiscovered);
        assert_eq!(session.read(SWITCH).await.unwrap(), vec![0x00]);
    }

    #[tokio::test]
    async fn unresponsive_peripheral_times_out_and_fails_the_session() {
        let adapter = FakeAdapter::builder()
            .peripheral(FakePeripheral::light_wizard(false).unresponsive())
            .build();
        let session = session_for(&adapter);
        session.connect().await.unwrap();

        assert_eq!(session.read(SWITCH).await, Err(BleError::Timeout("read")));
        assert!(matches!(session.state(), ConnectionState::Failed(_)));
        assert_eq!(session.read(SWITCH).await, Err(BleError::Disconnected));
    }

    #[tokio::test]
    async fn state_changes_are_observable() {
        let adapter = FakeAdapter::builder().peripheral(FakePeripheral::light_wizard(false)).build();
        let session = session_for(&adapter);
        let mut states = session.subscribe_state();

        session.connect().await.unwrap();
        assert_eq!(*states.borrow_and_update(), ConnectionState::ServicesDiscovered);

        adapter.drop_connection();
        states.changed().await.unwrap();
        assert_eq!(*states.borrow(), ConnectionState::Disconnected);
    }
}
