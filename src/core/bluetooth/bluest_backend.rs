//! bluest-backed implementation of the adapter traits
//! Maps the platform radio (WinRT, CoreBluetooth, BlueZ) onto `BleAdapter` and `GattTransport`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device, Uuid};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::adapter::{AdvertisementStream, BleAdapter, GattTransport, WriteMode};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::types::{
    Advertisement, CharacteristicRef, DeviceHandle, ScanFilter, ServiceCatalog,
};

/// How often the link is polled when the platform has no connection events.
const LINK_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn transport_error(e: bluest::Error) -> BleError {
    BleError::TransportError(e.to_string())
}

/// Classifies a scan that the platform refused to start.
fn scan_start_error(radio_available: bool, reason: String) -> BleError {
    if radio_available {
        BleError::TransportError(reason)
    } else {
        BleError::AdapterDisabled
    }
}

pub struct BluestAdapter {
    adapter: Adapter,
    /// Devices seen so far, by platform id
    devices: Arc<Mutex<HashMap<String, Device>>>,
    cancel_token: Mutex<Option<CancellationToken>>,
}

impl BluestAdapter {
    /// Opens the system's default adapter and waits until it is usable.
    pub async fn new() -> Result<Self, BleError> {
        let adapter = Adapter::default().await.ok_or_else(|| {
            error!("No Bluetooth adapter found");
            BleError::AdapterDisabled
        })?;
        adapter.wait_available().await.map_err(transport_error)?;
        info!("Bluetooth adapter is available.");
        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            cancel_token: Mutex::new(None),
        })
    }

    fn remember(devices: &Mutex<HashMap<String, Device>>, device: &Device) -> String {
        let id = device.id().to_string();
        lock(devices).insert(id.clone(), device.clone());
        id
    }
}

#[async_trait]
impl BleAdapter for BluestAdapter {
    async fn is_radio_enabled(&self) -> bool {
        self.adapter.is_available().await.unwrap_or(false)
    }

    async fn known_devices(&self) -> Result<Vec<Advertisement>, BleError> {
        let connected = self.adapter.connected_devices().await.map_err(transport_error)?;
        let mut known = Vec::with_capacity(connected.len());
        for device in connected {
            let id = Self::remember(&self.devices, &device);
            let name = device.name().ok();
            debug!("Known device - ID: {}, Name: {:?}", id, name);
            known.push(Advertisement::new(id, name.as_deref()));
        }
        Ok(known)
    }

    async fn start_scan(&self, filter: &ScanFilter) -> Result<AdvertisementStream, BleError> {
        let cancel_token = CancellationToken::new();
        if let Some(previous) = lock(&self.cancel_token).replace(cancel_token.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let services: Vec<Uuid> = filter.service.into_iter().collect();
        let (tx, rx) = mpsc::unbounded_channel();
        let (started_tx, started_rx) = oneshot::channel();

        // the scan stream borrows the adapter, so both live in the task
        tokio::spawn(async move {
            let mut scan_stream = match adapter.scan(&services).await {
                Ok(stream) => {
                    let _ = started_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    error!("Failed to start bluetooth scan: {}", e);
                    let available = adapter.is_available().await.unwrap_or(false);
                    let _ = started_tx.send(Err(scan_start_error(available, e.to_string())));
                    return;
                }
            };
            loop {
                tokio::select! {
                    result = scan_stream.next() => {
                        let Some(discovered) = result else {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        };
                        let id = Self::remember(&devices, &discovered.device);
                        let name = discovered
                            .adv_data
                            .local_name
                            .clone()
                            .or_else(|| discovered.device.name().ok());
                        let advertisement = Advertisement {
                            id,
                            name,
                            services: discovered.adv_data.services.iter().copied().collect(),
                            rssi: discovered.rssi,
                        };
                        if tx.send(advertisement).is_err() {
                            break;
                        }
                    }
                    _ = cancel_token.cancelled() => break,
                }
            }
            debug!("Radio scan task finished");
        });

        started_rx
            .await
            .map_err(|_| BleError::TransportError("scan task ended before the scan started".to_string()))??;

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|advertisement| (advertisement, rx))
        })
        .boxed())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        if let Some(cancel_token) = lock(&self.cancel_token).take() {
            info!("Stopping radio scan.");
            cancel_token.cancel();
        }
        Ok(())
    }

    async fn connect(&self, handle: &DeviceHandle) -> Result<Box<dyn GattTransport>, BleError> {
        let device = lock(&self.devices)
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| BleError::ConnectError(format!("device not found with ID: {}", handle.id)))?;

        if !device.is_connected().await {
            info!("Initiating connection to {}...", handle);
            self.adapter
                .connect_device(&device)
                .await
                .map_err(|e| BleError::ConnectError(e.to_string()))?;
        }

        Ok(Box::new(BluestTransport {
            adapter: self.adapter.clone(),
            device,
            characteristics: RwLock::new(HashMap::new()),
        }))
    }
}

struct BluestTransport {
    adapter: Adapter,
    device: Device,
    /// Live handles behind the catalog, refreshed on every discovery
    characteristics: RwLock<HashMap<CharacteristicRef, Characteristic>>,
}

impl BluestTransport {
    async fn characteristic(&self, reference: &CharacteristicRef) -> Result<Characteristic, BleError> {
        self.characteristics
            .read()
            .await
            .get(reference)
            .cloned()
            .ok_or(BleError::UnknownCharacteristic(*reference))
    }
}

#[async_trait]
impl GattTransport for BluestTransport {
    async fn discover_services(&self) -> Result<ServiceCatalog, BleError> {
        let discovery_error = |e: bluest::Error| BleError::DiscoveryError(e.to_string());

        let services = self.device.discover_services().await.map_err(discovery_error)?;
        let mut catalog = ServiceCatalog::new();
        let mut handles = HashMap::new();
        for service in services {
            let characteristics = service.discover_characteristics().await.map_err(discovery_error)?;
            let uuids: Vec<Uuid> = characteristics.iter().map(Characteristic::uuid).collect();
            for characteristic in characteristics {
                handles.insert(
                    CharacteristicRef::new(service.uuid(), characteristic.uuid()),
                    characteristic,
                );
            }
            catalog.insert_service(service.uuid(), uuids);
        }
        *self.characteristics.write().await = handles;
        Ok(catalog)
    }

    async fn read_characteristic(&self, reference: &CharacteristicRef) -> Result<Vec<u8>, BleError> {
        let characteristic = self.characteristic(reference).await?;
        characteristic.read().await.map_err(transport_error)
    }

    async fn write_characteristic(
        &self,
        reference: &CharacteristicRef,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        let characteristic = self.characteristic(reference).await?;
        match mode {
            WriteMode::WithResponse => characteristic.write(value).await,
            WriteMode::WithoutResponse => characteristic.write_without_response(value).await,
        }
        .map_err(transport_error)
    }

    async fn disconnected(&self) {
        match self.adapter.device_connection_events(&self.device).await {
            Ok(mut events) => {
                while let Some(event) = events.next().await {
                    if matches!(event, ConnectionEvent::Disconnected) {
                        return;
                    }
                }
            }
            Err(e) => warn!("Connection events unavailable, polling instead: {}", e),
        }
        while self.device.is_connected().await {
            tokio::time::sleep(LINK_POLL_INTERVAL).await;
        }
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        if self.device.is_connected().await {
            info!("Disconnecting from device {}", self.device.id());
            self.adapter
                .disconnect_device(&self.device)
                .await
                .map_err(transport_error)?;
            info!("Successfully disconnected");
        } else {
            info!("Device {} not connected", self.device.id());
        }
        Ok(())
    }
}
