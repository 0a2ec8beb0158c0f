//! [`Transport`] backed by the platform BLE stack through `bluest`
//!
//! Each dispatch spawns a short tokio task that performs the `bluest` call and
//! reports the outcome through the [`EventSink`]. Long-running streams (scan,
//! link watcher, notifications) are tied to a [`CancellationToken`] so they can
//! be stopped from the synchronous side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use bluest::{Adapter, AdapterEvent, Characteristic, ConnectionEvent};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::device::DeviceId;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::transport::{EventSink, Transport, TransportEvent};
use crate::core::bluetooth::types::{CharacteristicRef, GattLayout};

type CharacteristicKey = (DeviceId, CharacteristicRef);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Translates a `bluest` failure into the session's error vocabulary.
pub fn to_ble_error(error: bluest::Error) -> BleError {
    use bluest::error::ErrorKind;

    match error.kind() {
        ErrorKind::AdapterUnavailable => BleError::BluetoothDisabled,
        ErrorKind::NotAuthorized => BleError::PermissionDenied(error.to_string()),
        ErrorKind::Timeout => BleError::Timeout(error.to_string()),
        _ => BleError::Gatt(error.to_string()),
    }
}

/// Waits for the default adapter to become available.
pub async fn default_adapter() -> Result<Adapter> {
    let adapter = Adapter::default()
        .await
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
    adapter.wait_available().await?;
    info!("Bluetooth adapter is available.");
    Ok(adapter)
}

#[derive(Default)]
struct Registry {
    devices: HashMap<DeviceId, bluest::Device>,
    characteristics: HashMap<CharacteristicKey, Characteristic>,
}

pub struct BluestTransport {
    adapter: Adapter,
    sink: EventSink,
    radio_on: Arc<AtomicBool>,
    registry: Arc<Mutex<Registry>>,
    scan: Mutex<Option<CancellationToken>>,
    links: Mutex<HashMap<DeviceId, CancellationToken>>,
    subscriptions: Mutex<HashMap<CharacteristicKey, CancellationToken>>,
    shutdown: CancellationToken,
}

impl BluestTransport {
    /// Wraps an available adapter and starts watching its power state.
    /// Must be called from within a tokio runtime.
    pub fn new(adapter: Adapter, sink: EventSink) -> Self {
        let transport = Self {
            adapter,
            sink,
            radio_on: Arc::new(AtomicBool::new(true)),
            registry: Arc::new(Mutex::new(Registry::default())),
            scan: Mutex::new(None),
            links: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        };
        transport.watch_adapter();
        transport
    }

    fn watch_adapter(&self) {
        let adapter = self.adapter.clone();
        let sink = self.sink.clone();
        let radio_on = self.radio_on.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot watch adapter state: {}", e);
                    return;
                }
            };
            let mut events = std::pin::pin!(events);
            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(Ok(AdapterEvent::Available)) => {
                            radio_on.store(true, Ordering::SeqCst);
                            sink.emit(TransportEvent::RadioStateChanged { powered_on: true });
                        }
                        Some(Ok(AdapterEvent::Unavailable)) => {
                            radio_on.store(false, Ordering::SeqCst);
                            sink.emit(TransportEvent::RadioStateChanged { powered_on: false });
                        }
                        Some(Err(e)) => warn!("Adapter event error: {}", e),
                        None => break,
                    },
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("Adapter watcher stopped");
        });
    }

    fn device(&self, id: &DeviceId) -> Option<bluest::Device> {
        lock(&self.registry).devices.get(id).cloned()
    }

    fn characteristic(&self, id: &DeviceId, target: CharacteristicRef) -> Option<Characteristic> {
        lock(&self.registry)
            .characteristics
            .get(&(id.clone(), target))
            .cloned()
    }

    /// Stops the tasks tied to a link: the watcher and every notification stream.
    fn release_link(&self, id: &DeviceId) {
        if let Some(token) = lock(&self.links).remove(id) {
            token.cancel();
        }
        lock(&self.subscriptions).retain(|(device, _), token| {
            if device == id {
                token.cancel();
                false
            } else {
                true
            }
        });
        lock(&self.registry).characteristics.retain(|(device, _), _| device != id);
    }

    /// Reports an unsolicited drop of an established link.
    fn watch_link(adapter: Adapter, sink: EventSink, id: DeviceId, device: bluest::Device, token: CancellationToken) {
        tokio::spawn(async move {
            let events = match adapter.device_connection_events(&device).await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot watch link to {}: {}", id, e);
                    return;
                }
            };
            let mut events = std::pin::pin!(events);
            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(ConnectionEvent::Disconnected) => {
                            if !token.is_cancelled() {
                                warn!("Link to {} dropped", id);
                                sink.emit(TransportEvent::Disconnected(
                                    id.clone(),
                                    Some(BleError::DisconnectedByDevice("link lost".into())),
                                ));
                            }
                            break;
                        }
                        Some(ConnectionEvent::Connected) => debug!("{} reported connected", id),
                        None => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
        });
    }
}

impl Drop for BluestTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(token) = lock(&self.scan).take() {
            token.cancel();
        }
        for (_, token) in lock(&self.links).drain() {
            token.cancel();
        }
        for (_, token) in lock(&self.subscriptions).drain() {
            token.cancel();
        }
    }
}

impl Transport for BluestTransport {
    fn is_radio_powered_on(&self) -> bool {
        self.radio_on.load(Ordering::SeqCst)
    }

    fn scan_for(&self, service: Uuid) {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.scan).replace(token.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        let sink = self.sink.clone();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            info!("Starting bluetooth scan");
            let scan = match adapter.scan(&[service]).await {
                Ok(scan) => scan,
                Err(e) => {
                    error!("Failed to start scan: {}", e);
                    sink.emit(TransportEvent::ScanFailed(BleError::ScanFailed(e.to_string())));
                    return;
                }
            };
            let mut scan = std::pin::pin!(scan);
            loop {
                tokio::select! {
                    found = scan.next() => match found {
                        Some(advertising) => {
                            let id = DeviceId::new(advertising.device.id().to_string());
                            let name = advertising
                                .adv_data
                                .local_name
                                .or_else(|| advertising.device.name().ok());
                            lock(&registry)
                                .devices
                                .entry(id.clone())
                                .or_insert(advertising.device);
                            sink.emit(TransportEvent::PeripheralDiscovered {
                                device: id,
                                name,
                                rssi: advertising.rssi,
                            });
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    },
                    _ = token.cancelled() => break,
                }
            }
        });
    }

    fn stop_scan(&self) {
        if let Some(token) = lock(&self.scan).take() {
            info!("Stopping Bluetooth scan.");
            token.cancel();
        }
    }

    fn connect(&self, id: &DeviceId) {
        let Some(device) = self.device(id) else {
            self.sink.emit(TransportEvent::ConnectFailed(
                id.clone(),
                BleError::PeripheralNotFound(id.clone()),
            ));
            return;
        };

        self.release_link(id);
        let token = CancellationToken::new();
        lock(&self.links).insert(id.clone(), token.clone());

        let adapter = self.adapter.clone();
        let sink = self.sink.clone();
        let id = id.clone();

        tokio::spawn(async move {
            info!("Initiating connection to {}...", id);
            let result = tokio::select! {
                result = adapter.connect_device(&device) => result,
                _ = token.cancelled() => {
                    debug!("Connection attempt to {} cancelled", id);
                    return;
                }
            };
            match result {
                Ok(()) => {
                    Self::watch_link(adapter.clone(), sink.clone(), id.clone(), device, token);
                    sink.emit(TransportEvent::Connected(id));
                }
                Err(e) => {
                    error!("Failed to connect to {}: {}", id, e);
                    sink.emit(TransportEvent::ConnectFailed(id, to_ble_error(e)));
                }
            }
        });
    }

    fn cancel_connection(&self, id: &DeviceId) {
        self.release_link(id);
        let Some(device) = self.device(id) else {
            self.sink.emit(TransportEvent::Disconnected(id.clone(), None));
            return;
        };

        let adapter = self.adapter.clone();
        let sink = self.sink.clone();
        let id = id.clone();
        tokio::spawn(async move {
            if device.is_connected().await {
                info!("Disconnecting from device {}", id);
                if let Err(e) = adapter.disconnect_device(&device).await {
                    warn!("Failed to disconnect from {}: {}", id, e);
                }
            } else {
                debug!("Device {} not connected", id);
            }
            sink.emit(TransportEvent::Disconnected(id, None));
        });
    }

    fn discover_services(&self, id: &DeviceId) {
        let Some(device) = self.device(id) else {
            self.sink.emit(TransportEvent::ServicesDiscovered(
                id.clone(),
                Err(BleError::PeripheralNotFound(id.clone())),
            ));
            return;
        };

        let sink = self.sink.clone();
        let registry = self.registry.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let result = async {
                let mut layout = GattLayout::new();
                let mut found = Vec::new();
                for service in device.discover_services().await? {
                    let characteristics = service.discover_characteristics().await?;
                    debug!("Available service: {} ({} characteristics)", service.uuid(), characteristics.len());
                    layout.insert_service(service.uuid(), characteristics.iter().map(Characteristic::uuid));
                    for characteristic in characteristics {
                        let target = CharacteristicRef::new(service.uuid(), characteristic.uuid());
                        found.push(((id.clone(), target), characteristic));
                    }
                }
                lock(&registry).characteristics.extend(found);
                Ok::<_, bluest::Error>(layout)
            }
            .await
            .map_err(to_ble_error);
            sink.emit(TransportEvent::ServicesDiscovered(id, result));
        });
    }

    fn write_value(&self, id: &DeviceId, target: CharacteristicRef, value: &[u8], with_response: bool) {
        let Some(characteristic) = self.characteristic(id, target) else {
            self.sink.emit(TransportEvent::WriteCompleted(
                id.clone(),
                target,
                Err(BleError::CharacteristicNotFound(target.characteristic)),
            ));
            return;
        };

        let sink = self.sink.clone();
        let id = id.clone();
        let value = value.to_vec();
        tokio::spawn(async move {
            if with_response {
                let result = characteristic.write(&value).await.map_err(to_ble_error);
                sink.emit(TransportEvent::WriteCompleted(id, target, result));
            } else if let Err(e) = characteristic.write_without_response(&value).await {
                warn!("Write without response to {} failed: {}", target, e);
            }
        });
    }

    fn read_value(&self, id: &DeviceId, target: CharacteristicRef) {
        let Some(characteristic) = self.characteristic(id, target) else {
            self.sink.emit(TransportEvent::ValueUpdated(
                id.clone(),
                target,
                Err(BleError::CharacteristicNotFound(target.characteristic)),
            ));
            return;
        };

        let sink = self.sink.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let result = characteristic.read().await.map_err(to_ble_error);
            sink.emit(TransportEvent::ValueUpdated(id, target, result));
        });
    }

    fn set_notify(&self, id: &DeviceId, target: CharacteristicRef, enabled: bool) {
        let key = (id.clone(), target);
        if let Some(previous) = lock(&self.subscriptions).remove(&key) {
            previous.cancel();
        }
        if !enabled {
            return;
        }

        let Some(characteristic) = self.characteristic(id, target) else {
            warn!("Cannot subscribe to {}: characteristic was not discovered", target);
            return;
        };

        let token = CancellationToken::new();
        lock(&self.subscriptions).insert(key, token.clone());
        let sink = self.sink.clone();
        let id = id.clone();
        tokio::spawn(async move {
            info!("Subscribing to notifications on {}...", target);
            let stream = match characteristic.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to subscribe to {}: {}", target, e);
                    return;
                }
            };
            let mut stream = std::pin::pin!(stream);
            loop {
                tokio::select! {
                    value = stream.next() => match value {
                        Some(value) => {
                            if !sink.emit(TransportEvent::ValueUpdated(id.clone(), target, value.map_err(to_ble_error))) {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
            debug!("Notification stream of {} closed", target);
        });
    }
}
