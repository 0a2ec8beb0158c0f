#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ble_session::{
    BluetoothSession, CharacteristicRef, ConnectionState, DeviceId, EventSink, GattLayout, ScanState,
    SessionConfig, Subscription, Transport, TransportEvent,
};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub const RX: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
pub const TX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ScanFor(Uuid),
    StopScan,
    Connect(DeviceId),
    CancelConnection(DeviceId),
    DiscoverServices(DeviceId),
    Write(DeviceId, CharacteristicRef, Vec<u8>, bool),
    Read(DeviceId, CharacteristicRef),
    SetNotify(DeviceId, CharacteristicRef, bool),
}

/// Transport that forwards every dispatch to the test and never answers on its own.
struct MockTransport {
    powered: Arc<AtomicBool>,
    calls: mpsc::UnboundedSender<Call>,
}

impl MockTransport {
    fn record(&self, call: Call) {
        let _ = self.calls.send(call);
    }
}

impl Transport for MockTransport {
    fn is_radio_powered_on(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn scan_for(&self, service: Uuid) {
        self.record(Call::ScanFor(service));
    }

    fn stop_scan(&self) {
        self.record(Call::StopScan);
    }

    fn connect(&self, device: &DeviceId) {
        self.record(Call::Connect(device.clone()));
    }

    fn cancel_connection(&self, device: &DeviceId) {
        self.record(Call::CancelConnection(device.clone()));
    }

    fn discover_services(&self, device: &DeviceId) {
        self.record(Call::DiscoverServices(device.clone()));
    }

    fn write_value(&self, device: &DeviceId, characteristic: CharacteristicRef, value: &[u8], with_response: bool) {
        self.record(Call::Write(device.clone(), characteristic, value.to_vec(), with_response));
    }

    fn read_value(&self, device: &DeviceId, characteristic: CharacteristicRef) {
        self.record(Call::Read(device.clone(), characteristic));
    }

    fn set_notify(&self, device: &DeviceId, characteristic: CharacteristicRef, enabled: bool) {
        self.record(Call::SetNotify(device.clone(), characteristic, enabled));
    }
}

/// A session wired to a mock radio the test plays by hand
pub struct Harness {
    pub session: BluetoothSession,
    sink: EventSink,
    calls: mpsc::UnboundedReceiver<Call>,
    powered: Arc<AtomicBool>,
}

pub fn config() -> SessionConfig {
    SessionConfig::new(SERVICE)
}

pub fn layout() -> GattLayout {
    GattLayout::new().with_service(SERVICE, [RX, TX])
}

impl Harness {
    pub fn start(config: SessionConfig) -> Self {
        let (tx, calls) = mpsc::unbounded_channel();
        let powered = Arc::new(AtomicBool::new(true));
        let mut captured = None;
        let session = BluetoothSession::spawn(&config, |sink| {
            captured = Some(sink);
            MockTransport {
                powered: powered.clone(),
                calls: tx,
            }
        })
        .unwrap();

        Self {
            session,
            sink: captured.unwrap(),
            calls,
            powered,
        }
    }

    /// Hands out the session handle and the call log, dropping the harness's own sink.
    pub fn split(self) -> (BluetoothSession, mpsc::UnboundedReceiver<Call>) {
        (self.session, self.calls)
    }

    pub fn set_radio(&self, on: bool) {
        self.powered.store(on, Ordering::SeqCst);
    }

    pub fn emit(&self, event: TransportEvent) {
        assert!(self.sink.emit(event), "session is gone");
    }

    /// The next transport call, or `None` once the session dropped its transport.
    pub async fn next_call(&mut self) -> Option<Call> {
        self.calls.recv().await
    }

    pub async fn expect_call(&mut self) -> Call {
        self.next_call().await.expect("transport was dropped")
    }

    pub fn pending_calls(&mut self) -> Vec<Call> {
        let mut calls = Vec::new();
        while let Ok(call) = self.calls.try_recv() {
            calls.push(call);
        }
        calls
    }

    /// Runs a scan that finds `ids`, leaving them in the registry.
    pub async fn discover(&mut self, ids: &[&str]) {
        let mut states = self.session.scan_states();
        self.session.start_scan_for(Duration::from_secs(30)).unwrap();
        assert_eq!(self.expect_call().await, Call::ScanFor(SERVICE));
        for id in ids {
            self.emit(TransportEvent::PeripheralDiscovered {
                device: DeviceId::from(*id),
                name: Some(format!("periph-{}", id)),
                rssi: Some(-50),
            });
        }
        wait_for(&mut states, |state| matches!(state, ScanState::Scanning(d) if d.len() == ids.len())).await;
        self.session.stop_scan().unwrap();
        assert_eq!(self.expect_call().await, Call::StopScan);
    }

    /// Drives `id` from discovery all the way to `Ready`.
    pub async fn connect_ready(&mut self, id: &str) -> DeviceId {
        self.discover(&[id]).await;
        let device = DeviceId::from(id);

        let session = self.session.clone();
        let target = device.clone();
        let connecting = tokio::spawn(async move { session.connect(target).await });

        assert_eq!(self.expect_call().await, Call::Connect(device.clone()));
        self.emit(TransportEvent::Connected(device.clone()));
        assert_eq!(self.expect_call().await, Call::DiscoverServices(device.clone()));
        self.emit(TransportEvent::ServicesDiscovered(device.clone(), Ok(layout())));

        connecting.await.unwrap().unwrap();
        assert_eq!(self.session.connection_state(), ConnectionState::Ready);
        device
    }
}

/// Reads a subscription until `predicate` matches, returning everything seen.
pub async fn wait_for<T: Clone>(sub: &mut Subscription<T>, predicate: impl Fn(&T) -> bool) -> Vec<T> {
    let mut seen = Vec::new();
    while let Some(value) = sub.recv().await {
        let done = predicate(&value);
        seen.push(value);
        if done {
            return seen;
        }
    }
    panic!("subscription ended before the expected value arrived");
}

pub fn drain<T>(sub: &mut Subscription<T>) -> Vec<T> {
    let mut seen = Vec::new();
    while let Some(value) = sub.try_recv() {
        seen.push(value);
    }
    seen
}
