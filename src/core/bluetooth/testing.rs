//! Test doubles shared by the unit tests of the bluetooth module.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::device::DeviceId;
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::CharacteristicRef;
use crate::core::bluetooth::worker::{Timers, WorkerEvent};

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

/// Transport that only records what it was asked to do.
#[derive(Clone)]
pub struct RecordingTransport {
    radio_on: Arc<AtomicBool>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            radio_on: Arc::new(AtomicBool::new(true)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_radio(&self, on: bool) {
        self.radio_on.store(on, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Transport for RecordingTransport {
    fn is_radio_powered_on(&self) -> bool {
        self.radio_on.load(Ordering::SeqCst)
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

pub fn timers() -> (Timers, mpsc::UnboundedReceiver<WorkerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Timers::new(tx), rx)
}
