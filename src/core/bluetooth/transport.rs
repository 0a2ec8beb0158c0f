//! Boundary to the platform BLE driver
//!
//! The session never awaits the driver. Every [`Transport`] method is a
//! non-blocking dispatch; its outcome comes back later as a [`TransportEvent`]
//! pushed through the [`EventSink`] the driver was built with. Drivers are
//! expected to translate their native failures into [`BleError`] before
//! emitting them.

use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::device::DeviceId;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::worker::WorkerEvent;
use crate::core::bluetooth::types::{CharacteristicRef, GattLayout};

/// Operations the session issues to the radio driver
pub trait Transport: Send + Sync {
    fn is_radio_powered_on(&self) -> bool;

    /// Starts advertisement discovery filtered to peripherals offering `service`.
    fn scan_for(&self, service: Uuid);

    fn stop_scan(&self);

    fn connect(&self, device: &DeviceId);

    /// Aborts a pending connect or drops an established link.
    fn cancel_connection(&self, device: &DeviceId);

    fn discover_services(&self, device: &DeviceId);

    fn write_value(
        &self,
        device: &DeviceId,
        characteristic: CharacteristicRef,
        value: &[u8],
        with_response: bool,
    );

    fn read_value(&self, device: &DeviceId, characteristic: CharacteristicRef);

    fn set_notify(&self, device: &DeviceId, characteristic: CharacteristicRef, enabled: bool);
}

/// Callbacks the driver reports back
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    RadioStateChanged {
        powered_on: bool,
    },
    PeripheralDiscovered {
        device: DeviceId,
        name: Option<String>,
        rssi: Option<i16>,
    },
    ScanFailed(BleError),
    Connected(DeviceId),
    ConnectFailed(DeviceId, BleError),
    /// Link lost. `None` means a clean, requested disconnect.
    Disconnected(DeviceId, Option<BleError>),
    ServicesDiscovered(DeviceId, Result<GattLayout, BleError>),
    WriteCompleted(DeviceId, CharacteristicRef, Result<(), BleError>),
    /// Both read responses and notifications arrive here.
    ValueUpdated(DeviceId, CharacteristicRef, Result<Vec<u8>, BleError>),
}

/// Handle a driver uses to report [`TransportEvent`]s to its session
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self { tx }
    }

    /// Queues an event for the session. Returns `false` once the session is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        match self.tx.send(WorkerEvent::Transport(event)) {
            Ok(()) => true,
            Err(_) => {
                debug!("Session has shut down, dropping transport event");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
