//! Application-facing handle of a BLE session
//! Every call is forwarded to the session worker and awaited there, so the
//! handle itself holds no session state and can be cloned freely.

use std::time::Duration;

use anyhow::Result;
use log::{debug, info};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::core::bluetooth::commands::CommandSerializer;
use crate::core::bluetooth::connection::{ConnectionPolicy, ConnectionStateMachine};
use crate::core::bluetooth::device::{Device, DeviceId};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::feed::{EventFeed, Subscription};
use crate::core::bluetooth::notification::NotificationRouter;
use crate::core::bluetooth::scanner::ScanRegistry;
use crate::core::bluetooth::transport::{EventSink, Transport};
use crate::core::bluetooth::types::{
    CharacteristicRef, ConnectionState, Notification, ScanState, WriteMode,
};
use crate::core::bluetooth::worker::{Request, SessionWorker, Timers};

/// Handle to a running session
#[derive(Clone)]
pub struct BluetoothSession {
    requests: mpsc::UnboundedSender<Request>,
    scan_states: EventFeed<ScanState>,
    connection_states: EventFeed<ConnectionState>,
    notifications: EventFeed<Notification>,
    scan_timeout: Duration,
}

impl BluetoothSession {
    /// Validates `config` and starts the session worker on the current tokio runtime.
    ///
    /// `make_transport` receives the sink the driver must report its callbacks to.
    /// The worker shuts down after [`BluetoothSession::close`] or once every
    /// clone of the handle is dropped.
    pub fn spawn<T, F>(config: &SessionConfig, make_transport: F) -> Result<Self>
    where
        T: Transport + 'static,
        F: FnOnce(EventSink) -> T,
    {
        config.validate()?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let scan_states = EventFeed::replaying(ScanState::Idle);
        let connection_states = EventFeed::replaying(ConnectionState::Disconnected);
        let notifications = EventFeed::live();

        let policy = ConnectionPolicy {
            connection_timeout: config.connection_timeout(),
            pre_discovery_delay: config.pre_discovery_delay(),
            disconnect_timeout: config.connection_timeout(),
            auto_reconnect: config.auto_reconnect,
            reconnect_delay: config.reconnect_delay(),
            auto_notify: config
                .notify_characteristic_uuid
                .filter(|_| config.auto_enable_notify)
                .map(|characteristic| CharacteristicRef::new(config.service_uuid, characteristic)),
        };

        let transport = make_transport(EventSink::new(event_tx.clone()));
        let worker = SessionWorker::new(
            transport,
            Timers::new(event_tx),
            ScanRegistry::new(config.service_uuid, scan_states.clone()),
            ConnectionStateMachine::new(policy, connection_states.clone()),
            CommandSerializer::new(config.command_timeout()),
            NotificationRouter::new(notifications.clone()),
            request_rx,
            event_rx,
        );
        tokio::spawn(worker.run());
        info!("BLE session started for service {}", config.service_uuid);

        Ok(Self {
            requests: request_tx,
            scan_states,
            connection_states,
            notifications,
            scan_timeout: config.scan_timeout(),
        })
    }

    fn send(&self, request: Request) -> Result<(), BleError> {
        self.requests.send(request).map_err(|_| {
            debug!("Session worker is gone");
            BleError::ConnectionClosed
        })
    }

    /// Sends a request and waits for the worker's reply.
    async fn call<R>(&self, request: impl FnOnce(oneshot::Sender<R>) -> Request) -> Result<R, BleError> {
        let (tx, rx) = oneshot::channel();
        self.send(request(tx))?;
        rx.await.map_err(|_| BleError::ConnectionClosed)
    }

    /// Scan states, starting with the current one.
    pub fn scan_states(&self) -> Subscription<ScanState> {
        self.scan_states.subscribe()
    }

    /// Connection states, starting with the current one.
    pub fn connection_states(&self) -> Subscription<ConnectionState> {
        self.connection_states.subscribe()
    }

    /// Notifications received from now on.
    pub fn notifications(&self) -> Subscription<Notification> {
        self.notifications.subscribe()
    }

    pub fn scan_state(&self) -> ScanState {
        self.scan_states.latest().unwrap_or(ScanState::Idle)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_states
            .latest()
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Devices found by the latest scan, in discovery order.
    pub async fn devices(&self) -> Result<Vec<Device>, BleError> {
        self.call(|reply| Request::Devices { reply }).await
    }

    /// Starts a scan bounded by the configured scan timeout.
    pub fn start_scan(&self) -> Result<(), BleError> {
        self.start_scan_for(self.scan_timeout)
    }

    /// Starts a scan bounded by `timeout`. Progress and failures are reported
    /// on [`BluetoothSession::scan_states`].
    pub fn start_scan_for(&self, timeout: Duration) -> Result<(), BleError> {
        self.send(Request::StartScan { timeout })
    }

    pub fn stop_scan(&self) -> Result<(), BleError> {
        self.send(Request::StopScan)
    }

    /// Connects to a device found by the latest scan and waits until its
    /// services are discovered.
    pub async fn connect(&self, device: impl Into<DeviceId>) -> Result<(), BleError> {
        let device = device.into();
        self.call(|reply| Request::Connect { device, reply }).await?
    }

    pub async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
        mode: WriteMode,
    ) -> Result<(), BleError> {
        let value = value.into();
        self.call(|reply| Request::Write {
            service,
            characteristic,
            value,
            mode,
            reply,
        })
        .await?
    }

    pub async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>, BleError> {
        self.call(|reply| Request::Read {
            service,
            characteristic,
            reply,
        })
        .await?
    }

    /// Turns notifications of a characteristic on or off. Values arrive on
    /// [`BluetoothSession::notifications`].
    pub async fn set_notify(&self, service: Uuid, characteristic: Uuid, enabled: bool) -> Result<(), BleError> {
        self.call(|reply| Request::SetNotify {
            service,
            characteristic,
            enabled,
            reply,
        })
        .await?
    }

    /// Drops the link and waits for the transport to confirm it.
    pub async fn disconnect(&self) -> Result<(), BleError> {
        self.call(|reply| Request::Disconnect { reply }).await?
    }

    /// Tears the session down. Outstanding operations fail with
    /// `ConnectionClosed` and so does every later call. Closing twice is fine.
    pub async fn close(&self) -> Result<(), BleError> {
        match self.call(|reply| Request::Close { reply }).await {
            Ok(()) | Err(BleError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Whether the worker is still accepting requests.
    pub fn is_open(&self) -> bool {
        !self.requests.is_closed()
    }
}
