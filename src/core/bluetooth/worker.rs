//! The serialized execution context of a session
//!
//! One [`SessionWorker`] task owns the scan registry, the connection state
//! machine, the command slots and the timers. Application requests, transport
//! callbacks and timer expiries all reach it as messages and are handled one at
//! a time, so none of that state needs a lock.

use std::ops::ControlFlow;
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::core::bluetooth::commands::{CommandSerializer, ReadReply, WriteReply};
use crate::core::bluetooth::connection::{ConnectReply, ConnectionStateMachine, DisconnectReply};
use crate::core::bluetooth::device::{Device, DeviceId};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::notification::NotificationRouter;
use crate::core::bluetooth::scanner::ScanRegistry;
use crate::core::bluetooth::timeout::{Expired, TimeoutSupervisor};
use crate::core::bluetooth::transport::{Transport, TransportEvent};
use crate::core::bluetooth::types::{CommandKind, WriteMode};

/// What a timer does when it elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    ScanTimeout,
    ConnectTimeout,
    PreDiscovery,
    DiscoveryTimeout,
    DisconnectTimeout,
    Reconnect,
    CommandDeadline(CommandKind),
}

/// Everything that arrives on the worker's event channel
#[derive(Debug)]
pub enum WorkerEvent {
    Transport(TransportEvent),
    Timer(Expired<TimerAction>),
}

impl From<Expired<TimerAction>> for WorkerEvent {
    fn from(expired: Expired<TimerAction>) -> Self {
        Self::Timer(expired)
    }
}

pub type Timers = TimeoutSupervisor<TimerAction, WorkerEvent>;

/// Application calls marshalled onto the worker
#[derive(Debug)]
pub(crate) enum Request {
    StartScan {
        timeout: Duration,
    },
    StopScan,
    Devices {
        reply: oneshot::Sender<Vec<Device>>,
    },
    Connect {
        device: DeviceId,
        reply: ConnectReply,
    },
    Write {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        mode: WriteMode,
        reply: WriteReply,
    },
    Read {
        service: Uuid,
        characteristic: Uuid,
        reply: ReadReply,
    },
    SetNotify {
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
        reply: oneshot::Sender<Result<(), BleError>>,
    },
    Disconnect {
        reply: DisconnectReply,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct SessionWorker<T> {
    transport: T,
    timers: Timers,
    scanner: ScanRegistry,
    connection: ConnectionStateMachine,
    commands: CommandSerializer,
    notifications: NotificationRouter,
    requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl<T: Transport> SessionWorker<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: T,
        timers: Timers,
        scanner: ScanRegistry,
        connection: ConnectionStateMachine,
        commands: CommandSerializer,
        notifications: NotificationRouter,
        requests: mpsc::UnboundedReceiver<Request>,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) -> Self {
        Self {
            transport,
            timers,
            scanner,
            connection,
            commands,
            notifications,
            requests,
            events,
        }
    }

    /// Processes messages until the session is closed or every handle is dropped.
    pub(crate) async fn run(mut self) {
        info!("Session worker started");
        loop {
            // Transport events and timer expiries already queued are applied before the next request.
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => self.handle_event(event),
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if self.handle_request(request).is_break() {
                            break;
                        }
                    }
                    None => {
                        info!("All session handles dropped, shutting down");
                        self.close();
                        break;
                    }
                },
            }
        }
        info!("Session worker stopped");
    }

    /// Applies one request. `Break` once the session has been closed.
    fn handle_request(&mut self, request: Request) -> ControlFlow<()> {
        trace!("Request: {:?}", request);
        match request {
            Request::StartScan { timeout } => {
                self.scanner.start_scan(timeout, &self.transport, &mut self.timers);
            }
            Request::StopScan => self.scanner.stop_scan(&self.transport, &mut self.timers),
            Request::Devices { reply } => {
                let _ = reply.send(self.scanner.devices().to_vec());
            }
            Request::Connect { device, reply } => self.connect(device, reply),
            Request::Write {
                service,
                characteristic,
                value,
                mode,
                reply,
            } => self.commands.write(
                self.connection.link(),
                service,
                characteristic,
                value,
                mode,
                reply,
                &self.transport,
                &mut self.timers,
            ),
            Request::Read {
                service,
                characteristic,
                reply,
            } => self.commands.read(
                self.connection.link(),
                service,
                characteristic,
                reply,
                &self.transport,
                &mut self.timers,
            ),
            Request::SetNotify {
                service,
                characteristic,
                enabled,
                reply,
            } => {
                let result = self.commands.set_notify(
                    self.connection.link(),
                    service,
                    characteristic,
                    enabled,
                    &self.transport,
                );
                let _ = reply.send(result);
            }
            Request::Disconnect { reply } => {
                self.connection.disconnect(reply, &self.transport, &mut self.timers);
                self.settle_commands();
            }
            Request::Close { reply } => {
                self.close();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn connect(&mut self, device: DeviceId, reply: ConnectReply) {
        if !self.transport.is_radio_powered_on() {
            warn!("Cannot connect to {}: Bluetooth is powered off", device);
            let _ = reply.send(Err(BleError::BluetoothDisabled));
            return;
        }
        if !self.scanner.contains(&device) {
            warn!("Cannot connect to {}: not found by the scan", device);
            let _ = reply.send(Err(BleError::PeripheralNotFound(device)));
            return;
        }
        self.connection.connect(device, reply, &self.transport, &mut self.timers);
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Transport(event) => self.handle_transport(event),
            WorkerEvent::Timer(expired) => {
                if let Some(action) = self.timers.fire(expired) {
                    self.handle_timer(action);
                }
            }
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        trace!("Transport event: {:?}", event);
        match event {
            TransportEvent::RadioStateChanged { powered_on } => {
                info!("Bluetooth radio powered {}", if powered_on { "on" } else { "off" });
                self.scanner.on_radio_state(powered_on, &self.transport, &mut self.timers);
                self.connection.on_radio_state(powered_on, &self.transport, &mut self.timers);
                self.settle_commands();
            }
            TransportEvent::PeripheralDiscovered { device, name, rssi } => {
                self.scanner.on_discovered(device, name, rssi);
            }
            TransportEvent::ScanFailed(error) => {
                self.scanner.on_scan_failed(error, &self.transport, &mut self.timers);
            }
            TransportEvent::Connected(device) => {
                self.connection.on_connected(&device, &self.transport, &mut self.timers);
            }
            TransportEvent::ConnectFailed(device, error) => {
                self.connection.on_connect_failed(&device, error, &mut self.timers);
            }
            TransportEvent::Disconnected(device, error) => {
                self.connection.on_disconnected(&device, error, &mut self.timers);
                self.settle_commands();
            }
            TransportEvent::ServicesDiscovered(device, result) => {
                self.connection
                    .on_services_discovered(&device, result, &self.transport, &mut self.timers);
                self.settle_commands();
            }
            TransportEvent::WriteCompleted(device, characteristic, result) => {
                if !self.connection.is_current(&device) {
                    debug!("Ignoring write completion from stale device {}", device);
                    return;
                }
                self.commands.on_write_completed(characteristic, result, &mut self.timers);
            }
            TransportEvent::ValueUpdated(device, characteristic, result) => {
                if !self.connection.is_current(&device) {
                    debug!("Ignoring value update from stale device {}", device);
                    return;
                }
                let Some(unclaimed) = self.commands.on_value_updated(characteristic, result, &mut self.timers)
                else {
                    return;
                };
                if self.connection.state().is_ready() {
                    self.notifications.route(characteristic, unclaimed);
                } else {
                    debug!("Dropping value update from {} while {}", characteristic, self.connection.state());
                }
            }
        }
    }

    fn handle_timer(&mut self, action: TimerAction) {
        debug!("Timer elapsed: {:?}", action);
        match action {
            TimerAction::ScanTimeout => self.scanner.on_timeout(&self.transport, &mut self.timers),
            TimerAction::CommandDeadline(kind) => self.commands.on_deadline(kind),
            connection_timer => {
                self.connection
                    .on_timer(connection_timer, &self.transport, &mut self.timers);
                self.settle_commands();
            }
        }
    }

    /// Commands can only be outstanding on a ready link.
    fn settle_commands(&mut self) {
        if !self.connection.state().is_ready() && self.commands.has_pending() {
            self.commands.fail_all(BleError::ConnectionClosed, &mut self.timers);
        }
    }

    fn close(&mut self) {
        info!("Closing session");
        self.commands.fail_all(BleError::ConnectionClosed, &mut self.timers);
        self.connection.close(&self.transport, &mut self.timers);
        self.scanner.close(&self.transport, &mut self.timers);
        self.notifications.close();
        self.timers.cancel_all();
    }
}
