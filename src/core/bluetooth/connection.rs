//! Connection lifecycle of the single peripheral link
//!
//! The state machine exclusively owns the identity of the connected device and
//! the discovered GATT layout. Other components only see a [`Link`] snapshot
//! while the connection is `Ready`.

use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::oneshot;

use crate::core::bluetooth::commands::Link;
use crate::core::bluetooth::device::DeviceId;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::feed::EventFeed;
use crate::core::bluetooth::timeout::TimerHandle;
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::{CharacteristicRef, ConnectionState, GattLayout};
use crate::core::bluetooth::worker::{TimerAction, Timers};

pub type ConnectReply = oneshot::Sender<Result<(), BleError>>;
pub type DisconnectReply = oneshot::Sender<Result<(), BleError>>;

/// Timing and recovery knobs of the state machine
#[derive(Debug, Clone)]
pub struct ConnectionPolicy {
    pub connection_timeout: Duration,
    pub pre_discovery_delay: Duration,
    pub disconnect_timeout: Duration,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    /// Characteristic to subscribe to as soon as the link is ready
    pub auto_notify: Option<CharacteristicRef>,
}

/// The one connection attempt or link the session is tracking
#[derive(Debug)]
pub struct ConnectionSession {
    device: DeviceId,
    layout: Option<GattLayout>,
    timer: Option<TimerHandle>,
}

impl ConnectionSession {
    fn new(device: DeviceId) -> Self {
        Self {
            device,
            layout: None,
            timer: None,
        }
    }
}

pub struct ConnectionStateMachine {
    policy: ConnectionPolicy,
    state: ConnectionState,
    session: Option<ConnectionSession>,
    connect_waiter: Option<ConnectReply>,
    disconnect_waiters: Vec<DisconnectReply>,
    /// Set while the current attempt was started by the reconnect timer
    reconnecting: bool,
    feed: EventFeed<ConnectionState>,
}

impl ConnectionStateMachine {
    pub fn new(policy: ConnectionPolicy, feed: EventFeed<ConnectionState>) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            session: None,
            connect_waiter: None,
            disconnect_waiters: Vec::new(),
            reconnecting: false,
            feed,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    #[cfg(test)]
    pub fn session(&self) -> Option<&ConnectionSession> {
        self.session.as_ref()
    }

    /// The ready link, if any, for issuing commands.
    pub fn link(&self) -> Option<Link<'_>> {
        if !self.state.is_ready() {
            return None;
        }
        let session = self.session.as_ref()?;
        Some(Link {
            device: &session.device,
            layout: session.layout.as_ref()?,
        })
    }

    /// Whether `device` is the peripheral the current session is about.
    pub fn is_current(&self, device: &DeviceId) -> bool {
        self.session.as_ref().is_some_and(|session| &session.device == device)
    }

    /// Whether an automatic reconnect is scheduled.
    pub fn reconnect_pending(&self) -> bool {
        matches!(self.state, ConnectionState::Error(_))
            && self.session.as_ref().is_some_and(|session| session.timer.is_some())
    }

    fn transition(&mut self, next: ConnectionState) {
        info!("Connection state: {} -> {}", self.state, next);
        self.state = next.clone();
        self.feed.publish(next);
    }

    fn cancel_timer(&mut self, timers: &mut Timers) {
        if let Some(session) = self.session.as_mut() {
            timers.cancel_slot(&mut session.timer);
        }
    }

    fn arm(&mut self, timers: &mut Timers, duration: Duration, action: TimerAction) {
        if let Some(session) = self.session.as_mut() {
            timers.cancel_slot(&mut session.timer);
            session.timer = Some(timers.schedule(duration, action));
        }
    }

    fn resolve_connect(&mut self, result: Result<(), BleError>) {
        if let Some(reply) = self.connect_waiter.take() {
            let _ = reply.send(result);
        }
    }

    fn resolve_disconnects(&mut self, result: Result<(), BleError>) {
        for reply in self.disconnect_waiters.drain(..) {
            let _ = reply.send(result.clone());
        }
    }

    /// Starts connecting to `device`. Rejected with `Busy` while another
    /// attempt or link is in progress.
    pub fn connect(
        &mut self,
        device: DeviceId,
        reply: ConnectReply,
        transport: &dyn Transport,
        timers: &mut Timers,
    ) {
        if self.state.holds_link() {
            warn!("Ignoring connect to {}: connection is {}", device, self.state);
            let _ = reply.send(Err(BleError::Busy("connect")));
            return;
        }

        if self.reconnect_pending() {
            info!("Explicit connect supersedes the pending reconnect");
        }
        self.cancel_timer(timers);
        self.session = None;
        self.reconnecting = false;

        self.connect_waiter = Some(reply);
        self.begin_connect(device, transport, timers);
    }

    fn begin_connect(&mut self, device: DeviceId, transport: &dyn Transport, timers: &mut Timers) {
        debug_assert!(self.session.is_none(), "a second connection session was created");
        info!("Initiating connection to {}...", device);
        self.session = Some(ConnectionSession::new(device.clone()));
        self.transition(ConnectionState::Connecting);
        self.arm(timers, self.policy.connection_timeout, TimerAction::ConnectTimeout);
        transport.connect(&device);
    }

    pub fn on_connected(&mut self, device: &DeviceId, transport: &dyn Transport, timers: &mut Timers) {
        if !self.is_current(device) || self.state != ConnectionState::Connecting {
            debug!("Ignoring connect success for {} while {}", device, self.state);
            return;
        }

        self.cancel_timer(timers);
        info!("Connection successful, discovering services...");
        self.transition(ConnectionState::Discovering);
        if self.policy.pre_discovery_delay.is_zero() {
            self.start_discovery(transport, timers);
        } else {
            debug!("Delaying service discovery by {:?}", self.policy.pre_discovery_delay);
            self.arm(timers, self.policy.pre_discovery_delay, TimerAction::PreDiscovery);
        }
    }

    fn start_discovery(&mut self, transport: &dyn Transport, timers: &mut Timers) {
        let Some(device) = self.session.as_ref().map(|session| session.device.clone()) else {
            return;
        };
        self.arm(timers, self.policy.connection_timeout, TimerAction::DiscoveryTimeout);
        transport.discover_services(&device);
    }

    pub fn on_connect_failed(&mut self, device: &DeviceId, error: BleError, timers: &mut Timers) {
        if !self.is_current(device) || self.state != ConnectionState::Connecting {
            debug!("Ignoring connect failure for {}: {}", device, error);
            return;
        }

        error!("Failed to connect to {}: {}", device, error);
        self.cancel_timer(timers);
        if self.retries_reconnect() {
            self.retry_reconnect(error, timers);
            return;
        }
        self.session = None;
        self.transition(ConnectionState::Error(error.clone()));
        self.resolve_connect(Err(error));
    }

    pub fn on_services_discovered(
        &mut self,
        device: &DeviceId,
        result: Result<GattLayout, BleError>,
        transport: &dyn Transport,
        timers: &mut Timers,
    ) {
        if !self.is_current(device) || self.state != ConnectionState::Discovering {
            debug!("Ignoring service discovery result for {} while {}", device, self.state);
            return;
        }

        self.cancel_timer(timers);
        let layout = match result {
            Ok(layout) => layout,
            Err(e) => {
                error!("Service discovery failed: {}", e);
                self.abort_link(e, transport, timers);
                return;
            }
        };

        info!(
            "Discovered {} service(s) with {} characteristic(s)",
            layout.service_count(),
            layout.characteristic_count()
        );
        let auto_notify = self
            .policy
            .auto_notify
            .map(|target| layout.resolve(target.service, target.characteristic));
        if let Some(session) = self.session.as_mut() {
            session.layout = Some(layout);
        }
        self.reconnecting = false;
        self.transition(ConnectionState::Ready);
        self.resolve_connect(Ok(()));

        match auto_notify {
            Some(Ok(target)) => {
                info!("Setting up notifications on {}", target);
                transport.set_notify(device, target, true);
            }
            Some(Err(e)) => warn!("Cannot auto-enable notifications: {}", e),
            None => {}
        }
    }

    /// Connect or discovery failed on a half-open link: report the error, then
    /// unwind to `Disconnected` without waiting for the transport.
    fn abort_link(&mut self, error: BleError, transport: &dyn Transport, timers: &mut Timers) {
        self.cancel_timer(timers);
        if self.retries_reconnect() {
            if let Some(session) = self.session.as_ref() {
                transport.cancel_connection(&session.device);
            }
            self.retry_reconnect(error, timers);
            return;
        }
        let session = self.session.take();
        self.transition(ConnectionState::Error(error.clone()));
        self.resolve_connect(Err(error));
        if let Some(session) = session {
            transport.cancel_connection(&session.device);
        }
        self.transition(ConnectionState::Disconnected);
    }

    /// A failed reconnect attempt is retried for as long as auto-reconnect is on.
    fn retries_reconnect(&self) -> bool {
        self.reconnecting && self.policy.auto_reconnect && self.session.is_some()
    }

    fn retry_reconnect(&mut self, error: BleError, timers: &mut Timers) {
        warn!("Reconnect attempt failed ({}), retrying in {:?}", error, self.policy.reconnect_delay);
        if let Some(session) = self.session.as_mut() {
            session.layout = None;
        }
        self.transition(ConnectionState::Error(error));
        self.arm(timers, self.policy.reconnect_delay, TimerAction::Reconnect);
    }

    pub fn disconnect(&mut self, reply: DisconnectReply, transport: &dyn Transport, timers: &mut Timers) {
        match self.state {
            ConnectionState::Disconnected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Error(_) => {
                if self.reconnect_pending() {
                    info!("Cancelling pending reconnect");
                }
                self.cancel_timer(timers);
                self.session = None;
                self.reconnecting = false;
                self.transition(ConnectionState::Disconnected);
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Disconnecting => {
                self.disconnect_waiters.push(reply);
            }
            ConnectionState::Connecting | ConnectionState::Discovering | ConnectionState::Ready => {
                let Some(device) = self.session.as_ref().map(|session| session.device.clone()) else {
                    let _ = reply.send(Ok(()));
                    return;
                };
                info!("Disconnecting from {}", device);
                self.resolve_connect(Err(BleError::ConnectionClosed));
                self.disconnect_waiters.push(reply);
                self.transition(ConnectionState::Disconnecting);
                self.arm(timers, self.policy.disconnect_timeout, TimerAction::DisconnectTimeout);
                transport.cancel_connection(&device);
            }
        }
    }

    fn finish_disconnect(&mut self, timers: &mut Timers) {
        self.cancel_timer(timers);
        self.session = None;
        self.reconnecting = false;
        self.transition(ConnectionState::Disconnected);
        self.resolve_disconnects(Ok(()));
    }

    pub fn on_disconnected(
        &mut self,
        device: &DeviceId,
        error: Option<BleError>,
        timers: &mut Timers,
    ) {
        if !self.is_current(device) {
            debug!("Ignoring disconnect of stale device {}", device);
            return;
        }

        if self.state == ConnectionState::Disconnecting {
            info!("Disconnected from {}", device);
            self.finish_disconnect(timers);
            return;
        }
        if !self.state.is_active() {
            debug!("Ignoring disconnect of {} while {}", device, self.state);
            return;
        }

        self.cancel_timer(timers);
        match error {
            Some(cause) => {
                warn!("Device {} disconnected unexpectedly: {}", device, cause);
                let error = match cause {
                    BleError::DisconnectedByDevice(_) => cause,
                    other => BleError::DisconnectedByDevice(other.to_string()),
                };
                self.resolve_connect(Err(error.clone()));
                self.transition(ConnectionState::Error(error));
                if self.policy.auto_reconnect {
                    info!("Reconnecting to {} in {:?}", device, self.policy.reconnect_delay);
                    if let Some(session) = self.session.as_mut() {
                        session.layout = None;
                    }
                    self.arm(timers, self.policy.reconnect_delay, TimerAction::Reconnect);
                } else {
                    self.session = None;
                    self.reconnecting = false;
                    self.transition(ConnectionState::Disconnected);
                }
            }
            None => {
                info!("Device {} disconnected", device);
                self.resolve_connect(Err(BleError::ConnectionClosed));
                self.session = None;
                self.reconnecting = false;
                self.transition(ConnectionState::Disconnected);
            }
        }
    }

    /// Radio power loss takes any link down with it.
    pub fn on_radio_state(&mut self, powered_on: bool, transport: &dyn Transport, timers: &mut Timers) {
        if powered_on {
            return;
        }
        if self.state.is_active() {
            warn!("Bluetooth powered off while {}", self.state);
            self.abort_link(BleError::BluetoothDisabled, transport, timers);
        } else if self.state == ConnectionState::Disconnecting {
            self.finish_disconnect(timers);
        }
    }

    /// Runs a connection timer the supervisor released.
    pub fn on_timer(&mut self, action: TimerAction, transport: &dyn Transport, timers: &mut Timers) {
        if let Some(session) = self.session.as_mut() {
            session.timer = None;
        }

        match action {
            TimerAction::ConnectTimeout if self.state == ConnectionState::Connecting => {
                warn!("Connection attempt timed out after {:?}", self.policy.connection_timeout);
                self.abort_link(BleError::Timeout("connect".into()), transport, timers);
            }
            TimerAction::PreDiscovery if self.state == ConnectionState::Discovering => {
                self.start_discovery(transport, timers);
            }
            TimerAction::DiscoveryTimeout if self.state == ConnectionState::Discovering => {
                warn!("Service discovery timed out after {:?}", self.policy.connection_timeout);
                self.abort_link(BleError::Timeout("service discovery".into()), transport, timers);
            }
            TimerAction::DisconnectTimeout if self.state == ConnectionState::Disconnecting => {
                warn!("Transport never confirmed the disconnect, forcing it");
                self.finish_disconnect(timers);
            }
            TimerAction::Reconnect if matches!(self.state, ConnectionState::Error(_)) => {
                self.reconnect(transport, timers);
            }
            other => debug!("Timer {:?} no longer applies while {}", other, self.state),
        }
    }

    fn reconnect(&mut self, transport: &dyn Transport, timers: &mut Timers) {
        let Some(device) = self.session.take().map(|session| session.device) else {
            return;
        };

        if !transport.is_radio_powered_on() {
            warn!("Bluetooth is powered off, retrying reconnect in {:?}", self.policy.reconnect_delay);
            self.session = Some(ConnectionSession::new(device));
            self.arm(timers, self.policy.reconnect_delay, TimerAction::Reconnect);
            return;
        }

        info!("Attempting to reconnect to {}", device);
        self.reconnecting = true;
        self.begin_connect(device, transport, timers);
    }

    /// Tears everything down and settles at `Disconnected`, whatever the state.
    pub fn close(&mut self, transport: &dyn Transport, timers: &mut Timers) {
        self.cancel_timer(timers);
        self.reconnecting = false;
        if let Some(session) = self.session.take() {
            if self.state.holds_link() {
                info!("Releasing link to {}", session.device);
                transport.cancel_connection(&session.device);
            }
        }
        self.resolve_connect(Err(BleError::ConnectionClosed));
        self.resolve_disconnects(Err(BleError::ConnectionClosed));
        if self.state != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected);
        }
        self.feed.close();
    }
}
