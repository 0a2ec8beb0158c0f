//! Single-flight characteristic commands
//!
//! Reads and writes each own one slot. A command is admitted only while the
//! link is ready, the characteristic resolves against the discovered layout and
//! its slot is free; otherwise it is rejected on the spot. Nothing is queued,
//! so `Busy` means "try again", not "you are in line".

use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::core::bluetooth::device::DeviceId;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::timeout::TimerHandle;
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::{CharacteristicRef, CommandKind, GattLayout, WriteMode};
use crate::core::bluetooth::worker::{TimerAction, Timers};

pub type ReadReply = oneshot::Sender<Result<Vec<u8>, BleError>>;
pub type WriteReply = oneshot::Sender<Result<(), BleError>>;

/// Read-only view of a ready connection
#[derive(Debug, Clone, Copy)]
pub struct Link<'a> {
    pub device: &'a DeviceId,
    pub layout: &'a GattLayout,
}

enum Completion {
    Read(ReadReply),
    Write(WriteReply),
}

impl Completion {
    fn fail(self, error: BleError) {
        // A caller that stopped waiting has nothing left to learn.
        match self {
            Self::Read(reply) => {
                let _ = reply.send(Err(error));
            }
            Self::Write(reply) => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// The one outstanding command of a kind
pub struct PendingCommand {
    characteristic: CharacteristicRef,
    deadline: TimerHandle,
    completion: Completion,
}

pub struct CommandSerializer {
    timeout: Duration,
    read: Option<PendingCommand>,
    write: Option<PendingCommand>,
}

impl CommandSerializer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            read: None,
            write: None,
        }
    }

    fn slot(&mut self, kind: CommandKind) -> &mut Option<PendingCommand> {
        match kind {
            CommandKind::Read => &mut self.read,
            CommandKind::Write => &mut self.write,
        }
    }

    /// Admission checks shared by every command, in the order callers observe them.
    fn admit<'a>(
        &self,
        link: Option<Link<'a>>,
        kind: Option<CommandKind>,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(&'a DeviceId, CharacteristicRef), BleError> {
        let link = link.ok_or(BleError::NotConnected)?;
        let target = link.layout.resolve(service, characteristic)?;
        if let Some(kind) = kind {
            let busy = match kind {
                CommandKind::Read => self.read.is_some(),
                CommandKind::Write => self.write.is_some(),
            };
            if busy {
                return Err(BleError::Busy(kind.as_str()));
            }
        }
        Ok((link.device, target))
    }

    pub fn read(
        &mut self,
        link: Option<Link<'_>>,
        service: Uuid,
        characteristic: Uuid,
        reply: ReadReply,
        transport: &dyn Transport,
        timers: &mut Timers,
    ) {
        let (device, target) = match self.admit(link, Some(CommandKind::Read), service, characteristic) {
            Ok(admitted) => admitted,
            Err(e) => {
                debug!("Read of {}/{} rejected: {}", service, characteristic, e);
                let _ = reply.send(Err(e));
                return;
            }
        };

        let deadline = timers.schedule(self.timeout, TimerAction::CommandDeadline(CommandKind::Read));
        self.read = Some(PendingCommand {
            characteristic: target,
            deadline,
            completion: Completion::Read(reply),
        });
        debug!("Reading {} from {}", target, device);
        transport.read_value(device, target);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &mut self,
        link: Option<Link<'_>>,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        mode: WriteMode,
        reply: WriteReply,
        transport: &dyn Transport,
        timers: &mut Timers,
    ) {
        let (device, target) = match self.admit(link, Some(CommandKind::Write), service, characteristic) {
            Ok(admitted) => admitted,
            Err(e) => {
                debug!("Write to {}/{} rejected: {}", service, characteristic, e);
                let _ = reply.send(Err(e));
                return;
            }
        };

        match mode {
            WriteMode::WithoutResponse => {
                debug!("Writing {} byte(s) to {} without response", value.len(), target);
                transport.write_value(device, target, &value, false);
                let _ = reply.send(Ok(()));
            }
            WriteMode::WithResponse => {
                let deadline = timers.schedule(self.timeout, TimerAction::CommandDeadline(CommandKind::Write));
                self.write = Some(PendingCommand {
                    characteristic: target,
                    deadline,
                    completion: Completion::Write(reply),
                });
                debug!("Writing {} byte(s) to {}", value.len(), target);
                transport.write_value(device, target, &value, true);
            }
        }
    }

    /// Enables or disables notifications. Checked like a command but holds no slot.
    pub fn set_notify(
        &self,
        link: Option<Link<'_>>,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
        transport: &dyn Transport,
    ) -> Result<(), BleError> {
        let (device, target) = self.admit(link, None, service, characteristic)?;
        info!(
            "{} notifications on {}",
            if enabled { "Enabling" } else { "Disabling" },
            target
        );
        transport.set_notify(device, target, enabled);
        Ok(())
    }

    /// Resolves the outstanding write. Returns `false` if nothing was waiting on `characteristic`.
    pub fn on_write_completed(
        &mut self,
        characteristic: CharacteristicRef,
        result: Result<(), BleError>,
        timers: &mut Timers,
    ) -> bool {
        let matches = self
            .write
            .as_ref()
            .is_some_and(|pending| pending.characteristic == characteristic);
        if !matches {
            debug!("Ignoring write completion for {} with no matching write", characteristic);
            return false;
        }

        if let Some(pending) = self.write.take() {
            timers.cancel(pending.deadline);
            match pending.completion {
                Completion::Write(reply) => {
                    let _ = reply.send(result);
                }
                other => other.fail(BleError::Gatt("mismatched completion".into())),
            }
        }
        true
    }

    /// Resolves the outstanding read with a value update. Hands the update back
    /// when no read was waiting on `characteristic`, so it can be routed as a
    /// notification instead.
    pub fn on_value_updated(
        &mut self,
        characteristic: CharacteristicRef,
        result: Result<Vec<u8>, BleError>,
        timers: &mut Timers,
    ) -> Option<Result<Vec<u8>, BleError>> {
        let matches = self
            .read
            .as_ref()
            .is_some_and(|pending| pending.characteristic == characteristic);
        if !matches {
            return Some(result);
        }

        if let Some(pending) = self.read.take() {
            timers.cancel(pending.deadline);
            match pending.completion {
                Completion::Read(reply) => {
                    let _ = reply.send(result);
                }
                other => other.fail(BleError::Gatt("mismatched completion".into())),
            }
        }
        None
    }

    /// The deadline of the `kind` slot elapsed.
    pub fn on_deadline(&mut self, kind: CommandKind) {
        if let Some(pending) = self.slot(kind).take() {
            warn!("{} of {} timed out", kind.as_str(), pending.characteristic);
            pending
                .completion
                .fail(BleError::Timeout(format!("{} of {}", kind.as_str(), pending.characteristic)));
        }
    }

    /// Resolves every outstanding command with `error` and frees both slots.
    pub fn fail_all(&mut self, error: BleError, timers: &mut Timers) {
        for kind in [CommandKind::Read, CommandKind::Write] {
            if let Some(pending) = self.slot(kind).take() {
                info!("Failing pending {} of {}: {}", kind.as_str(), pending.characteristic, error);
                timers.cancel(pending.deadline);
                pending.completion.fail(error.clone());
            }
        }
    }

    pub fn is_pending(&self, kind: CommandKind) -> bool {
        match kind {
            CommandKind::Read => self.read.is_some(),
            CommandKind::Write => self.write.is_some(),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.read.is_some() || self.write.is_some()
    }
}
