//! Cancellable delayed actions
//!
//! Every timer is a small tokio task that races a sleep against a
//! [`CancellationToken`]. On expiry it posts an [`Expired`] message into the
//! owner's event channel instead of running anything itself, so the action is
//! executed by whoever drains that channel: the session worker. The worker hands
//! the message back to [`TimeoutSupervisor::fire`], which only releases the
//! action while the handle is still armed. That gives at-most-once execution and
//! makes a cancel that races with expiry harmless.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use log::{debug, trace};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Identifies one scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Message posted when a timer elapses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired<A> {
    pub handle: TimerHandle,
    pub action: A,
}

pub struct TimeoutSupervisor<A, E = Expired<A>> {
    tx: mpsc::UnboundedSender<E>,
    armed: HashMap<TimerHandle, CancellationToken>,
    next_id: u64,
    _action: std::marker::PhantomData<fn(A)>,
}

impl<A, E> TimeoutSupervisor<A, E>
where
    A: fmt::Debug + Send + 'static,
    E: From<Expired<A>> + Send + 'static,
{
    pub fn new(tx: mpsc::UnboundedSender<E>) -> Self {
        Self {
            tx,
            armed: HashMap::new(),
            next_id: 0,
            _action: std::marker::PhantomData,
        }
    }

    /// Arms a timer that posts `action` after `duration` unless cancelled first.
    pub fn schedule(&mut self, duration: Duration, action: A) -> TimerHandle {
        self.next_id += 1;
        let handle = TimerHandle(self.next_id);
        let token = CancellationToken::new();
        let child = token.clone();
        let tx = self.tx.clone();

        trace!("Arming {} for {:?}: {:?}", handle, duration, action);
        tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    // The receiver is gone once the owner shut down; nothing left to notify.
                    let _ = tx.send(Expired { handle, action }.into());
                }
            }
        });

        self.armed.insert(handle, token);
        handle
    }

    /// Disarms a timer. Safe to call any number of times, before or after it fired.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if let Some(token) = self.armed.remove(&handle) {
            trace!("Cancelled {}", handle);
            token.cancel();
        }
    }

    /// Convenience for the common `Option<TimerHandle>` slot.
    pub fn cancel_slot(&mut self, slot: &mut Option<TimerHandle>) {
        if let Some(handle) = slot.take() {
            self.cancel(handle);
        }
    }

    pub fn cancel_all(&mut self) {
        if !self.armed.is_empty() {
            debug!("Cancelling {} armed timer(s)", self.armed.len());
        }
        for (_, token) in self.armed.drain() {
            token.cancel();
        }
    }

    /// Claims an expiry. Returns the action only if the timer was still armed.
    pub fn fire(&mut self, expired: Expired<A>) -> Option<A> {
        match self.armed.remove(&expired.handle) {
            Some(_) => Some(expired.action),
            None => {
                trace!("Dropping stale expiry of {}", expired.handle);
                None
            }
        }
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.armed.contains_key(&handle)
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }
}

impl<A, E> Drop for TimeoutSupervisor<A, E> {
    fn drop(&mut self) {
        for (_, token) in self.armed.drain() {
            token.cancel();
        }
    }
}
