//! Defines shared data structures for the Bluetooth module.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::device::Device;
use crate::core::bluetooth::error::BleError;

/// State published on the scan-state stream
#[derive(Debug, Clone, PartialEq)]
pub enum ScanState {
    Idle,
    /// Scanning, carrying every distinct device found so far in this cycle
    Scanning(Vec<Device>),
    Stopped,
    Error(BleError),
}

/// Lifecycle state of the single peripheral connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Discovering,
    Ready,
    Disconnecting,
    Error(BleError),
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// States in which a physical link is being established, is up, or is being torn down.
    pub fn holds_link(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Discovering | Self::Ready | Self::Disconnecting
        )
    }

    /// States from which an unsolicited disconnect or a `disconnect()` call applies.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Discovering | Self::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Discovering => f.write_str("discovering"),
            Self::Ready => f.write_str("ready"),
            Self::Disconnecting => f.write_str("disconnecting"),
            Self::Error(e) => write!(f, "error({:?}: {})", e.kind(), e),
        }
    }
}

/// Address of a characteristic within a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicRef {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Services and characteristics found by discovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GattLayout {
    services: HashMap<Uuid, HashSet<Uuid>>,
}

impl GattLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`GattLayout::insert_service`]
    pub fn with_service(mut self, service: Uuid, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
        self.insert_service(service, characteristics);
        self
    }

    pub fn insert_service(&mut self, service: Uuid, characteristics: impl IntoIterator<Item = Uuid>) {
        self.services.entry(service).or_default().extend(characteristics);
    }

    /// Resolves a characteristic address against the discovered layout.
    pub fn resolve(&self, service: Uuid, characteristic: Uuid) -> Result<CharacteristicRef, BleError> {
        let characteristics = self
            .services
            .get(&service)
            .ok_or(BleError::ServiceNotFound(service))?;
        if characteristics.contains(&characteristic) {
            Ok(CharacteristicRef::new(service, characteristic))
        } else {
            Err(BleError::CharacteristicNotFound(characteristic))
        }
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn characteristic_count(&self) -> usize {
        self.services.values().map(HashSet::len).sum()
    }
}

/// Write acknowledgement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Single-flight slot a command occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Read,
    Write,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// An unsolicited characteristic value pushed by the peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: CharacteristicRef,
    pub value: Vec<u8>,
}
