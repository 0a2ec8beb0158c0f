//! Bluetooth device representation and related functionality

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable, platform-independent identity of a peripheral.
///
/// The string is whatever the transport driver uses to name a device (a MAC
/// address on most platforms, a UUID on macOS). The session never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Identity the device was first seen with
    pub id: DeviceId,
    /// The advertised local name, if the first advertisement carried one
    pub name: Option<String>,
    /// The signal strength (RSSI) of the first advertisement
    pub rssi: Option<i16>,
    /// When the device was last heard from during the current scan
    pub last_seen: DateTime<Utc>,
}

impl Device {
    /// Creates a new Device first seen now
    pub fn new(id: DeviceId, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            id,
            name,
            rssi,
            last_seen: Utc::now(),
        }
    }

    /// Display name, falling back to the identity
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}
