//! Bluetooth session orchestration
//! This module handles scanning, the lifecycle of the single peripheral link,
//! single-flight characteristic commands and notification fan-out. The radio
//! itself sits behind the [`Transport`] trait.

#[cfg(feature = "bluest")]
pub mod bluest_transport;
mod commands;
mod connection;
pub mod constants;
mod device;
mod error;
mod feed;
mod manager;
mod notification;
mod scanner;
#[cfg(test)]
mod testing;
mod timeout;
mod transport;
mod types;
mod worker;

// Re-export types that should be publicly accessible
#[cfg(feature = "bluest")]
pub use bluest_transport::BluestTransport;
pub use device::{Device, DeviceId};
pub use error::{BleError, ErrorKind};
pub use feed::Subscription;
pub use manager::BluetoothSession;
pub use timeout::{Expired, TimeoutSupervisor, TimerHandle};
pub use transport::{EventSink, Transport, TransportEvent};
pub use types::{
    CharacteristicRef, CommandKind, ConnectionState, GattLayout, Notification, ScanState, WriteMode,
};
