//! Session orchestration for a single BLE peripheral.
//!
//! [`BluetoothSession`] drives scanning, the connection lifecycle,
//! single-flight reads and writes, timeouts and automatic reconnection on top
//! of any driver implementing [`Transport`].

pub mod config;
pub mod core;
pub mod logging;
pub mod utils;

pub use crate::config::SessionConfig;
pub use crate::core::bluetooth::{
    BleError, BluetoothSession, CharacteristicRef, ConnectionState, Device, DeviceId, ErrorKind, EventSink,
    GattLayout, Notification, ScanState, Subscription, Transport, TransportEvent, WriteMode,
};
