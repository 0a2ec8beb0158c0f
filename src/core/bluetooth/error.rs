//! Error types surfaced by the session

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::core::bluetooth::device::DeviceId;

/// Coarse classification of a [`BleError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Timeout,
    GattError,
    PermissionDenied,
    DisconnectedByDevice,
    BluetoothDisabled,
    ScanFailed,
    PeripheralNotFound,
    NotConnected,
    ServiceNotFound,
    CharacteristicNotFound,
    ConnectionClosed,
    Busy,
}

/// Every failure the session reports, either to the caller of an operation or
/// as the payload of an `Error` state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("GATT error: {0}")]
    Gatt(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Peripheral disconnected: {0}")]
    DisconnectedByDevice(String),
    #[error("Bluetooth is powered off")]
    BluetoothDisabled,
    #[error("Scan failed: {0}")]
    ScanFailed(String),
    #[error("Peripheral not found: {0}")]
    PeripheralNotFound(DeviceId),
    #[error("Not connected")]
    NotConnected,
    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Busy: a {0} is already in progress")]
    Busy(&'static str),
}

impl BleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Gatt(_) => ErrorKind::GattError,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::DisconnectedByDevice(_) => ErrorKind::DisconnectedByDevice,
            Self::BluetoothDisabled => ErrorKind::BluetoothDisabled,
            Self::ScanFailed(_) => ErrorKind::ScanFailed,
            Self::PeripheralNotFound(_) => ErrorKind::PeripheralNotFound,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::ServiceNotFound(_) => ErrorKind::ServiceNotFound,
            Self::CharacteristicNotFound(_) => ErrorKind::CharacteristicNotFound,
            Self::ConnectionClosed => ErrorKind::ConnectionClosed,
            Self::Busy(_) => ErrorKind::Busy,
        }
    }

    /// Whether retrying the same call later can succeed without any other action.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Busy | ErrorKind::Timeout)
    }
}
