//! Core functionality of the session library

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{BleError, BluetoothSession, ConnectionState, ScanState};
