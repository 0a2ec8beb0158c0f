//! Constants used throughout the session
//! This module contains the default timeouts and delays, and a few standard
//! UUIDs that are handy for configuring a session.

use uuid::Uuid;

/// Standard Bluetooth Service UUIDs
pub const UUID_BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// How long a scan runs before it stops by itself, in milliseconds
pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 10_000;

/// Timeout for establishing a link, for service discovery and for a requested disconnect, in milliseconds
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 10_000;

/// Pause between link establishment and service discovery, in milliseconds
pub const DEFAULT_PRE_DISCOVERY_DELAY_MS: u64 = 0;

/// Deadline for a single read or write-with-response, in milliseconds
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5_000;

/// Delay before an automatic reconnect attempt, in milliseconds
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
