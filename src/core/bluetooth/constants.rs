//! Constants used throughout the application
//! This module contains all the constant values used in the application,
//! such as UUIDs, timeouts, and other configuration defaults.

use uuid::Uuid;

/// The advertised name of the Swift peripheral
pub const DEVICE_NAME: &str = "SwiftDevice";

/// The UUID of the Swift data service
pub const UUID_SWIFT_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_93f3_e0a9_e50e24dcca9e);

/// The UUID of the notification characteristic
pub const UUID_SWIFT_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x6e400002_b5a3_93f3_e0a9_e50e24dcca9e);

/// The UUID of the write characteristic, the default write-load target
pub const UUID_SWIFT_WRITE_CHAR: Uuid = Uuid::from_u128(0x6e400003_b5a3_93f3_e0a9_e50e24dcca9e);

/// Write-load payload size in bytes
pub const DEFAULT_WRITE_PAYLOAD_LEN: usize = 10;

/// Maximum number of connection retries
pub const MAX_CONNECT_RETRIES: u32 = 5;

/// Delay between connection retries in milliseconds
pub const CONNECT_RETRY_DELAY_MS: u64 = 1000;

/// Timeout for Bluetooth operations in seconds
pub const BLUETOOTH_OPERATION_TIMEOUT_SECS: u64 = 10;

/// Scan duration in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 10;

/// Advertisements below this signal strength are ignored
pub const MIN_RSSI_THRESHOLD: i16 = -90;

/// Link-loss polling period in milliseconds
pub const LINK_POLL_INTERVAL_MS: u64 = 1000;

/// Capacity of the device event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of a characteristic's value-change channel
pub const VALUE_CHANNEL_CAPACITY: usize = 1024;
