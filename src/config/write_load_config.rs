use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::{DEFAULT_WRITE_PAYLOAD_LEN, UUID_SWIFT_WRITE_CHAR};

/// Synthetic write-load settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteLoadConfig {
    /// Delay between two consecutive writes
    pub interval_ms: u64,
    /// Size of each payload. The first two bytes carry the sequence number.
    pub payload_len: usize,
    /// Characteristic the driver writes to
    pub target_characteristic: Uuid,
    /// Start the driver as soon as the target is available (headless binary only)
    pub autostart: bool,
}

impl Default for WriteLoadConfig {
    fn default() -> Self {
        WriteLoadConfig {
            interval_ms: 30,
            payload_len: DEFAULT_WRITE_PAYLOAD_LEN,
            target_characteristic: UUID_SWIFT_WRITE_CHAR,
            autostart: false,
        }
    }
}

impl WriteLoadConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}
