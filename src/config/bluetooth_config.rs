use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::{
    BLUETOOTH_OPERATION_TIMEOUT_SECS, CONNECT_RETRY_DELAY_MS, DEFAULT_SCAN_DURATION_SECS,
    LINK_POLL_INTERVAL_MS, MAX_CONNECT_RETRIES, MIN_RSSI_THRESHOLD,
};

/// Scanner and connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// A scan stops on its own after this many seconds
    pub scan_duration_secs: u64,
    /// Advertisements weaker than this are ignored
    pub min_rssi: i16,
    /// Only devices whose name contains this string are reported
    pub name_filter: Option<String>,
    pub max_connect_retries: u32,
    pub connect_retry_delay_ms: u64,
    /// Limit for a single connect attempt or service discovery
    pub operation_timeout_secs: u64,
    /// How often a live connection is checked for link loss
    pub link_poll_interval_ms: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        BluetoothConfig {
            scan_duration_secs: DEFAULT_SCAN_DURATION_SECS,
            min_rssi: MIN_RSSI_THRESHOLD,
            name_filter: None,
            max_connect_retries: MAX_CONNECT_RETRIES,
            connect_retry_delay_ms: CONNECT_RETRY_DELAY_MS,
            operation_timeout_secs: BLUETOOTH_OPERATION_TIMEOUT_SECS,
            link_poll_interval_ms: LINK_POLL_INTERVAL_MS,
        }
    }
}

impl BluetoothConfig {
    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn link_poll_interval(&self) -> Duration {
        Duration::from_millis(self.link_poll_interval_ms.max(1))
    }

    /// True if `name` passes the configured name filter.
    pub fn accepts_name(&self, name: &str) -> bool {
        match &self.name_filter {
            Some(filter) => name.contains(filter.as_str()),
            None => true,
        }
    }
}
