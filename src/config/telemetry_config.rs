use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Telemetry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Period of the rate tick. Rates are reported in bits per tick.
    pub tick_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            tick_interval_ms: 1000,
        }
    }
}

impl TelemetryConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}
