//! Core functionality for the Swift BLE telemetry engine
//! Keeps the characteristic collection in sync with the connected device
//! and measures per-channel transfer rates.

pub mod bluetooth;
pub mod device;
pub mod dispatcher;
pub mod event_bridge;
pub mod format;
pub mod notifier;
pub mod observable;
pub mod reconciler;
pub mod telemetry;
pub mod write_load;

#[cfg(test)]
pub(crate) mod fake;

// Re-export commonly used types
pub use bluetooth::BluetoothManager;
pub use device::{CharacteristicKey, ConnectionState, DeviceAccess, ValueSource};
pub use dispatcher::Dispatcher;
pub use event_bridge::EventBridge;
pub use notifier::{Notifier, UserNotification};
pub use reconciler::CharacteristicStore;
pub use telemetry::{TelemetryUnit, UnitContext};
pub use write_load::WriteLoadDriver;
