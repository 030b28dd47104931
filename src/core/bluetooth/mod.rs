//! Bluetooth functionality on the bluest crate
//! This module handles scanning, connecting, and exposing the connected
//! device's characteristics through the `DeviceAccess` traits.

mod characteristic;
mod connection;
mod constants;
mod manager;
mod scanner;
mod types;

// Re-export types that should be publicly accessible
pub use characteristic::BluestCharacteristic;
pub use connection::ConnectionManager;
pub use constants::*; // Re-export all constants
pub use manager::BluetoothManager;
pub use scanner::BluetoothScanner;
pub use types::{ConnectedDeviceState, SelectedDevice};
