//! Error types shared across the crate.

use thiserror::Error;
use uuid::Uuid;

/// Failures the core can name precisely. Operation boundaries still return
/// `anyhow::Result`; these are wrapped into it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("No Bluetooth adapter found")]
    AdapterNotFound,

    #[error("Bluetooth is unavailable or not authorized")]
    PermissionDenied,

    #[error("No device selected")]
    NoDeviceSelected,

    #[error("Device not found with ID: {0}")]
    DeviceNotFound(String),

    #[error("No device connected")]
    NotConnected,

    #[error("Connection attempt was cancelled")]
    ConnectCancelled,

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Please enter text to send.")]
    EmptyWriteValue,

    #[error("Write interval must be greater than zero")]
    InvalidInterval,

    #[error("Presentation thread is no longer running")]
    DispatcherClosed,

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),
}
