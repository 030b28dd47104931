//! Defines shared data structures for the Bluetooth module.

use bluest::Device;

use crate::core::device::{DiscoveredDevice, ServiceSnapshot};

/// A device picked by the user, with the handle needed to connect to it.
#[derive(Clone)]
pub struct SelectedDevice {
    pub info: DiscoveredDevice,
    pub device: Device,
}

/// Represents the state of a successfully connected device.
/// Holds the services discovered on this connection; a reconnect builds a new one.
#[derive(Clone)]
pub struct ConnectedDeviceState {
    /// The device handle, used for checking connection status or disconnecting.
    pub device: Device,
    /// Characteristic handles grouped by service.
    pub services: Vec<ServiceSnapshot>,
}
