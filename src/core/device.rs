//! The device-access layer as seen by the core.
//! The radio side (scanning, GATT, read/write/notify mechanics) lives behind
//! these traits; `core::bluetooth` provides the bluest-backed implementation.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// The channel a value change arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ValueSource {
    Read,
    Write,
    Notify,
}

impl ValueSource {
    pub const ALL: [ValueSource; 3] = [ValueSource::Read, ValueSource::Write, ValueSource::Notify];

    pub(crate) fn index(self) -> usize {
        match self {
            ValueSource::Read => 0,
            ValueSource::Write => 1,
            ValueSource::Notify => 2,
        }
    }
}

/// One value-changed event delivered by a characteristic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueChange {
    pub source: ValueSource,
    pub value: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl ValueChange {
    pub fn new(source: ValueSource, value: Vec<u8>) -> Self {
        Self {
            source,
            value,
            received_at: Local::now(),
        }
    }
}

/// Logical identity of a characteristic: the same characteristic UUID may
/// appear under several services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CharacteristicKey {
    pub service_id: Uuid,
    pub characteristic_id: Uuid,
}

impl CharacteristicKey {
    pub fn new(service_id: Uuid, characteristic_id: Uuid) -> Self {
        Self {
            service_id,
            characteristic_id,
        }
    }

    pub fn of(handle: &dyn CharacteristicHandle) -> Self {
        Self::new(handle.service_id(), handle.id())
    }
}

impl fmt::Display for CharacteristicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_id, self.characteristic_id)
    }
}

/// A live access handle to one characteristic. Valid until the device
/// disconnects or its services change; a reconnect yields new handle objects.
#[async_trait::async_trait]
pub trait CharacteristicHandle: Send + Sync {
    fn id(&self) -> Uuid;
    fn service_id(&self) -> Uuid;
    /// Last known value bytes.
    fn value(&self) -> Vec<u8>;
    fn can_notify(&self) -> bool;
    fn is_notifying(&self) -> bool;
    /// Value-changed events for every channel, including writes made through
    /// this handle.
    fn value_changes(&self) -> broadcast::Receiver<ValueChange>;

    async fn read(&self) -> Result<Vec<u8>>;
    async fn write(&self, data: &[u8]) -> Result<()>;
    async fn start_notifications(&self) -> Result<()>;
    async fn stop_notifications(&self) -> Result<()>;
}

pub type SharedCharacteristic = Arc<dyn CharacteristicHandle>;

/// An immutable copy of one service and its characteristic handles.
#[derive(Clone)]
pub struct ServiceSnapshot {
    pub id: Uuid,
    pub characteristics: Vec<SharedCharacteristic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    /// Platform-specific unique identifier for the device
    pub id: String,
    /// The name of the device, if available
    pub name: String,
    /// The address of the device (MAC address on most platforms, "N/A" when the platform hides it)
    pub address: String,
    /// The signal strength (RSSI) of the device
    pub rssi: i16,
}

impl DiscoveredDevice {
    pub fn new(id: String, name: String, address: String, rssi: i16) -> Self {
        Self {
            id,
            name,
            address,
            rssi,
        }
    }
}

/// Events emitted by the device-access layer, possibly from background threads.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Fired on connect, disconnect, or service re-discovery.
    ServicesChanged,
    ConnectionStateChanged(ConnectionState),
    ScanStateChanged(bool),
    DeviceDiscovered(DiscoveredDevice),
}

#[async_trait::async_trait]
pub trait DeviceAccess: Send + Sync {
    fn events(&self) -> broadcast::Receiver<DeviceEvent>;
    fn is_scanning(&self) -> bool;
    fn connection_state(&self) -> ConnectionState;
    fn selected_device(&self) -> Option<DiscoveredDevice>;

    /// Whether Bluetooth is enabled and the app may use it.
    async fn check_permission(&self) -> Result<bool>;
    /// Current services of the selected device; empty when not connected.
    async fn services(&self) -> Result<Vec<ServiceSnapshot>>;
    async fn start_scan(&self) -> Result<()>;
    async fn stop_scan(&self) -> Result<()>;
    async fn select_device(&self, device_id: &str) -> Result<()>;
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn cancel_connecting(&self) -> Result<()>;
    async fn reset_device(&self) -> Result<()>;
}
