//! Bluetooth manager
//! This module provides the bluest-backed `DeviceAccess` implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use bluest::Adapter;
use log::{error, info, warn};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::bluetooth_config::BluetoothConfig;
use crate::core::bluetooth::connection::ConnectionManager;
use crate::core::bluetooth::constants::EVENT_CHANNEL_CAPACITY;
use crate::core::bluetooth::scanner::{BluetoothScanner, DeviceRegistry};
use crate::core::bluetooth::types::{ConnectedDeviceState, SelectedDevice};
use crate::core::device::{
    ConnectionState, DeviceAccess, DeviceEvent, DiscoveredDevice, ServiceSnapshot,
};
use crate::error::BleError;

/// Connection state shared with the link monitor.
struct Link {
    state: Mutex<ConnectionState>,
    connected: tokio::sync::Mutex<Option<ConnectedDeviceState>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl Link {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut current = lock(&self.state);
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            let _ = self.events.send(DeviceEvent::ConnectionStateChanged(state));
        }
    }

    fn services_changed(&self) {
        let _ = self.events.send(DeviceEvent::ServicesChanged);
    }
}

/// Manages Bluetooth operations
pub struct BluetoothManager {
    adapter: Adapter,
    config: BluetoothConfig,
    devices: DeviceRegistry,
    scanner: BluetoothScanner,
    connection_manager: ConnectionManager,
    link: Arc<Link>,
    selected: Mutex<Option<SelectedDevice>>,
    connect_token: Mutex<Option<CancellationToken>>,
    link_monitor: Mutex<Option<CancellationToken>>,
}

impl BluetoothManager {
    /// Creates a new BluetoothManager on the system's default adapter.
    pub async fn new(config: BluetoothConfig) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(BleError::AdapterNotFound)?;

        match tokio::time::timeout(config.operation_timeout(), adapter.wait_available()).await {
            Ok(Ok(())) => info!("Bluetooth adapter is available."),
            Ok(Err(e)) => warn!("Bluetooth adapter is not available: {}", e),
            Err(_) => warn!("Timed out waiting for the Bluetooth adapter."),
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let devices: DeviceRegistry = Arc::new(Mutex::new(HashMap::new()));
        let scanner =
            BluetoothScanner::new(adapter.clone(), config.clone(), devices.clone(), events.clone());
        let connection_manager = ConnectionManager::new(adapter.clone(), &config);

        Ok(Self {
            adapter,
            config,
            devices,
            scanner,
            connection_manager,
            link: Arc::new(Link {
                state: Mutex::new(ConnectionState::Disconnected),
                connected: tokio::sync::Mutex::new(None),
                events,
            }),
            selected: Mutex::new(None),
            connect_token: Mutex::new(None),
            link_monitor: Mutex::new(None),
        })
    }

    /// Polls the connected device and tears the connection down once the link drops.
    fn start_link_monitor(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.link_monitor).replace(token.clone()) {
            previous.cancel();
        }

        let link = self.link.clone();
        let poll_interval = self.config.link_poll_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let device = match link.connected.lock().await.as_ref() {
                    Some(connected) => connected.device.clone(),
                    None => return,
                };
                if device.is_connected().await {
                    continue;
                }

                warn!("Lost connection to device {}", device.id());
                if link.connected.lock().await.take().is_some() {
                    link.set_state(ConnectionState::Disconnected);
                    link.services_changed();
                }
                return;
            }
        });
    }

    fn stop_link_monitor(&self) {
        if let Some(token) = lock(&self.link_monitor).take() {
            token.cancel();
        }
    }
}

#[async_trait::async_trait]
impl DeviceAccess for BluetoothManager {
    fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.link.events.subscribe()
    }

    fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    fn connection_state(&self) -> ConnectionState {
        self.link.state()
    }

    fn selected_device(&self) -> Option<DiscoveredDevice> {
        lock(&self.selected).as_ref().map(|selected| selected.info.clone())
    }

    async fn check_permission(&self) -> Result<bool> {
        Ok(self.adapter.is_available().await?)
    }

    async fn services(&self) -> Result<Vec<ServiceSnapshot>> {
        Ok(self
            .link
            .connected
            .lock()
            .await
            .as_ref()
            .map(|connected| connected.services.clone())
            .unwrap_or_default())
    }

    async fn start_scan(&self) -> Result<()> {
        self.scanner.start_scan().await
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanner.stop_scan().await
    }

    async fn select_device(&self, device_id: &str) -> Result<()> {
        let (info, device) = lock(&self.devices)
            .get(device_id)
            .cloned()
            .ok_or_else(|| BleError::DeviceNotFound(device_id.to_string()))?;

        info!("Selected device {} ({})", info.name, info.id);
        *lock(&self.selected) = Some(SelectedDevice { info, device });
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        let device = lock(&self.selected)
            .as_ref()
            .map(|selected| selected.device.clone())
            .ok_or(BleError::NoDeviceSelected)?;

        if self.link.state() != ConnectionState::Disconnected {
            info!("Device already connected or connecting.");
            return Ok(());
        }

        let token = CancellationToken::new();
        *lock(&self.connect_token) = Some(token.clone());
        self.link.set_state(ConnectionState::Connecting);

        let result = self.connection_manager.connect_with_retry(&device, &token).await;
        lock(&self.connect_token).take();

        match result {
            Ok(services) => {
                *self.link.connected.lock().await = Some(ConnectedDeviceState {
                    device,
                    services,
                });
                self.link.set_state(ConnectionState::Connected);
                self.link.services_changed();
                self.start_link_monitor();
                info!("Device successfully connected and state stored.");
                Ok(())
            }
            Err(e) => {
                self.link.set_state(ConnectionState::Disconnected);
                if matches!(e.downcast_ref::<BleError>(), Some(BleError::ConnectCancelled)) {
                    info!("Connection attempt cancelled.");
                    if let Err(e) = self.connection_manager.disconnect(&device).await {
                        warn!("Failed to release cancelled connection: {:#}", e);
                    }
                    return Ok(());
                }
                error!("Failed to connect: {:#}", e);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_link_monitor();

        let connected = self
            .link
            .connected
            .lock()
            .await
            .take()
            .ok_or(BleError::NotConnected)?;
        info!("Connected state cleared, releasing device and characteristic handles.");

        self.link.set_state(ConnectionState::Disconnected);
        self.link.services_changed();
        self.connection_manager.disconnect(&connected.device).await
    }

    async fn cancel_connecting(&self) -> Result<()> {
        if let Some(token) = lock(&self.connect_token).take() {
            info!("Cancelling connection attempt.");
            token.cancel();
        }
        Ok(())
    }

    async fn reset_device(&self) -> Result<()> {
        self.cancel_connecting().await?;
        self.scanner.stop_scan().await?;
        if self.link.state() == ConnectionState::Connected {
            self.disconnect().await?;
        }
        *lock(&self.selected) = None;
        info!("Device selection reset.");
        Ok(())
    }
}

impl Drop for BluetoothManager {
    fn drop(&mut self) {
        self.stop_link_monitor();
        if let Some(token) = lock(&self.connect_token).take() {
            token.cancel();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
