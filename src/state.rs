//! Application state management
//! This module wires the device-access layer to the characteristic store,
//! the event bridge and the write-load driver.

use std::sync::{Arc, Weak};

use anyhow::Result;
use log::{debug, info};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::device::{DeviceAccess, DeviceEvent};
use crate::core::reconciler::ReconcileOutcome;
use crate::core::{
    BluetoothManager, CharacteristicStore, Dispatcher, EventBridge, Notifier, UnitContext,
    WriteLoadDriver,
};
use crate::error::BleError;

/// Global application state
pub struct AppState {
    pub config: AppConfig,
    pub dispatcher: Dispatcher,
    pub notifier: Notifier,
    pub access: Arc<dyn DeviceAccess>,
    pub bridge: EventBridge,
    pub store: Arc<CharacteristicStore>,
    pub write_load: Arc<WriteLoadDriver>,
    /// Result of the one-time availability check made at startup.
    pub bluetooth_available: bool,
    shutdown: CancellationToken,
}

impl AppState {
    /// Creates the state on top of the system Bluetooth adapter.
    pub async fn new(config: AppConfig, notifier: Notifier) -> Result<Self> {
        info!("Initializing BluetoothManager...");
        let manager = BluetoothManager::new(config.bluetooth.clone()).await?;
        Self::with_device_access(config, Arc::new(manager), notifier).await
    }

    pub async fn with_device_access(
        config: AppConfig,
        access: Arc<dyn DeviceAccess>,
        notifier: Notifier,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::spawn()?;
        let context = UnitContext {
            dispatcher: dispatcher.clone(),
            runtime: Handle::current(),
            tick_interval: config.telemetry.tick_interval(),
        };

        let bridge = EventBridge::new(access.clone(), dispatcher.clone());
        bridge.start();

        let store = CharacteristicStore::new(access.clone(), context, notifier.clone());
        store.watch_topology();

        let write_load = Arc::new(WriteLoadDriver::new(
            config.write_load.target_characteristic,
            config.write_load.payload_len,
            config.write_load.interval(),
            dispatcher.clone(),
            notifier.clone(),
        ));

        let bluetooth_available = match access.check_permission().await {
            Ok(true) => true,
            Ok(false) => {
                notifier.notify("Bluetooth", BleError::PermissionDenied.to_string());
                false
            }
            Err(e) => {
                notifier.notify_error("Bluetooth", &e);
                false
            }
        };

        let state = Self {
            config,
            dispatcher,
            notifier,
            access,
            bridge,
            store,
            write_load,
            bluetooth_available,
            shutdown: CancellationToken::new(),
        };
        state.watch_write_load_target();
        info!("Application state initialized.");
        Ok(state)
    }

    /// Reconciles the collection and resolves the write-load target.
    pub async fn initialize_characteristics(&self) -> Result<ReconcileOutcome> {
        let outcome = self.store.update_characteristics().await?;
        self.write_load.initialize(self.access.as_ref()).await?;
        Ok(outcome)
    }

    /// Re-resolves the write-load target whenever the topology changes; a vanished target stops the driver.
    fn watch_write_load_target(&self) {
        let mut events = self.access.events();
        let access = self.access.clone();
        let driver: Weak<WriteLoadDriver> = Arc::downgrade(&self.write_load);
        let notifier = self.notifier.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(DeviceEvent::ServicesChanged) | Err(RecvError::Lagged(_)) => {
                        let Some(driver) = driver.upgrade() else { break };
                        match driver.initialize(access.as_ref()).await {
                            Ok(true) => {}
                            Ok(false) => driver.stop().await,
                            Err(e) => notifier.notify_error("WriteLoad", &e),
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Write load target watcher stopped");
        });
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down application state.");
        self.shutdown.cancel();
        self.write_load.stop().await;
        self.bridge.stop();
        self.store.shutdown().await
    }
}
