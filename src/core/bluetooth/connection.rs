//! Bluetooth connection handling
//! This module handles connecting to and disconnecting from a peripheral
//! and turning its GATT database into characteristic handles.

use std::time::Duration;

use anyhow::{Result, anyhow};
use bluest::{Adapter, Device};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::bluetooth_config::BluetoothConfig;
use crate::core::bluetooth::characteristic::BluestCharacteristic;
use crate::core::device::ServiceSnapshot;
use crate::error::BleError;

/// Connection manager for the peripheral
#[derive(Clone)]
pub struct ConnectionManager {
    adapter: Adapter,
    max_retries: u32,
    retry_delay: Duration,
    operation_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(adapter: Adapter, config: &BluetoothConfig) -> Self {
        Self {
            adapter,
            max_retries: config.max_connect_retries.max(1),
            retry_delay: Duration::from_millis(config.connect_retry_delay_ms),
            operation_timeout: config.operation_timeout(),
        }
    }

    /// Connects and discovers services, retrying failed attempts until `cancel_token` fires.
    pub async fn connect_with_retry(
        &self,
        device: &Device,
        cancel_token: &CancellationToken,
    ) -> Result<Vec<ServiceSnapshot>> {
        let mut last_error = None;

        for attempt in 0..self.max_retries {
            let result = tokio::select! {
                _ = cancel_token.cancelled() => return Err(BleError::ConnectCancelled.into()),
                result = self.try_connect(device) => result,
            };

            match result {
                Ok(services) => {
                    info!("Successfully connected to device");
                    return Ok(services);
                }
                Err(e) => {
                    warn!("Connection attempt {} failed: {:#}", attempt + 1, e);
                    last_error = Some(e);

                    if attempt + 1 < self.max_retries {
                        info!("Retrying connection in {:?}...", self.retry_delay);
                        tokio::select! {
                            _ = cancel_token.cancelled() => return Err(BleError::ConnectCancelled.into()),
                            _ = tokio::time::sleep(self.retry_delay) => {}
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("Failed to connect after {} attempts", self.max_retries)))
    }

    /// One connect attempt plus service discovery, bounded by the operation timeout.
    async fn try_connect(&self, device: &Device) -> Result<Vec<ServiceSnapshot>> {
        let secs = self.operation_timeout.as_secs();
        tokio::time::timeout(self.operation_timeout, async {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            info!("Device details - ID: {}, Name: {:?}", device.id(), name);

            if !device.is_connected().await {
                info!("Initiating connection to {}...", device.id());
                self.adapter.connect_device(device).await?;
            }

            info!("Connection successful, discovering services...");
            self.discover_snapshot(device).await
        })
        .await
        .map_err(|_| BleError::Timeout(secs))?
    }

    /// Builds new characteristic handles for every service of `device`.
    pub async fn discover_snapshot(&self, device: &Device) -> Result<Vec<ServiceSnapshot>> {
        let mut snapshot = Vec::new();
        for service in device.discover_services().await? {
            let service_id = service.uuid();
            let mut characteristics = Vec::new();
            for characteristic in service.discover_characteristics().await? {
                characteristics.push(BluestCharacteristic::discover(service_id, characteristic).await);
            }
            info!(
                "Found service {} with {} characteristics",
                service_id,
                characteristics.len()
            );
            snapshot.push(ServiceSnapshot {
                id: service_id,
                characteristics,
            });
        }
        Ok(snapshot)
    }

    /// Disconnect from the device
    pub async fn disconnect(&self, device: &Device) -> Result<()> {
        if device.is_connected().await {
            info!("Disconnecting from device {}", device.id());
            self.adapter.disconnect_device(device).await?;
            info!("Successfully disconnected");
        } else {
            info!("Device {} not connected", device.id());
        }
        Ok(())
    }
}
