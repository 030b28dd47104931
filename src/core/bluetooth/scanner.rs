use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use bluest::{Adapter, AdvertisingDevice, Device};
use futures_util::StreamExt;
use log::{debug, error, info};
use regex::Regex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::bluetooth_config::BluetoothConfig;
use crate::core::device::{DeviceEvent, DiscoveredDevice};

pub type DeviceRegistry = Arc<Mutex<HashMap<String, (DiscoveredDevice, Device)>>>;

struct ScanTask {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BluetoothScanner {
    adapter: Adapter,
    config: BluetoothConfig,
    devices: DeviceRegistry,
    events: broadcast::Sender<DeviceEvent>,
    scanning: Arc<AtomicBool>,
    task: tokio::sync::Mutex<Option<ScanTask>>,
}

impl BluetoothScanner {
    pub fn new(
        adapter: Adapter,
        config: BluetoothConfig,
        devices: DeviceRegistry,
        events: broadcast::Sender<DeviceEvent>,
    ) -> Self {
        Self {
            adapter,
            config,
            devices,
            events,
            scanning: Arc::new(AtomicBool::new(false)),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub async fn start_scan(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            Self::finish(previous).await;
        }

        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(Self::internal_scan_task(
            self.adapter.clone(),
            self.config.clone(),
            self.devices.clone(),
            self.events.clone(),
            self.scanning.clone(),
            cancel_token.clone(),
        ));
        *task = Some(ScanTask {
            cancel_token,
            handle,
        });

        info!("Device scan task started.");
        Ok(())
    }

    pub async fn stop_scan(&self) -> Result<()> {
        info!("Stopping Bluetooth scan.");
        match self.task.lock().await.take() {
            Some(task) => Self::finish(task).await,
            None => debug!("No active scan task to stop."),
        }
        Ok(())
    }

    async fn finish(task: ScanTask) {
        task.cancel_token.cancel();
        match task.handle.await {
            Ok(()) => info!("Scan task finished after cancellation."),
            Err(e) if e.is_cancelled() => info!("Scan task was cancelled."),
            Err(e) => error!("Scan task finished with an unexpected join error: {:?}", e),
        }
    }

    /// Scans until cancelled, until the configured duration elapses, or until the stream ends.
    async fn internal_scan_task(
        adapter: Adapter,
        config: BluetoothConfig,
        devices: DeviceRegistry,
        events: broadcast::Sender<DeviceEvent>,
        scanning: Arc<AtomicBool>,
        cancel_token: CancellationToken,
    ) {
        scanning.store(true, Ordering::SeqCst);
        let _ = events.send(DeviceEvent::ScanStateChanged(true));

        if let Err(e) =
            Self::scan_until_done(&adapter, &config, &devices, &events, &cancel_token).await
        {
            error!("Bluetooth scan failed: {:#}", e);
        }

        scanning.store(false, Ordering::SeqCst);
        let _ = events.send(DeviceEvent::ScanStateChanged(false));
    }

    async fn scan_until_done(
        adapter: &Adapter,
        config: &BluetoothConfig,
        devices: &DeviceRegistry,
        events: &broadcast::Sender<DeviceEvent>,
        cancel_token: &CancellationToken,
    ) -> Result<()> {
        info!("Checking for connected devices");
        for device in adapter.connected_devices().await? {
            let rssi = device.rssi().await.unwrap_or(0);
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            if config.accepts_name(&name) {
                Self::report(devices, events, device, name, rssi);
            }
        }

        info!("Starting bluetooth scan");
        let mut scan_stream = adapter.scan(&[]).await?;
        let deadline = tokio::time::sleep(config.scan_duration());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = scan_stream.next() => match result {
                    Some(discovered) => Self::on_advertisement(config, devices, events, discovered),
                    None => {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    }
                },
                _ = &mut deadline => {
                    info!("Scan duration elapsed.");
                    break;
                }
                _ = cancel_token.cancelled() => break,
            }
        }
        Ok(())
    }

    fn on_advertisement(
        config: &BluetoothConfig,
        devices: &DeviceRegistry,
        events: &broadcast::Sender<DeviceEvent>,
        discovered: AdvertisingDevice,
    ) {
        let device = discovered.device;
        let name = device
            .name()
            .ok()
            .or(discovered.adv_data.local_name)
            .unwrap_or_else(|| "Unknown".to_string());
        debug!("Found device - Device: {:?}, RSSI: {:?}", device, discovered.rssi);

        match discovered.rssi {
            Some(rssi) if passes_filters(config, rssi, &name) => {
                Self::report(devices, events, device, name, rssi)
            }
            _ => {}
        }
    }

    /// Records a device and announces it, once per device id per scan.
    fn report(
        devices: &DeviceRegistry,
        events: &broadcast::Sender<DeviceEvent>,
        device: Device,
        name: String,
        rssi: i16,
    ) {
        let id = device.id().to_string();
        let address = extract_mac_address(&id).unwrap_or_else(|| "N/A".to_string());
        let info = DiscoveredDevice::new(id.clone(), name, address, rssi);

        {
            let mut devices = devices.lock().unwrap_or_else(PoisonError::into_inner);
            if devices.contains_key(&id) {
                return;
            }
            devices.insert(id, (info.clone(), device));
        }

        info!(
            "Found device: Address: {}, ID: {}, Name: {:?}, RSSI: {}",
            info.address, info.id, info.name, info.rssi
        );
        let _ = events.send(DeviceEvent::DeviceDiscovered(info));
    }
}

fn passes_filters(config: &BluetoothConfig, rssi: i16, name: &str) -> bool {
    rssi >= config.min_rssi && config.accepts_name(name)
}

fn extract_mac_address(device_id_str: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok()?;
    re.find_iter(device_id_str)
        .last()
        .map(|m| m.as_str().to_uppercase())
}
