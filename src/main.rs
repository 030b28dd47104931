use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use log::{info, warn};
use tokio::time::MissedTickBehavior;

use swift_ble_telemetry_lib::commands;
use swift_ble_telemetry_lib::config::AppConfig;
use swift_ble_telemetry_lib::core::bluetooth::DEVICE_NAME;
use swift_ble_telemetry_lib::core::device::DiscoveredDevice;
use swift_ble_telemetry_lib::core::format::{hex_preview, text_preview};
use swift_ble_telemetry_lib::core::{ConnectionState, Notifier, ValueSource};
use swift_ble_telemetry_lib::logging;
use swift_ble_telemetry_lib::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(log::Level::Info);

    let config_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let config = AppConfig::load_config(&config_dir).await?;

    let app = AppState::new(config, Notifier::new()).await?;
    if !app.bluetooth_available {
        return Err(anyhow!("Bluetooth is not available"));
    }

    let result = run(&app).await;
    commands::stop_write_load(&app).await;
    commands::disconnect(&app).await;
    app.shutdown().await?;
    result
}

async fn run(app: &AppState) -> Result<()> {
    let target_name = app
        .config
        .bluetooth
        .name_filter
        .clone()
        .unwrap_or_else(|| DEVICE_NAME.to_string());

    commands::start_scan(app).await;
    let device = wait_for_device(app, &target_name).await?;
    info!("Using {} ({})", device.name, device.id);

    commands::select_device(app, &device.id).await;
    commands::connect(app).await;

    let mut connection = app.bridge.view().connection_state.subscribe();
    let state = connection
        .wait_for(|state| *state != ConnectionState::Connecting)
        .await
        .map(|state| *state)
        .map_err(|_| anyhow!("Connection state is no longer observable"))?;
    if state != ConnectionState::Connected {
        return Err(anyhow!("Could not connect to {}", device.name));
    }

    app.initialize_characteristics().await?;
    if app.config.write_load.autostart {
        commands::start_write_load(app, None).await;
    }

    report_rates(app).await
}

/// Waits until a device whose name contains `target_name` shows up, or the scan ends.
async fn wait_for_device(app: &AppState, target_name: &str) -> Result<DiscoveredDevice> {
    let view = app.bridge.view();
    let mut changes = view.devices.subscribe();
    let deadline = tokio::time::sleep(app.config.bluetooth.scan_duration() + Duration::from_secs(1));
    tokio::pin!(deadline);

    loop {
        if let Some(device) = view.devices.find(|device| device.name.contains(target_name)) {
            return Ok(device);
        }
        tokio::select! {
            _ = changes.recv() => {}
            _ = &mut deadline => return Err(anyhow!("No device named {} found", target_name)),
        }
    }
}

/// Logs every characteristic's rates once per tick until Ctrl-C.
async fn report_rates(app: &AppState) -> Result<()> {
    let mut ticker = tokio::time::interval(app.config.telemetry.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down.");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let units = app.store.characteristics().snapshot();
        if units.is_empty() {
            warn!("No characteristics available.");
        }
        for unit in units {
            let value = unit.value.get();
            let rate = |source| {
                let metrics = unit.metrics(source);
                format!("{}/{}", metrics.bps.get(), metrics.max_bps.get())
            };
            info!(
                "{} read {} write {} notify {} bits [{}] \"{}\"",
                unit.key(),
                rate(ValueSource::Read),
                rate(ValueSource::Write),
                rate(ValueSource::Notify),
                hex_preview(&value),
                text_preview(&value)
            );
        }
    }
}
