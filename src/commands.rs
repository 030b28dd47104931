//! Commands
//! This module defines every command the presentation layer may issue.
//! Commands never fail: each one reports its own error as a user notification.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::core::device::CharacteristicKey;
use crate::core::telemetry::TelemetryUnit;
use crate::error::BleError;
use crate::state::AppState;

fn report(app_state: &AppState, title: &str, result: Result<()>) {
    if let Err(e) = result {
        app_state.notifier.notify_error(title, &e);
    }
}

fn unit(app_state: &AppState, key: CharacteristicKey) -> Result<Arc<TelemetryUnit>> {
    app_state
        .store
        .find(key)
        .ok_or_else(|| BleError::CharacteristicNotFound(key.characteristic_id).into())
}

/// Replaces the text that the next `write` sends.
pub async fn set_write_value(app_state: &AppState, key: CharacteristicKey, text: String) {
    let result = async { unit(app_state, key)?.set_write_value(text).await }.await;
    report(app_state, "Write", result);
}

/// Sends the characteristic's `write_value` buffer.
pub async fn write(app_state: &AppState, key: CharacteristicKey) {
    let result = async { unit(app_state, key)?.write().await }.await;
    report(app_state, "Write", result);
}

pub async fn read(app_state: &AppState, key: CharacteristicKey) {
    let result = async { unit(app_state, key)?.read().await.map(|_| ()) }.await;
    report(app_state, "Read", result);
}

pub async fn toggle_notify(app_state: &AppState, key: CharacteristicKey) {
    let result = async { unit(app_state, key)?.toggle_notify().await.map(|_| ()) }.await;
    report(app_state, "Notify", result);
}

pub async fn reset_all_maxima(app_state: &AppState) {
    let result = app_state.store.reset_all_maxima().await;
    report(app_state, "ResetMaxima: Error", result);
}

/// Starts the write load, using the configured interval when none is given.
pub async fn start_write_load(app_state: &AppState, interval_ms: Option<u64>) {
    let interval_ms = interval_ms.unwrap_or_else(|| app_state.write_load.view().interval_ms.get());
    let result = app_state.write_load.start(Duration::from_millis(interval_ms)).await;
    report(app_state, "StartWriting: Error", result);
}

/// Returns once the last write of the session has completed.
pub async fn stop_write_load(app_state: &AppState) {
    app_state.write_load.stop().await;
}

/// Scans for Bluetooth devices. Discoveries appear in the bridge's device list.
pub async fn start_scan(app_state: &AppState) {
    let result = app_state.bridge.start_scan().await;
    report(app_state, "StartScan: Error", result);
}

pub async fn stop_scan(app_state: &AppState) {
    let result = app_state.bridge.stop_scan().await;
    report(app_state, "StopScan: Error", result);
}

/// Selects a discovered device by its platform-specific id.
pub async fn select_device(app_state: &AppState, device_id: &str) {
    let result = app_state.bridge.select_device(device_id).await;
    report(app_state, "SelectDevice: Error", result);
}

pub async fn connect(app_state: &AppState) {
    let result = app_state.bridge.connect().await;
    report(app_state, "Connect: Error", result);
}

pub async fn disconnect(app_state: &AppState) {
    let result = app_state.bridge.disconnect().await;
    report(app_state, "Disconnect: Error", result);
}

pub async fn cancel_connecting(app_state: &AppState) {
    let result = app_state.bridge.cancel_connecting().await;
    report(app_state, "CancelConnecting: Error", result);
}

pub async fn reset_device(app_state: &AppState) {
    let result = app_state.bridge.reset_device().await;
    report(app_state, "ResetDevice: Error", result);
}
