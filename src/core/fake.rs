//! Scriptable device-access layer for tests.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::device::{
    CharacteristicHandle, ConnectionState, DeviceAccess, DeviceEvent, DiscoveredDevice,
    ServiceSnapshot, SharedCharacteristic, ValueChange, ValueSource,
};
use crate::core::dispatcher::Dispatcher;
use crate::core::telemetry::UnitContext;

/// A unit context whose automatic tick never fires during a test.
pub fn test_context() -> UnitContext {
    UnitContext {
        dispatcher: Dispatcher::spawn().unwrap(),
        runtime: Handle::current(),
        tick_interval: Duration::from_secs(3600),
    }
}

/// Polls `condition` for up to two seconds.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Awaits `future` with a two second limit.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("timed out")
}

pub struct FakeCharacteristic {
    service_id: Uuid,
    id: Uuid,
    value: Mutex<Vec<u8>>,
    notifying: AtomicBool,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    fail_notifications: AtomicBool,
    written: Mutex<Vec<Vec<u8>>>,
    changes: broadcast::Sender<ValueChange>,
}

impl FakeCharacteristic {
    pub fn new(service_id: Uuid, id: Uuid) -> Arc<Self> {
        let (changes, _) = broadcast::channel(1024);
        Arc::new(Self {
            service_id,
            id,
            value: Mutex::new(Vec::new()),
            notifying: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_notifications: AtomicBool::new(false),
            written: Mutex::new(Vec::new()),
            changes,
        })
    }

    pub fn shared(service_id: Uuid, id: Uuid) -> SharedCharacteristic {
        Self::new(service_id, id)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_notifications(&self, fail: bool) {
        self.fail_notifications.store(fail, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    /// Delivers a value change as the device-access layer would.
    pub fn emit(&self, source: ValueSource, value: Vec<u8>) {
        *self.value.lock().unwrap() = value.clone();
        let _ = self.changes.send(ValueChange::new(source, value));
    }
}

#[async_trait::async_trait]
impl CharacteristicHandle for FakeCharacteristic {
    fn id(&self) -> Uuid {
        self.id
    }

    fn service_id(&self) -> Uuid {
        self.service_id
    }

    fn value(&self) -> Vec<u8> {
        self.value.lock().unwrap().clone()
    }

    fn can_notify(&self) -> bool {
        true
    }

    fn is_notifying(&self) -> bool {
        self.notifying.load(Ordering::SeqCst)
    }

    fn value_changes(&self) -> broadcast::Receiver<ValueChange> {
        self.changes.subscribe()
    }

    async fn read(&self) -> Result<Vec<u8>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("read rejected by peripheral"));
        }
        let value = self.value();
        self.emit(ValueSource::Read, value.clone());
        Ok(value)
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("link lost"));
        }
        self.written.lock().unwrap().push(data.to_vec());
        self.emit(ValueSource::Write, data.to_vec());
        Ok(())
    }

    async fn start_notifications(&self) -> Result<()> {
        if self.fail_notifications.load(Ordering::SeqCst) {
            return Err(anyhow!("notifications not permitted"));
        }
        self.notifying.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_notifications(&self) -> Result<()> {
        self.notifying.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeDeviceAccess {
    events: broadcast::Sender<DeviceEvent>,
    services: Mutex<Vec<ServiceSnapshot>>,
    state: Mutex<ConnectionState>,
    selected: Mutex<Option<DiscoveredDevice>>,
    scanning: AtomicBool,
    permitted: AtomicBool,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeDeviceAccess {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            events,
            services: Mutex::new(Vec::new()),
            state: Mutex::new(ConnectionState::Disconnected),
            selected: Mutex::new(None),
            scanning: AtomicBool::new(false),
            permitted: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_permitted(&self, permitted: bool) {
        self.permitted.store(permitted, Ordering::SeqCst);
    }

    /// Replaces the topology without announcing it.
    pub fn set_services(&self, services: Vec<ServiceSnapshot>) {
        *self.services.lock().unwrap() = services;
    }

    /// Replaces the topology and fires `ServicesChanged`.
    pub fn change_services(&self, services: Vec<ServiceSnapshot>) {
        self.set_services(services);
        self.fire(DeviceEvent::ServicesChanged);
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
        self.fire(DeviceEvent::ConnectionStateChanged(state));
    }

    /// Confirms a scan-state change, as the radio would after a request.
    pub fn confirm_scan_state(&self, scanning: bool) {
        self.scanning.store(scanning, Ordering::SeqCst);
        self.fire(DeviceEvent::ScanStateChanged(scanning));
    }

    pub fn discover(&self, id: &str) {
        self.fire(DeviceEvent::DeviceDiscovered(fake_device(id)));
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fire(&self, event: DeviceEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

pub fn fake_device(id: &str) -> DiscoveredDevice {
    DiscoveredDevice::new(id.to_string(), "SwiftDevice".to_string(), "N/A".to_string(), -40)
}

pub fn service(id: Uuid, characteristics: Vec<SharedCharacteristic>) -> ServiceSnapshot {
    ServiceSnapshot { id, characteristics }
}

#[async_trait::async_trait]
impl DeviceAccess for FakeDeviceAccess {
    fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn selected_device(&self) -> Option<DiscoveredDevice> {
        self.selected.lock().unwrap().clone()
    }

    async fn check_permission(&self) -> Result<bool> {
        Ok(self.permitted.load(Ordering::SeqCst))
    }

    async fn services(&self) -> Result<Vec<ServiceSnapshot>> {
        Ok(self.services.lock().unwrap().clone())
    }

    async fn start_scan(&self) -> Result<()> {
        self.record("start_scan");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record("stop_scan");
        Ok(())
    }

    async fn select_device(&self, device_id: &str) -> Result<()> {
        self.record("select_device");
        *self.selected.lock().unwrap() = Some(fake_device(device_id));
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        self.record("connect");
        if !self.permitted.load(Ordering::SeqCst) {
            return Err(anyhow!("adapter is powered off"));
        }
        self.set_connection_state(ConnectionState::Connected);
        self.fire(DeviceEvent::ServicesChanged);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record("disconnect");
        self.set_connection_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn cancel_connecting(&self) -> Result<()> {
        self.record("cancel_connecting");
        self.set_connection_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn reset_device(&self) -> Result<()> {
        self.record("reset_device");
        *self.selected.lock().unwrap() = None;
        Ok(())
    }
}
