//! Scan and connection event bridge.
//! Forwards discovery, scan-state and connection-state events from the
//! device-access layer into observable state on the presentation thread.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::device::{ConnectionState, DeviceAccess, DeviceEvent, DiscoveredDevice};
use crate::core::dispatcher::Dispatcher;
use crate::core::observable::{ObservableCollection, Property};

/// Observable scan and connection state.
pub struct BridgeView {
    pub is_scanning: Property<bool>,
    pub can_start_scan: Property<bool>,
    pub can_stop_scan: Property<bool>,
    /// Devices seen during the current scan pass, in discovery order.
    pub devices: ObservableCollection<DiscoveredDevice>,
    pub connection_state: Property<ConnectionState>,
}

impl BridgeView {
    fn new(is_scanning: bool, connection_state: ConnectionState) -> Self {
        Self {
            is_scanning: Property::new(is_scanning),
            can_start_scan: Property::new(!is_scanning),
            can_stop_scan: Property::new(is_scanning),
            devices: ObservableCollection::new(),
            connection_state: Property::new(connection_state),
        }
    }

    fn apply_scan_state(&self, is_scanning: bool) {
        self.is_scanning.set(is_scanning);
        self.can_start_scan.set(!is_scanning);
        self.can_stop_scan.set(is_scanning);
    }
}

/// Asks the listener to clear the device list; answered once done.
type ClearRequest = oneshot::Sender<()>;

pub struct EventBridge {
    access: Arc<dyn DeviceAccess>,
    dispatcher: Dispatcher,
    view: Arc<BridgeView>,
    clears: mpsc::UnboundedSender<ClearRequest>,
    /// Taken by the listener when it starts.
    pending_clears: Mutex<Option<mpsc::UnboundedReceiver<ClearRequest>>>,
    shutdown: CancellationToken,
}

impl EventBridge {
    pub fn new(access: Arc<dyn DeviceAccess>, dispatcher: Dispatcher) -> Self {
        let view = Arc::new(BridgeView::new(access.is_scanning(), access.connection_state()));
        let (clears, pending_clears) = mpsc::unbounded_channel();
        Self {
            access,
            dispatcher,
            view,
            clears,
            pending_clears: Mutex::new(Some(pending_clears)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn view(&self) -> &BridgeView {
        &self.view
    }

    /// Starts forwarding device events. Only the first call has an effect.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let Some(mut clears) = self.pending_clears.lock().unwrap_or_else(PoisonError::into_inner).take()
        else {
            warn!("Event bridge already started");
            return None;
        };
        let mut events = self.access.events();
        let view = self.view.clone();
        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();

        Some(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    Some(done) = clears.recv() => {
                        clear_devices(&mut events, &view, &dispatcher).await;
                        let _ = done.send(());
                        continue;
                    }
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => apply_event(&view, &dispatcher, event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event bridge skipped {} device events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Event bridge stopped");
        }))
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Ends any running scan pass, clears the device list, then asks the radio to scan.
    /// Discoveries still queued from the previous pass are dropped with the list.
    pub async fn start_scan(&self) -> Result<()> {
        self.access.stop_scan().await?;

        let listening = self.pending_clears.lock().unwrap_or_else(PoisonError::into_inner).is_none();
        if !listening {
            let view = self.view.clone();
            self.dispatcher.invoke(move || view.devices.clear()).await?;
            return self.access.start_scan().await;
        }

        let (done, cleared) = oneshot::channel();
        self.clears
            .send(done)
            .map_err(|_| anyhow!("Event bridge is not running"))?;
        cleared
            .await
            .map_err(|_| anyhow!("Event bridge stopped before clearing devices"))?;

        self.access.start_scan().await
    }

    /// Asks the radio to stop. `is_scanning` follows only once the radio confirms.
    pub async fn stop_scan(&self) -> Result<()> {
        self.access.stop_scan().await
    }

    pub async fn select_device(&self, device_id: &str) -> Result<()> {
        self.access.stop_scan().await?;
        self.access.select_device(device_id).await
    }

    pub async fn connect(&self) -> Result<()> {
        if self.access.selected_device().is_none() {
            info!("Connect ignored: no device selected.");
            return Ok(());
        }
        self.access.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        if self.access.connection_state() != ConnectionState::Connected {
            return Ok(());
        }
        self.access.disconnect().await
    }

    pub async fn cancel_connecting(&self) -> Result<()> {
        if self.access.connection_state() != ConnectionState::Connecting {
            return Ok(());
        }
        self.access.cancel_connecting().await
    }

    pub async fn reset_device(&self) -> Result<()> {
        self.access.reset_device().await
    }
}

async fn apply_event(view: &Arc<BridgeView>, dispatcher: &Dispatcher, event: DeviceEvent) {
    let view = view.clone();
    let applied = match event {
        DeviceEvent::ScanStateChanged(is_scanning) => {
            dispatcher.invoke(move || view.apply_scan_state(is_scanning)).await
        }
        DeviceEvent::DeviceDiscovered(device) => {
            debug!("Discovered {} ({})", device.name, device.id);
            dispatcher.invoke(move || view.devices.push(device)).await
        }
        DeviceEvent::ConnectionStateChanged(state) => {
            info!("Connection state: {:?}", state);
            dispatcher
                .invoke(move || {
                    view.connection_state.set(state);
                })
                .await
        }
        DeviceEvent::ServicesChanged => Ok(()),
    };
    if let Err(e) = applied {
        warn!("Failed to apply device event: {:#}", e);
    }
}

/// Applies everything already queued except discoveries, then empties the list.
async fn clear_devices(
    events: &mut broadcast::Receiver<DeviceEvent>,
    view: &Arc<BridgeView>,
    dispatcher: &Dispatcher,
) {
    loop {
        match events.try_recv() {
            Ok(DeviceEvent::DeviceDiscovered(device)) => {
                debug!("Dropping {} from the previous scan pass", device.id);
            }
            Ok(event) => apply_event(view, dispatcher, event).await,
            Err(TryRecvError::Lagged(skipped)) => {
                warn!("Event bridge skipped {} device events", skipped);
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }

    let view = view.clone();
    if let Err(e) = dispatcher.invoke(move || view.devices.clear()).await {
        warn!("Failed to clear devices: {:#}", e);
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
