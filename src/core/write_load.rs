//! Synthetic write load.
//! While running, writes a small numbered payload to one well-known
//! characteristic at a fixed interval. A failed write stops the driver.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::device::{ConnectionState, DeviceAccess, SharedCharacteristic};
use crate::core::dispatcher::Dispatcher;
use crate::core::notifier::Notifier;
use crate::core::observable::Property;
use crate::error::BleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteLoadState {
    Idle,
    Running,
}

/// Observable driver state for the presentation layer.
pub struct WriteLoadView {
    pub is_running: Property<bool>,
    pub can_start_writing: Property<bool>,
    pub can_stop_writing: Property<bool>,
    pub interval_ms: Property<u64>,
}

struct Session {
    token: CancellationToken,
    id: u64,
    task: JoinHandle<()>,
}

impl Session {
    /// Cancels the session and waits until its task has returned.
    async fn finish(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!("Write load session {} ended abnormally: {}", self.id, e);
        }
    }
}

#[derive(Default)]
struct DriverInner {
    session: Option<Session>,
    next_session_id: u64,
}

/// Encodes `sequence` into a zeroed payload: low byte first, then the next byte.
pub fn encode_payload(sequence: u32, payload_len: usize) -> Vec<u8> {
    let mut data = vec![0u8; payload_len];
    for (slot, byte) in data.iter_mut().zip(sequence.to_le_bytes().into_iter().take(2)) {
        *slot = byte;
    }
    data
}

pub struct WriteLoadDriver {
    target_uuid: Uuid,
    payload_len: usize,
    /// Read by the running session on every tick.
    target: Arc<Mutex<Option<SharedCharacteristic>>>,
    /// Persists across start/stop cycles.
    sequence: Arc<AtomicU32>,
    inner: Arc<Mutex<DriverInner>>,
    /// Serializes `start` and `stop`.
    control: tokio::sync::Mutex<()>,
    view: Arc<WriteLoadView>,
    dispatcher: Dispatcher,
    notifier: Notifier,
}

impl WriteLoadDriver {
    pub fn new(
        target_uuid: Uuid,
        payload_len: usize,
        default_interval: Duration,
        dispatcher: Dispatcher,
        notifier: Notifier,
    ) -> Self {
        Self {
            target_uuid,
            payload_len,
            target: Arc::new(Mutex::new(None)),
            sequence: Arc::new(AtomicU32::new(0)),
            inner: Arc::new(Mutex::new(DriverInner::default())),
            control: tokio::sync::Mutex::new(()),
            view: Arc::new(WriteLoadView {
                is_running: Property::new(false),
                can_start_writing: Property::new(true),
                can_stop_writing: Property::new(false),
                interval_ms: Property::new(default_interval.as_millis() as u64),
            }),
            dispatcher,
            notifier,
        }
    }

    pub fn view(&self) -> &WriteLoadView {
        &self.view
    }

    pub fn state(&self) -> WriteLoadState {
        match lock(&self.inner).session {
            Some(_) => WriteLoadState::Running,
            None => WriteLoadState::Idle,
        }
    }

    /// Next sequence number to be written.
    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn has_target(&self) -> bool {
        lock(&self.target).is_some()
    }

    /// Looks up the target characteristic on the connected device.
    /// Returns whether one was found. A running session writes to the new
    /// handle from its next tick on.
    pub async fn initialize(&self, access: &dyn DeviceAccess) -> Result<bool> {
        let mut found = None;
        if access.connection_state() == ConnectionState::Connected {
            found = access
                .services()
                .await?
                .into_iter()
                .flat_map(|service| service.characteristics)
                .find(|handle| handle.id() == self.target_uuid);
        }

        let has_target = found.is_some();
        *lock(&self.target) = found;
        if has_target {
            info!("Write load target {} resolved", self.target_uuid);
        } else {
            info!("Write load target {} not present; writing disabled", self.target_uuid);
        }
        Ok(has_target)
    }

    /// Starts (or restarts) writing every `interval`. Without a target this does nothing.
    /// A running session is stopped and awaited before the new one begins.
    pub async fn start(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(anyhow!(BleError::InvalidInterval));
        }
        if !self.has_target() {
            warn!("No write load target; start ignored.");
            return Ok(());
        }

        let _control = self.control.lock().await;
        let previous = lock(&self.inner).session.take();
        if let Some(previous) = previous {
            previous.finish().await;
        }

        {
            // The new task cannot observe `inner` before its session is stored.
            let mut inner = lock(&self.inner);
            inner.next_session_id += 1;
            let id = inner.next_session_id;
            let token = CancellationToken::new();
            let task = tokio::spawn(run_session(
                interval,
                self.payload_len,
                token.clone(),
                id,
                SessionShared {
                    target: self.target.clone(),
                    sequence: self.sequence.clone(),
                    inner: self.inner.clone(),
                    view: self.view.clone(),
                    dispatcher: self.dispatcher.clone(),
                    notifier: self.notifier.clone(),
                },
            ));
            inner.session = Some(Session { token, id, task });
        }

        publish(&self.dispatcher, &self.view, true, Some(interval));
        info!("Write load started every {:?}", interval);
        Ok(())
    }

    /// Stops writing and waits for the session task to finish, so no write
    /// starts after this returns. A no-op while idle.
    pub async fn stop(&self) {
        let _control = self.control.lock().await;
        let Some(session) = lock(&self.inner).session.take() else {
            return;
        };
        session.finish().await;
        publish(&self.dispatcher, &self.view, false, None);
        info!("Write load stopped");
    }
}

impl Drop for WriteLoadDriver {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.inner).session.take() {
            session.token.cancel();
        }
    }
}

struct SessionShared {
    target: Arc<Mutex<Option<SharedCharacteristic>>>,
    sequence: Arc<AtomicU32>,
    inner: Arc<Mutex<DriverInner>>,
    view: Arc<WriteLoadView>,
    dispatcher: Dispatcher,
    notifier: Notifier,
}

async fn run_session(
    interval: Duration,
    payload_len: usize,
    token: CancellationToken,
    session_id: u64,
    shared: SessionShared,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(target) = lock(&shared.target).clone() else {
            info!("Write load target gone; stopping");
            if end_if_current(&shared, session_id) {
                publish(&shared.dispatcher, &shared.view, false, None);
            }
            break;
        };

        let sequence = shared.sequence.fetch_add(1, Ordering::SeqCst);
        let payload = encode_payload(sequence, payload_len);
        debug!("Write load #{}", sequence);

        if let Err(e) = target.write(&payload).await {
            // Only the session that is still current reports; a user stop wins.
            if end_if_current(&shared, session_id) {
                publish(&shared.dispatcher, &shared.view, false, None);
                shared.notifier.notify("Error", format!("Write failed: {:#}", e));
            }
            break;
        }
    }
    debug!("Write load session {} ended", session_id);
}

/// Clears the driver's session if it is still `session_id`.
fn end_if_current(shared: &SessionShared, session_id: u64) -> bool {
    let mut inner = lock(&shared.inner);
    if inner.session.as_ref().is_some_and(|s| s.id == session_id) {
        inner.session = None;
        true
    } else {
        false
    }
}

fn publish(dispatcher: &Dispatcher, view: &Arc<WriteLoadView>, running: bool, interval: Option<Duration>) {
    let view = view.clone();
    dispatcher.begin_invoke(move || {
        view.is_running.set(running);
        view.can_start_writing.set(!running);
        view.can_stop_writing.set(running);
        if let Some(interval) = interval {
            view.interval_ms.set(interval.as_millis() as u64);
        }
    });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
