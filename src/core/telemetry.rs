//! Per-characteristic telemetry.
//! A `TelemetryUnit` owns one characteristic's live value and accumulates byte
//! counters per channel. Once per tick it turns them into a bit rate and a
//! running maximum.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::device::{CharacteristicKey, SharedCharacteristic, ValueChange, ValueSource};
use crate::core::dispatcher::Dispatcher;
use crate::core::observable::{ObservableCollection, Property};
use crate::error::BleError;

/// What a unit needs from its surroundings.
#[derive(Clone)]
pub struct UnitContext {
    pub dispatcher: Dispatcher,
    /// Units are created on the presentation thread, which has no runtime of its own.
    pub runtime: Handle,
    pub tick_interval: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
struct ChannelCounters {
    total: u64,
    last_sample: u64,
    max_bps: u64,
}

#[derive(Debug, Default)]
struct CounterState {
    channels: [ChannelCounters; 3],
    disposed: bool,
}

/// Observable rate values of one channel, in bits per tick.
#[derive(Default)]
pub struct ChannelMetrics {
    pub bps: Property<u64>,
    pub max_bps: Property<u64>,
}

/// Rates computed by one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySample {
    pub bps: [u64; 3],
    pub max_bps: [u64; 3],
}

impl TelemetrySample {
    pub fn bps(&self, source: ValueSource) -> u64 {
        self.bps[source.index()]
    }

    pub fn max_bps(&self, source: ValueSource) -> u64 {
        self.max_bps[source.index()]
    }
}

pub struct TelemetryUnit {
    key: CharacteristicKey,
    context: UnitContext,
    handle: RwLock<SharedCharacteristic>,
    /// Guards every counter triple; `record_transfer` and `on_tick` both take it.
    counters: Mutex<CounterState>,
    metrics: [ChannelMetrics; 3],
    /// Latest value bytes.
    pub value: Property<Vec<u8>>,
    /// Text the user wants to write.
    pub write_value: Property<String>,
    /// Read-sourced events, oldest first.
    pub read_values: ObservableCollection<ValueChange>,
    pub is_notifying: Property<bool>,
    cancel: CancellationToken,
    listener: Mutex<Option<CancellationToken>>,
}

impl TelemetryUnit {
    /// Creates a unit with zeroed counters and starts its tick.
    pub fn new(handle: SharedCharacteristic, context: UnitContext) -> Arc<Self> {
        let key = CharacteristicKey::of(handle.as_ref());
        let unit = Arc::new(Self {
            key,
            value: Property::new(handle.value()),
            is_notifying: Property::new(handle.is_notifying()),
            write_value: Property::default(),
            read_values: ObservableCollection::new(),
            metrics: Default::default(),
            counters: Mutex::new(CounterState::default()),
            handle: RwLock::new(handle.clone()),
            cancel: CancellationToken::new(),
            listener: Mutex::new(None),
            context,
        });

        unit.listen(&handle);
        unit.start_ticker();
        unit
    }

    pub fn key(&self) -> CharacteristicKey {
        self.key
    }

    /// The access handle currently bound to this unit.
    pub fn handle(&self) -> SharedCharacteristic {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn can_notify(&self) -> bool {
        self.handle().can_notify()
    }

    pub fn metrics(&self, source: ValueSource) -> &ChannelMetrics {
        &self.metrics[source.index()]
    }

    /// Cumulative bytes seen on `source` since the unit was created.
    pub fn total_bytes(&self, source: ValueSource) -> u64 {
        self.lock_counters().channels[source.index()].total
    }

    pub fn is_disposed(&self) -> bool {
        self.lock_counters().disposed
    }

    /// Adds `byte_count` to the cumulative counter of `source`. Safe from any thread.
    pub fn record_transfer(&self, source: ValueSource, byte_count: usize) {
        let mut state = self.lock_counters();
        if state.disposed {
            return;
        }
        let channel = &mut state.channels[source.index()];
        channel.total = channel.total.saturating_add(byte_count as u64);
    }

    /// Samples every channel and publishes the rates. Returns `None` once disposed.
    pub fn on_tick(&self) -> Option<TelemetrySample> {
        let mut state = self.lock_counters();
        if state.disposed {
            return None;
        }

        let mut sample = TelemetrySample::default();
        for source in ValueSource::ALL {
            let i = source.index();
            let channel = &mut state.channels[i];

            let bps = channel.total.saturating_sub(channel.last_sample) * 8;
            channel.last_sample = channel.total;
            if bps > channel.max_bps {
                channel.max_bps = bps;
            }

            // Published under the lock so a concurrent dispose cannot interleave.
            self.metrics[i].bps.set(bps);
            self.metrics[i].max_bps.set(channel.max_bps);

            sample.bps[i] = bps;
            sample.max_bps[i] = channel.max_bps;
        }
        Some(sample)
    }

    /// Zeroes the running maximum of every channel.
    pub fn reset_max(&self) {
        let mut state = self.lock_counters();
        if state.disposed {
            return;
        }
        for source in ValueSource::ALL {
            state.channels[source.index()].max_bps = 0;
            self.metrics[source.index()].max_bps.set(0);
        }
    }

    /// Stops the tick and the value listener. Idempotent; once this returns no
    /// observable rate or value changes are published.
    pub fn dispose(&self) {
        {
            let mut state = self.lock_counters();
            if state.disposed {
                return;
            }
            state.disposed = true;
        }
        self.cancel.cancel();
        debug!("Telemetry for {} disposed", self.key);
    }

    /// Points the unit at a new handle for the same characteristic, keeping
    /// counters, history and identity.
    pub fn rebind(self: &Arc<Self>, handle: SharedCharacteristic) {
        let key = CharacteristicKey::of(handle.as_ref());
        debug_assert_eq!(key, self.key, "rebind across characteristics");
        if key != self.key {
            warn!("Refusing to rebind {} to handle of {}", self.key, key);
            return;
        }

        *self.handle.write().unwrap_or_else(PoisonError::into_inner) = handle.clone();
        if self.is_disposed() {
            return;
        }
        self.is_notifying.set(handle.is_notifying());
        self.listen(&handle);
        info!("Rebound characteristic {} to a new handle", self.key);
    }

    /// Replaces the write buffer on the presentation thread.
    pub async fn set_write_value(self: &Arc<Self>, text: String) -> Result<()> {
        let unit = self.clone();
        self.context
            .dispatcher
            .invoke(move || {
                unit.write_value.set(text);
            })
            .await
    }

    /// Writes the text in `write_value` and clears it on success.
    pub async fn write(self: &Arc<Self>) -> Result<()> {
        let text = self.write_value.get();
        if text.is_empty() {
            return Err(anyhow!(BleError::EmptyWriteValue));
        }

        self.handle().write(text.as_bytes()).await?;

        let unit = self.clone();
        self.context
            .dispatcher
            .invoke(move || {
                unit.write_value.set(String::new());
            })
            .await
    }

    /// Issues a read; the value arrives as a Read-sourced change event.
    pub async fn read(&self) -> Result<Vec<u8>> {
        self.handle().read().await
    }

    /// Flips notifications and returns whether the characteristic now notifies.
    pub async fn toggle_notify(self: &Arc<Self>) -> Result<bool> {
        let handle = self.handle();
        if handle.is_notifying() {
            handle.stop_notifications().await?;
        } else {
            handle.start_notifications().await?;
        }

        let notifying = handle.is_notifying();
        let unit = self.clone();
        self.context
            .dispatcher
            .invoke(move || {
                if !unit.is_disposed() {
                    unit.is_notifying.set(notifying);
                }
            })
            .await?;
        Ok(notifying)
    }

    fn lock_counters(&self) -> std::sync::MutexGuard<'_, CounterState> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_ticker(self: &Arc<Self>) {
        let unit = Arc::downgrade(self);
        let token = self.cancel.clone();
        let dispatcher = self.context.dispatcher.clone();
        let period = self.context.tick_interval;
        let key = self.key;

        self.context.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(unit) = unit.upgrade() else { break };
                        // Awaiting keeps ticks from overlapping.
                        if let Err(e) = dispatcher.invoke(move || unit.on_tick()).await {
                            warn!("Telemetry tick for {} failed: {:#}", key, e);
                        }
                    }
                }
            }
            debug!("Telemetry ticker for {} stopped", key);
        });
    }

    fn listen(self: &Arc<Self>, handle: &SharedCharacteristic) {
        let token = self.cancel.child_token();
        if let Some(previous) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone())
        {
            previous.cancel();
        }

        // Subscribe before spawning so no event after this call is missed.
        let mut changes = handle.value_changes();
        let unit = Arc::downgrade(self);
        let key = self.key;

        self.context.runtime.spawn(async move {
            loop {
                let change = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    change = changes.recv() => change,
                };
                match change {
                    Ok(change) => {
                        let Some(unit) = unit.upgrade() else { break };
                        unit.on_value_changed(change).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Value listener for {} skipped {} events", key, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Value listener for {} stopped", key);
        });
    }

    async fn on_value_changed(self: Arc<Self>, change: ValueChange) {
        // Counter math stays on the delivering thread.
        self.record_transfer(change.source, change.value.len());

        let unit = self.clone();
        let result = self
            .context
            .dispatcher
            .invoke(move || unit.publish_value(change))
            .await;
        if let Err(e) = result {
            warn!("Failed to publish value of {}: {:#}", self.key, e);
        }
    }

    fn publish_value(&self, change: ValueChange) {
        if self.is_disposed() {
            return;
        }
        self.value.set(change.value.clone());
        if change.source == ValueSource::Read {
            self.read_values.push(change);
        }
    }
}

impl Drop for TelemetryUnit {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fake::{FakeCharacteristic, test_context, wait_until};
    use uuid::Uuid;

    const SERVICE: Uuid = Uuid::from_u128(0x1000);
    const CHAR: Uuid = Uuid::from_u128(0x2000);

    #[tokio::test]
    async fn rate_is_eight_times_bytes_recorded_in_the_interval() {
        let unit = TelemetryUnit::new(FakeCharacteristic::shared(SERVICE, CHAR), test_context());

        unit.record_transfer(ValueSource::Write, 10);
        unit.record_transfer(ValueSource::Write, 5);
        unit.record_transfer(ValueSource::Notify, 20);
        let sample = unit.on_tick().unwrap();

        assert_eq!(sample.bps(ValueSource::Write), 120);
        assert_eq!(sample.bps(ValueSource::Notify), 160);
        assert_eq!(sample.bps(ValueSource::Read), 0);
        assert_eq!(unit.metrics(ValueSource::Write).bps.get(), 120);

        unit.record_transfer(ValueSource::Write, 1);
        let sample = unit.on_tick().unwrap();
        assert_eq!(sample.bps(ValueSource::Write), 8);
        assert_eq!(sample.max_bps(ValueSource::Write), 120);
        assert_eq!(sample.bps(ValueSource::Notify), 0);
        assert_eq!(unit.metrics(ValueSource::Notify).max_bps.get(), 160);
    }

    #[tokio::test]
    async fn reset_max_then_idle_tick_leaves_zero_maximum() {
        let unit = TelemetryUnit::new(FakeCharacteristic::shared(SERVICE, CHAR), test_context());
        for source in ValueSource::ALL {
            unit.record_transfer(source, 100);
        }
        unit.on_tick();

        unit.reset_max();
        let sample = unit.on_tick().unwrap();

        for source in ValueSource::ALL {
            assert_eq!(sample.max_bps(source), 0);
            assert_eq!(unit.metrics(source).max_bps.get(), 0);
            assert_eq!(unit.total_bytes(source), 100);
        }
    }

    #[tokio::test]
    async fn dispose_stops_all_publication() {
        let unit = TelemetryUnit::new(FakeCharacteristic::shared(SERVICE, CHAR), test_context());
        let bps = unit.metrics(ValueSource::Read).bps.subscribe();
        let max = unit.metrics(ValueSource::Read).max_bps.subscribe();

        unit.dispose();
        unit.dispose();
        unit.record_transfer(ValueSource::Read, 64);

        assert!(unit.on_tick().is_none());
        unit.reset_max();
        assert!(!bps.has_changed().unwrap());
        assert!(!max.has_changed().unwrap());
    }

    #[tokio::test]
    async fn scheduled_ticks_stop_after_dispose() {
        let mut context = test_context();
        context.tick_interval = Duration::from_millis(10);
        let unit = TelemetryUnit::new(FakeCharacteristic::shared(SERVICE, CHAR), context);
        let mut bps = unit.metrics(ValueSource::Notify).bps.subscribe();
        let mut max = unit.metrics(ValueSource::Notify).max_bps.subscribe();

        unit.record_transfer(ValueSource::Notify, 4);
        assert!(wait_until(|| unit.metrics(ValueSource::Notify).max_bps.get() == 32).await);

        unit.dispose();
        bps.mark_unchanged();
        max.mark_unchanged();
        unit.record_transfer(ValueSource::Notify, 4);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(!bps.has_changed().unwrap());
        assert!(!max.has_changed().unwrap());
    }

    #[tokio::test]
    async fn concurrent_transfers_are_neither_lost_nor_double_counted() {
        let unit = TelemetryUnit::new(FakeCharacteristic::shared(SERVICE, CHAR), test_context());

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let unit = unit.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        unit.record_transfer(ValueSource::Notify, 3);
                    }
                })
            })
            .collect();

        let mut sampled_bits = 0;
        while writers.iter().any(|w| !w.is_finished()) {
            sampled_bits += unit.on_tick().unwrap().bps(ValueSource::Notify);
        }
        for writer in writers {
            writer.join().unwrap();
        }
        sampled_bits += unit.on_tick().unwrap().bps(ValueSource::Notify);

        assert_eq!(sampled_bits, 4 * 1000 * 3 * 8);
        assert_eq!(unit.total_bytes(ValueSource::Notify), 12_000);
    }

    #[tokio::test]
    async fn value_changes_update_counters_value_and_read_history() {
        let handle = FakeCharacteristic::new(SERVICE, CHAR);
        let unit = TelemetryUnit::new(handle.clone(), test_context());

        handle.emit(ValueSource::Notify, vec![1, 2, 3]);
        handle.emit(ValueSource::Read, vec![9; 5]);
        assert!(wait_until(|| unit.read_values.len() == 1).await);

        assert_eq!(unit.total_bytes(ValueSource::Notify), 3);
        assert_eq!(unit.total_bytes(ValueSource::Read), 5);
        assert_eq!(unit.value.get(), vec![9; 5]);
        assert_eq!(unit.read_values.snapshot()[0].source, ValueSource::Read);
    }

    #[tokio::test]
    async fn rebind_keeps_counters_and_writes_through_new_handle() {
        let old = FakeCharacteristic::new(SERVICE, CHAR);
        let unit = TelemetryUnit::new(old.clone(), test_context());
        unit.record_transfer(ValueSource::Write, 42);

        let new = FakeCharacteristic::new(SERVICE, CHAR);
        unit.rebind(new.clone());
        unit.write_value.set("hi".to_string());
        unit.write().await.unwrap();

        assert!(old.written().is_empty());
        assert_eq!(new.written(), vec![b"hi".to_vec()]);
        assert!(unit.write_value.get().is_empty());
        assert!(wait_until(|| unit.total_bytes(ValueSource::Write) == 44).await);

        // Events from the retired handle no longer count.
        old.emit(ValueSource::Notify, vec![0; 8]);
        new.emit(ValueSource::Notify, vec![0; 2]);
        assert!(wait_until(|| unit.total_bytes(ValueSource::Notify) == 2).await);
    }

    #[tokio::test]
    async fn empty_write_value_is_rejected() {
        let handle = FakeCharacteristic::new(SERVICE, CHAR);
        let unit = TelemetryUnit::new(handle.clone(), test_context());

        let err = unit.write().await.unwrap_err();
        assert_eq!(err.to_string(), "Please enter text to send.");
        assert!(handle.written().is_empty());
    }

    #[tokio::test]
    async fn toggle_notify_flips_and_publishes() {
        let handle = FakeCharacteristic::new(SERVICE, CHAR);
        let unit = TelemetryUnit::new(handle.clone(), test_context());

        assert!(unit.toggle_notify().await.unwrap());
        assert!(unit.is_notifying.get());
        assert!(!unit.toggle_notify().await.unwrap());
        assert!(!unit.is_notifying.get());
    }

    #[tokio::test]
    async fn write_buffer_is_replaced_in_presentation_order() {
        let unit = TelemetryUnit::new(FakeCharacteristic::shared(SERVICE, CHAR), test_context());
        let (release, gate) = std::sync::mpsc::channel::<()>();
        unit.context.dispatcher.begin_invoke(move || {
            let _ = gate.recv();
        });

        let pending = tokio::spawn({
            let unit = unit.clone();
            async move { unit.set_write_value("hello".to_string()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(unit.write_value.get(), "");

        release.send(()).unwrap();
        pending.await.unwrap().unwrap();
        assert_eq!(unit.write_value.get(), "hello");
    }
}
