//! Characteristic reconciliation.
//! Keeps one `TelemetryUnit` per live (service, characteristic) pair, reusing
//! units across topology changes so the UI keeps identity and metrics.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use anyhow::Result;
use log::{debug, error, info};
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::device::{CharacteristicKey, DeviceAccess, DeviceEvent, ServiceSnapshot};
use crate::core::notifier::Notifier;
use crate::core::observable::ObservableCollection;
use crate::core::telemetry::{TelemetryUnit, UnitContext};

/// Edits made by one reconciliation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub added: Vec<CharacteristicKey>,
    pub removed: Vec<CharacteristicKey>,
    pub rebound: Vec<CharacteristicKey>,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.rebound.is_empty()
    }
}

pub struct CharacteristicStore {
    access: Arc<dyn DeviceAccess>,
    context: UnitContext,
    notifier: Notifier,
    characteristics: Arc<ObservableCollection<Arc<TelemetryUnit>>>,
    /// Serializes reconciliations.
    reconcile_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl CharacteristicStore {
    pub fn new(access: Arc<dyn DeviceAccess>, context: UnitContext, notifier: Notifier) -> Arc<Self> {
        Arc::new(Self {
            access,
            context,
            notifier,
            characteristics: Arc::new(ObservableCollection::new()),
            reconcile_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    /// The UI-observable collection. Only the store edits it.
    pub fn characteristics(&self) -> &ObservableCollection<Arc<TelemetryUnit>> {
        &self.characteristics
    }

    pub fn find(&self, key: CharacteristicKey) -> Option<Arc<TelemetryUnit>> {
        self.characteristics.find(|unit| unit.key() == key)
    }

    /// Reconciles whenever the device reports a topology change.
    pub fn watch_topology(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.access.events();
        let store: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(DeviceEvent::ServicesChanged) | Err(RecvError::Lagged(_)) => {
                        let Some(store) = store.upgrade() else { break };
                        if let Err(e) = store.update_characteristics().await {
                            store.notifier.notify_error("Error", &e.context("Failed to update characteristics"));
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Topology watcher stopped");
        })
    }

    /// Brings the collection in line with the device's current services.
    /// Concurrent calls run one after the other.
    pub async fn update_characteristics(&self) -> Result<ReconcileOutcome> {
        let _guard = self.reconcile_lock.lock().await;

        // An immutable copy; later topology changes cannot be seen mid-edit.
        let services = self.access.services().await?;

        let characteristics = self.characteristics.clone();
        let context = self.context.clone();
        let outcome = self
            .context
            .dispatcher
            .invoke(move || apply_snapshot(&characteristics, &context, &services))
            .await?;

        if !outcome.is_noop() {
            info!(
                "Characteristics reconciled: {} added, {} removed, {} rebound",
                outcome.added.len(),
                outcome.removed.len(),
                outcome.rebound.len()
            );
        }
        Ok(outcome)
    }

    pub async fn reset_all_maxima(&self) -> Result<()> {
        let characteristics = self.characteristics.clone();
        self.context
            .dispatcher
            .invoke(move || {
                for unit in characteristics.snapshot() {
                    unit.reset_max();
                }
            })
            .await
    }

    /// Stops watching and disposes every unit.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let _guard = self.reconcile_lock.lock().await;
        let characteristics = self.characteristics.clone();
        self.context
            .dispatcher
            .invoke(move || {
                for unit in characteristics.snapshot() {
                    unit.dispose();
                }
                characteristics.clear();
            })
            .await
    }
}

/// Applies `services` to `characteristics` in one presentation-thread turn.
fn apply_snapshot(
    characteristics: &ObservableCollection<Arc<TelemetryUnit>>,
    context: &UnitContext,
    services: &[ServiceSnapshot],
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    let present: HashSet<CharacteristicKey> = services
        .iter()
        .flat_map(|service| {
            service
                .characteristics
                .iter()
                .map(move |handle| CharacteristicKey::new(service.id, handle.id()))
        })
        .collect();

    // Departures first, so metrics of retired units never leak into new ones.
    // Retired units are quiet before observers see them leave.
    while let Some(unit) = characteristics.find(|unit| !present.contains(&unit.key())) {
        unit.reset_max();
        unit.dispose();
        if let Some(index) = characteristics.position(|candidate| Arc::ptr_eq(candidate, &unit)) {
            characteristics.remove_at(index);
        }
        outcome.removed.push(unit.key());
    }

    let mut seen = HashSet::new();
    for service in services {
        for handle in &service.characteristics {
            let key = CharacteristicKey::new(service.id, handle.id());
            if !seen.insert(key) {
                debug_assert!(false, "duplicate characteristic {key} in one snapshot");
                error!("Duplicate characteristic {} in service snapshot; ignoring", key);
                continue;
            }

            match characteristics.find(|unit| unit.key() == key) {
                None => {
                    debug!("Creating telemetry for {}", key);
                    characteristics.push(TelemetryUnit::new(handle.clone(), context.clone()));
                    outcome.added.push(key);
                }
                Some(unit) if !Arc::ptr_eq(&unit.handle(), handle) => {
                    debug!("Reusing telemetry for {}", key);
                    unit.rebind(handle.clone());
                    outcome.rebound.push(key);
                }
                Some(_) => {}
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::{SharedCharacteristic, ValueSource};
    use crate::core::fake::{FakeCharacteristic, FakeDeviceAccess, service, test_context, wait_until};
    use crate::core::observable::CollectionChange;
    use uuid::Uuid;

    const SVC_1: Uuid = Uuid::from_u128(0x1);
    const SVC_2: Uuid = Uuid::from_u128(0x2);
    const A: Uuid = Uuid::from_u128(0xA);
    const B: Uuid = Uuid::from_u128(0xB);
    const C: Uuid = Uuid::from_u128(0xC);

    fn store_with(access: &Arc<FakeDeviceAccess>) -> Arc<CharacteristicStore> {
        CharacteristicStore::new(access.clone(), test_context(), Notifier::new())
    }

    fn units(store: &CharacteristicStore) -> Vec<Arc<TelemetryUnit>> {
        store.characteristics().snapshot()
    }

    #[tokio::test]
    async fn second_reconcile_with_same_snapshot_is_a_noop() {
        let access = FakeDeviceAccess::new();
        access.set_services(vec![service(
            SVC_1,
            vec![FakeCharacteristic::shared(SVC_1, A), FakeCharacteristic::shared(SVC_1, B)],
        )]);
        let store = store_with(&access);

        let first = store.update_characteristics().await.unwrap();
        assert_eq!(first.added.len(), 2);
        let before = units(&store);
        before[0].record_transfer(ValueSource::Notify, 10);
        before[0].on_tick();

        let second = store.update_characteristics().await.unwrap();

        assert!(second.is_noop());
        let after = units(&store);
        assert_eq!(after.len(), 2);
        assert!(before.iter().zip(&after).all(|(b, a)| Arc::ptr_eq(b, a)));
        assert_eq!(after[0].metrics(ValueSource::Notify).max_bps.get(), 80);
    }

    #[tokio::test]
    async fn topology_churn_removes_reuses_and_creates() {
        let access = FakeDeviceAccess::new();
        let b: SharedCharacteristic = FakeCharacteristic::shared(SVC_1, B);
        access.set_services(vec![service(SVC_1, vec![FakeCharacteristic::shared(SVC_1, A), b.clone()])]);
        let store = store_with(&access);
        store.update_characteristics().await.unwrap();

        let unit_a = store.find(CharacteristicKey::new(SVC_1, A)).unwrap();
        let unit_b = store.find(CharacteristicKey::new(SVC_1, B)).unwrap();
        unit_a.record_transfer(ValueSource::Read, 5);
        unit_a.on_tick();
        unit_b.record_transfer(ValueSource::Write, 7);

        access.set_services(vec![service(SVC_1, vec![b, FakeCharacteristic::shared(SVC_1, C)])]);
        let outcome = store.update_characteristics().await.unwrap();

        assert_eq!(outcome.removed, vec![CharacteristicKey::new(SVC_1, A)]);
        assert_eq!(outcome.added, vec![CharacteristicKey::new(SVC_1, C)]);
        assert!(outcome.rebound.is_empty());

        assert!(unit_a.is_disposed());
        assert_eq!(unit_a.metrics(ValueSource::Read).max_bps.get(), 0);

        let reused = store.find(CharacteristicKey::new(SVC_1, B)).unwrap();
        assert!(Arc::ptr_eq(&reused, &unit_b));
        assert_eq!(reused.total_bytes(ValueSource::Write), 7);

        let fresh = store.find(CharacteristicKey::new(SVC_1, C)).unwrap();
        assert!(ValueSource::ALL.iter().all(|s| fresh.total_bytes(*s) == 0));
        assert_eq!(units(&store).len(), 2);
    }

    #[tokio::test]
    async fn removed_units_are_disposed_before_removal_is_published() {
        let access = FakeDeviceAccess::new();
        access.set_services(vec![service(SVC_1, vec![FakeCharacteristic::shared(SVC_1, A)])]);
        let store = store_with(&access);
        store.update_characteristics().await.unwrap();
        let unit = store.find(CharacteristicKey::new(SVC_1, A)).unwrap();
        unit.record_transfer(ValueSource::Notify, 10);
        unit.on_tick();

        let mut changes = store.characteristics().subscribe();
        let observed = std::thread::spawn({
            let unit = unit.clone();
            move || loop {
                match changes.blocking_recv() {
                    Ok(CollectionChange::Removed { .. }) => {
                        break (unit.is_disposed(), unit.metrics(ValueSource::Notify).max_bps.get());
                    }
                    Ok(_) => {}
                    Err(_) => break (false, u64::MAX),
                }
            }
        });

        access.set_services(Vec::new());
        store.update_characteristics().await.unwrap();

        assert_eq!(observed.join().unwrap(), (true, 0));
    }

    #[tokio::test]
    async fn reconnect_refreshes_handle_without_losing_counters() {
        let access = FakeDeviceAccess::new();
        access.set_services(vec![service(SVC_1, vec![FakeCharacteristic::shared(SVC_1, A)])]);
        let store = store_with(&access);
        store.update_characteristics().await.unwrap();
        let unit = store.find(CharacteristicKey::new(SVC_1, A)).unwrap();
        unit.record_transfer(ValueSource::Notify, 100);

        let reconnected = FakeCharacteristic::new(SVC_1, A);
        access.set_services(vec![service(SVC_1, vec![reconnected.clone() as SharedCharacteristic])]);
        let outcome = store.update_characteristics().await.unwrap();

        assert_eq!(outcome.rebound, vec![CharacteristicKey::new(SVC_1, A)]);
        let same = store.find(CharacteristicKey::new(SVC_1, A)).unwrap();
        assert!(Arc::ptr_eq(&same, &unit));
        assert_eq!(same.total_bytes(ValueSource::Notify), 100);

        same.write_value.set("ping".to_string());
        same.write().await.unwrap();
        assert_eq!(reconnected.written(), vec![b"ping".to_vec()]);
    }

    #[tokio::test]
    async fn same_characteristic_under_two_services_gets_two_units() {
        let access = FakeDeviceAccess::new();
        access.set_services(vec![
            service(SVC_1, vec![FakeCharacteristic::shared(SVC_1, A)]),
            service(SVC_2, vec![FakeCharacteristic::shared(SVC_2, A)]),
        ]);
        let store = store_with(&access);

        let outcome = store.update_characteristics().await.unwrap();
        assert_eq!(outcome.added.len(), 2);

        access.set_services(vec![service(SVC_2, vec![FakeCharacteristic::shared(SVC_2, A)])]);
        let outcome = store.update_characteristics().await.unwrap();
        assert_eq!(outcome.removed, vec![CharacteristicKey::new(SVC_1, A)]);
        assert_eq!(outcome.rebound, vec![CharacteristicKey::new(SVC_2, A)]);
    }

    #[tokio::test]
    async fn overlapping_reconciles_never_duplicate_units() {
        let access = FakeDeviceAccess::new();
        access.set_services(vec![service(
            SVC_1,
            vec![FakeCharacteristic::shared(SVC_1, A), FakeCharacteristic::shared(SVC_1, B)],
        )]);
        let store = store_with(&access);

        let (first, second) = tokio::join!(store.update_characteristics(), store.update_characteristics());
        let added = first.unwrap().added.len() + second.unwrap().added.len();

        assert_eq!(added, 2);
        assert_eq!(units(&store).len(), 2);
    }

    #[tokio::test]
    async fn topology_event_triggers_reconcile() {
        let access = FakeDeviceAccess::new();
        let store = store_with(&access);
        let _watcher = store.watch_topology();

        access.change_services(vec![service(SVC_1, vec![FakeCharacteristic::shared(SVC_1, A)])]);
        assert!(wait_until(|| store.characteristics().len() == 1).await);

        access.change_services(Vec::new());
        assert!(wait_until(|| store.characteristics().is_empty()).await);
    }

    #[tokio::test]
    async fn reset_all_maxima_zeroes_every_unit() {
        let access = FakeDeviceAccess::new();
        access.set_services(vec![service(
            SVC_1,
            vec![FakeCharacteristic::shared(SVC_1, A), FakeCharacteristic::shared(SVC_1, B)],
        )]);
        let store = store_with(&access);
        store.update_characteristics().await.unwrap();
        for unit in units(&store) {
            unit.record_transfer(ValueSource::Write, 3);
            unit.on_tick();
        }

        store.reset_all_maxima().await.unwrap();

        for unit in units(&store) {
            assert_eq!(unit.metrics(ValueSource::Write).max_bps.get(), 0);
        }
    }
}
