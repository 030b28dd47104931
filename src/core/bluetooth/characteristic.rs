//! `CharacteristicHandle` over a bluest characteristic.
//! Handles are built fresh on every connect and never outlive the connection
//! that discovered them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};
use bluest::Characteristic;
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::constants::VALUE_CHANNEL_CAPACITY;
use crate::core::device::{CharacteristicHandle, SharedCharacteristic, ValueChange, ValueSource};

/// Last value plus the broadcast of value changes. Shared with the notification task.
struct ValueCache {
    value: Mutex<Vec<u8>>,
    changes: broadcast::Sender<ValueChange>,
}

impl ValueCache {
    fn publish(&self, source: ValueSource, value: Vec<u8>) {
        *lock(&self.value) = value.clone();
        // No receivers simply means nobody is watching this characteristic yet.
        let _ = self.changes.send(ValueChange::new(source, value));
    }
}

pub struct BluestCharacteristic {
    service_id: Uuid,
    inner: Characteristic,
    can_notify: bool,
    cache: Arc<ValueCache>,
    notifying: Arc<AtomicBool>,
    notify_task: Mutex<Option<CancellationToken>>,
}

impl BluestCharacteristic {
    /// Wraps `inner`, reading its properties and cached value once.
    pub async fn discover(service_id: Uuid, inner: Characteristic) -> SharedCharacteristic {
        let can_notify = match inner.properties().await {
            Ok(properties) => properties.notify || properties.indicate,
            Err(e) => {
                debug!("No properties for {}: {}", inner.uuid(), e);
                false
            }
        };
        let initial = inner.value().await.unwrap_or_default();
        let (changes, _) = broadcast::channel(VALUE_CHANNEL_CAPACITY);

        Arc::new(Self {
            service_id,
            inner,
            can_notify,
            cache: Arc::new(ValueCache {
                value: Mutex::new(initial),
                changes,
            }),
            notifying: Arc::new(AtomicBool::new(false)),
            notify_task: Mutex::new(None),
        })
    }

    /// Streams notifications into the cache until `token` is cancelled or the stream ends.
    async fn pump_notifications(
        inner: Characteristic,
        cache: Arc<ValueCache>,
        notifying: Arc<AtomicBool>,
        token: CancellationToken,
        subscribed: oneshot::Sender<Result<()>>,
    ) {
        let uuid = inner.uuid();
        let mut stream = match inner.notify().await {
            Ok(stream) => {
                notifying.store(true, Ordering::SeqCst);
                let _ = subscribed.send(Ok(()));
                stream
            }
            Err(e) => {
                let _ = subscribed.send(Err(anyhow!("Failed to subscribe to {}: {}", uuid, e)));
                return;
            }
        };
        info!("Listening for notifications on {}", uuid);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                item = stream.next() => match item {
                    Some(Ok(value)) => cache.publish(ValueSource::Notify, value),
                    Some(Err(e)) => {
                        error!("Error in notification stream of {}: {}", uuid, e);
                        break;
                    }
                    None => break,
                },
            }
        }

        notifying.store(false, Ordering::SeqCst);
        info!("Notification stream of {} ended", uuid);
    }
}

#[async_trait::async_trait]
impl CharacteristicHandle for BluestCharacteristic {
    fn id(&self) -> Uuid {
        self.inner.uuid()
    }

    fn service_id(&self) -> Uuid {
        self.service_id
    }

    fn value(&self) -> Vec<u8> {
        lock(&self.cache.value).clone()
    }

    fn can_notify(&self) -> bool {
        self.can_notify
    }

    fn is_notifying(&self) -> bool {
        self.notifying.load(Ordering::SeqCst)
    }

    fn value_changes(&self) -> broadcast::Receiver<ValueChange> {
        self.cache.changes.subscribe()
    }

    async fn read(&self) -> Result<Vec<u8>> {
        let value = self.inner.read().await?;
        self.cache.publish(ValueSource::Read, value.clone());
        Ok(value)
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        self.inner.write(data).await?;
        self.cache.publish(ValueSource::Write, data.to_vec());
        Ok(())
    }

    async fn start_notifications(&self) -> Result<()> {
        if !self.can_notify {
            return Err(anyhow!("Characteristic {} does not support notifications", self.id()));
        }

        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.notify_task).replace(token.clone()) {
            previous.cancel();
        }

        let (subscribed_tx, subscribed_rx) = oneshot::channel();
        tokio::spawn(Self::pump_notifications(
            self.inner.clone(),
            self.cache.clone(),
            self.notifying.clone(),
            token,
            subscribed_tx,
        ));

        subscribed_rx
            .await
            .map_err(|_| anyhow!("Notification task for {} ended early", self.id()))?
    }

    async fn stop_notifications(&self) -> Result<()> {
        if let Some(token) = lock(&self.notify_task).take() {
            token.cancel();
        }
        self.notifying.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for BluestCharacteristic {
    fn drop(&mut self) {
        if let Some(token) = lock(&self.notify_task).take() {
            token.cancel();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
