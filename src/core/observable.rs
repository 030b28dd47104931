//! Observable properties and collections.
//! Observers subscribe explicitly; a change is published only when a value
//! actually changes. Writers are expected to run on the presentation thread.

use std::sync::{PoisonError, RwLock};

use tokio::sync::{broadcast, watch};

const COLLECTION_CHANGE_CAPACITY: usize = 256;

/// A single observable value.
pub struct Property<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + PartialEq> Property<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Stores `value`, notifying observers if it differs from the current one.
    /// Returns whether a notification was published.
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current != value {
                *current = value;
                true
            } else {
                false
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone + PartialEq + Default> Default for Property<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// A discrete edit made to an [`ObservableCollection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionChange {
    Added { index: usize },
    Removed { index: usize },
    Reset,
}

/// An ordered collection that publishes every edit.
pub struct ObservableCollection<T> {
    items: RwLock<Vec<T>>,
    changes: broadcast::Sender<CollectionChange>,
}

impl<T: Clone> ObservableCollection<T> {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(COLLECTION_CHANGE_CAPACITY);
        Self {
            items: RwLock::new(Vec::new()),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectionChange> {
        self.changes.subscribe()
    }

    pub fn push(&self, item: T) {
        let index = {
            let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
            items.push(item);
            items.len() - 1
        };
        self.publish(CollectionChange::Added { index });
    }

    pub fn remove_at(&self, index: usize) -> Option<T> {
        let removed = {
            let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
            (index < items.len()).then(|| items.remove(index))
        };
        if removed.is_some() {
            self.publish(CollectionChange::Removed { index });
        }
        removed
    }

    pub fn clear(&self) {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.publish(CollectionChange::Reset);
    }

    pub fn position<P>(&self, predicate: P) -> Option<usize>
    where
        P: FnMut(&T) -> bool,
    {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .position(predicate)
    }

    pub fn find<P>(&self, mut predicate: P) -> Option<T>
    where
        P: FnMut(&T) -> bool,
    {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|item| predicate(item))
            .cloned()
    }

    /// Copies the current items.
    pub fn snapshot(&self) -> Vec<T> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, change: CollectionChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}

impl<T: Clone> Default for ObservableCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_publishes_only_real_changes() {
        let property = Property::new(0u64);
        let mut rx = property.subscribe();

        assert!(!property.set(0));
        assert!(!rx.has_changed().unwrap());

        assert!(property.set(42));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 42);
        assert_eq!(property.get(), 42);
    }

    #[test]
    fn collection_reports_discrete_edits() {
        let collection = ObservableCollection::new();
        let mut rx = collection.subscribe();

        collection.push("a");
        collection.push("b");
        assert_eq!(collection.remove_at(0), Some("a"));
        assert_eq!(collection.remove_at(5), None);
        collection.clear();

        assert_eq!(rx.try_recv().unwrap(), CollectionChange::Added { index: 0 });
        assert_eq!(rx.try_recv().unwrap(), CollectionChange::Added { index: 1 });
        assert_eq!(rx.try_recv().unwrap(), CollectionChange::Removed { index: 0 });
        assert_eq!(rx.try_recv().unwrap(), CollectionChange::Reset);
        assert!(rx.try_recv().is_err());
        assert!(collection.is_empty());
    }
}
