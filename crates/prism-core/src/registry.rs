//! Named, insertion-ordered registries of shared resources.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

struct Slot<V> {
    /// Monotonic insertion stamp, used to keep enumeration in insertion order.
    order: u64,
    value: Arc<V>,
}

struct Inner<K, V> {
    entries: HashMap<K, Slot<V>>,
    next_order: u64,
}

/// Insertion-ordered map from a stable name to a shared value.
///
/// Writers take the lock exclusively, lookups and enumeration share it, so a
/// reader never observes a half-finished insert. Enumeration returns a
/// snapshot; values stay alive through their `Arc` even if they are removed
/// from the registry afterwards.
pub struct Registry<K, V> {
    inner: RwLock<Inner<K, V>>,
}

impl<K, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                next_order: 0,
            }),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under `key` if the key is not present yet.
    ///
    /// Returns `false` and leaves the registry untouched if the key exists.
    pub fn insert(&self, key: K, value: impl Into<Arc<V>>) -> bool {
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&key) {
            return false;
        }
        let order = inner.next_order;
        inner.next_order += 1;
        inner.entries.insert(
            key,
            Slot {
                order,
                value: value.into(),
            },
        );
        true
    }

    /// Replace the value of an existing key.
    ///
    /// Returns `false` if the key is missing. The entry keeps its position.
    pub fn update<Q>(&self, key: &Q, value: impl Into<Arc<V>>) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut inner = self.inner.write();
        match inner.entries.get_mut(key) {
            Some(slot) => {
                slot.value = value.into();
                true
            }
            None => false,
        }
    }

    /// Look up a value by key.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.read().entries.get(key).map(|slot| slot.value.clone())
    }

    /// Check whether a key is present.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.read().entries.contains_key(key)
    }

    /// Remove an entry, returning its value.
    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.write().entries.remove(key).map(|slot| slot.value)
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.inner.write().entries.clear();
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Snapshot of all keys in insertion order.
    pub fn keys(&self) -> Vec<K> {
        self.entries().into_iter().map(|(key, _)| key).collect()
    }

    /// Snapshot of all values in insertion order.
    pub fn values(&self) -> Vec<Arc<V>> {
        self.entries().into_iter().map(|(_, value)| value).collect()
    }

    /// Snapshot of all entries in insertion order.
    pub fn entries(&self) -> Vec<(K, Arc<V>)> {
        let inner = self.inner.read();
        let mut entries: Vec<_> = inner
            .entries
            .iter()
            .map(|(key, slot)| (slot.order, key.clone(), slot.value.clone()))
            .collect();
        drop(inner);

        entries.sort_unstable_by_key(|(order, _, _)| *order);
        entries
            .into_iter()
            .map(|(_, key, value)| (key, value))
            .collect()
    }

    /// Remove every entry and hand them back in insertion order.
    ///
    /// Used at shutdown to release GPU resources in a deterministic order.
    pub fn drain(&self) -> Vec<(K, Arc<V>)> {
        let mut inner = self.inner.write();
        let mut entries: Vec<_> = inner
            .entries
            .drain()
            .map(|(key, slot)| (slot.order, key, slot.value))
            .collect();
        drop(inner);

        entries.sort_unstable_by_key(|(order, _, _)| *order);
        entries
            .into_iter()
            .map(|(_, key, value)| (key, value))
            .collect()
    }
}
