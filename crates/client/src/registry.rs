use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A mutex-guarded keyed table.
///
/// Entries are always removed before they are used, so a callback stored
/// here runs at most once and never while the lock is held.
pub(crate) struct Registry<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash, V> Registry<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, key: K, value: V) -> Option<V> {
        lock(&self.entries).insert(key, value)
    }

    pub(crate) fn take(&self, key: &K) -> Option<V> {
        lock(&self.entries).remove(key)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &K) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Empties the table and hands back what it held.
    pub(crate) fn drain(&self) -> Vec<(K, V)> {
        lock(&self.entries).drain().collect()
    }
}
