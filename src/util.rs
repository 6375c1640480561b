//! Small shared utilities.

use std::collections::HashMap;
use std::sync::RwLock;

/// A string-keyed concurrent map.
///
/// Reads proceed in parallel, writes are exclusive. Iteration snapshots the
/// current keys and values under the read lock and invokes the callback with
/// the lock released, so callbacks are free to call back into the map.
#[derive(Debug)]
pub struct SyncMap<V> {
    inner: RwLock<HashMap<String, V>>,
}

impl<V> SyncMap<V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().expect("syncmap poisoned").contains_key(key)
    }

    /// Insert or replace, returning the previous value if any.
    pub fn insert(&self, key: impl Into<String>, value: V) -> Option<V> {
        self.inner
            .write()
            .expect("syncmap poisoned")
            .insert(key.into(), value)
    }

    /// Insert only if the key is absent. Returns false when the key was taken.
    pub fn try_insert(&self, key: impl Into<String>, value: V) -> bool {
        let mut map = self.inner.write().expect("syncmap poisoned");
        let key = key.into();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, value);
        true
    }

    /// Remove the entry, returning the owned value.
    ///
    /// At most one caller observes `Some` for a given insertion, which makes
    /// removal usable as a single-winner compare-and-set.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.inner.write().expect("syncmap poisoned").remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("syncmap poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.write().expect("syncmap poisoned").clear();
    }
}

impl<V: Clone> SyncMap<V> {
    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.read().expect("syncmap poisoned").get(key).cloned()
    }

    /// Iterate over a snapshot of the map. Returning false stops iteration.
    pub fn for_each(&self, mut callback: impl FnMut(&str, &V) -> bool) {
        let snapshot: Vec<(String, V)> = {
            let map = self.inner.read().expect("syncmap poisoned");
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for (key, value) in &snapshot {
            if !callback(key, value) {
                break;
            }
        }
    }

    /// All current values, in unspecified order.
    pub fn values(&self) -> Vec<V> {
        self.inner
            .read()
            .expect("syncmap poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl<V> Default for SyncMap<V> {
    fn default() -> Self {
        Self::new()
    }
}
