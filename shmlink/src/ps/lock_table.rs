//! Sharded per-key lock table.
//!
//! Each key gets its own `Arc<Mutex<T>>`, created on first use. The map from
//! key to lock is split over shards so looking up one tag never contends with
//! an unrelated tag's lookup.

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

const DEFAULT_SHARDS: usize = 16;

/// Lazily populated map of per-key mutexes.
pub struct LockTable<T = ()> {
    shards: Vec<Mutex<HashMap<String, Arc<Mutex<T>>>>>,
}

impl<T: Default> LockTable<T> {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Arc<Mutex<T>>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Lock for `key`, created with `T::default()` if absent.
    pub fn entry(&self, key: &str) -> Arc<Mutex<T>> {
        let mut shard = self.shard(key).lock();
        Arc::clone(shard.entry(key.to_string()).or_default())
    }

    /// Lock for `key` if it was ever created.
    pub fn get(&self, key: &str) -> Option<Arc<Mutex<T>>> {
        self.shard(key).lock().get(key).cloned()
    }

    /// Number of keys with a lock.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Default> Default for LockTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
