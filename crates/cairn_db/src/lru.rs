//! Concurrent, count-bounded LRU for the table read cache.
//!
//! Recency is a clock stamp bumped on every hit; eviction is amortized —
//! inserts past the high-water mark trigger a sweep that drops the oldest
//! stamps until the cache is back at capacity. Readers and writers never
//! serialize on a shared list.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

struct Slot<T> {
    value: T,
    stamp: AtomicU64,
}

/// Entry-count-bounded concurrent LRU cache.
pub struct LruCache<K: Eq + Hash + Clone, T: Clone> {
    map: DashMap<K, Slot<T>>,
    capacity: usize,
    clock: AtomicU64,
    /// Single-flight guard for the eviction sweep.
    sweep: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K: Eq + Hash + Clone, T: Clone> LruCache<K, T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: DashMap::new(),
            capacity,
            clock: AtomicU64::new(0),
            sweep: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<T> {
        match self.map.get(key) {
            Some(slot) => {
                slot.stamp
                    .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: K, value: T) {
        if self.capacity == 0 {
            return;
        }
        let stamp = AtomicU64::new(self.clock.fetch_add(1, Ordering::Relaxed));
        self.map.insert(key, Slot { value, stamp });
        // Sweep once the overshoot is an eighth over capacity, so eviction
        // cost amortizes over many inserts.
        if self.map.len() > self.capacity + self.capacity / 8 + 1 {
            self.evict();
        }
    }

    pub fn remove(&self, key: &K) {
        self.map.remove(key);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn evict(&self) {
        // Another thread sweeping is good enough; don't pile up.
        let Some(_guard) = self.sweep.try_lock() else {
            return;
        };
        let over = self.map.len().saturating_sub(self.capacity);
        if over == 0 {
            return;
        }
        let mut stamped: Vec<(K, u64)> = self
            .map
            .iter()
            .map(|e| (e.key().clone(), e.value().stamp.load(Ordering::Relaxed)))
            .collect();
        stamped.sort_unstable_by_key(|&(_, s)| s);
        for (key, stamp) in stamped.into_iter().take(over) {
            // Skip entries touched since the scan.
            let fresh = self
                .map
                .get(&key)
                .map(|slot| slot.stamp.load(Ordering::Relaxed) != stamp)
                .unwrap_or(true);
            if !fresh {
                self.map.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Iterate current keys (unordered snapshot).
    pub fn keys(&self) -> Vec<K> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }
}
