//! Deduplication cache
//!
//! Short-TTL cache keyed by request fingerprint. Pages routinely fire the same
//! pixel several times in a burst; the cache short-circuits those repeats so they
//! never reach the worker pool.
//!
//! Values are stored behind an `Arc` so a hit hands back the very same allocation
//! the first classification produced.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::hash::Hash64;

/// Default time-to-live for cached classifications.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(5);
/// Default maximum number of cached fingerprints.
pub const DEFAULT_DEDUP_CAPACITY: usize = 1_000;

/// Counters exposed for dashboards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub entries: usize,
    /// Lookups served from the cache
    pub duplicates: u64,
    pub misses: u64,
    /// Entries dropped because the cache was full
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
}

impl DedupStats {
    /// Fraction of lookups that were duplicates.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.duplicates + self.misses;
        if total == 0 {
            0.0
        } else {
            self.duplicates as f64 / total as f64
        }
    }
}

struct CacheEntry<V> {
    value: Arc<V>,
    inserted_at: Instant,
}

/// Size-bounded TTL cache with oldest-first eviction.
pub struct DedupCache<V> {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<Hash64, CacheEntry<V>>,
    /// Insertion order; may hold stale keys that were overwritten or removed
    order: VecDeque<(Hash64, Instant)>,
    stats: DedupStats,
}

impl<V> Default for DedupCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL, DEFAULT_DEDUP_CAPACITY)
    }
}

impl<V> DedupCache<V> {
    /// Create a cache. A zero capacity is bumped to one.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ttl,
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            stats: DedupStats::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the cached value if it is still within its TTL.
    pub fn get(&mut self, fingerprint: Hash64) -> Option<Arc<V>> {
        self.get_at(fingerprint, Instant::now())
    }

    pub fn get_at(&mut self, fingerprint: Hash64, now: Instant) -> Option<Arc<V>> {
        let live = match self.entries.get(&fingerprint) {
            Some(entry) if self.is_live(entry.inserted_at, now) => Some(Arc::clone(&entry.value)),
            Some(_) => {
                self.entries.remove(&fingerprint);
                self.stats.expirations += 1;
                None
            }
            None => None,
        };

        match live {
            Some(value) => {
                self.stats.duplicates += 1;
                Some(value)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Store a value, expiring stale entries and evicting the oldest one if full.
    pub fn insert(&mut self, fingerprint: Hash64, value: Arc<V>) {
        self.insert_at(fingerprint, value, Instant::now());
    }

    pub fn insert_at(&mut self, fingerprint: Hash64, value: Arc<V>, now: Instant) {
        self.purge_expired(now);

        if !self.entries.contains_key(&fingerprint) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }

        self.entries.insert(
            fingerprint,
            CacheEntry {
                value,
                inserted_at: now,
            },
        );
        self.order.push_back((fingerprint, now));
    }

    /// Return the cached value, or compute, store and return a new one.
    pub fn get_or_compute<F>(&mut self, fingerprint: Hash64, compute: F) -> Arc<V>
    where
        F: FnOnce() -> V,
    {
        self.get_or_compute_at(fingerprint, Instant::now(), compute)
    }

    pub fn get_or_compute_at<F>(&mut self, fingerprint: Hash64, now: Instant, compute: F) -> Arc<V>
    where
        F: FnOnce() -> V,
    {
        if let Some(hit) = self.get_at(fingerprint, now) {
            return hit;
        }
        let value = Arc::new(compute());
        self.insert_at(fingerprint, Arc::clone(&value), now);
        value
    }

    /// Drop every entry whose TTL has elapsed.
    pub fn purge_expired(&mut self, now: Instant) {
        while let Some(&(key, inserted_at)) = self.order.front() {
            if self.is_live(inserted_at, now) {
                break;
            }
            self.order.pop_front();
            let expired = self
                .entries
                .get(&key)
                .is_some_and(|entry| entry.inserted_at == inserted_at);
            if expired {
                self.entries.remove(&key);
                self.stats.expirations += 1;
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            entries: self.entries.len(),
            ..self.stats
        }
    }

    #[inline]
    fn is_live(&self, inserted_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(inserted_at) < self.ttl
    }

    fn evict_oldest(&mut self) {
        while let Some((key, inserted_at)) = self.order.pop_front() {
            let current = self
                .entries
                .get(&key)
                .is_some_and(|entry| entry.inserted_at == inserted_at);
            if current {
                self.entries.remove(&key);
                self.stats.evictions += 1;
                return;
            }
        }
    }
}
