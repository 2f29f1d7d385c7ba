//! Bounded TTL + LRU value cache
//!
//! [`TtlLruCache`] memoizes values under an explicit key type. Each entry may
//! carry an absolute expiry; expiry is only checked when the key is looked up
//! (no background sweeper). Once the number of entries exceeds the configured
//! maximum, the least-recently-used entry is evicted on insertion.
//!
//! Distinct call sites keep distinct caches (or distinct key types), so keys
//! from unrelated operations cannot collide.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Default capacity, matching the transport response cache
pub const DEFAULT_MAX_ENTRIES: usize = 256;

/// A cached value with its recency tick and optional expiry
struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
    tick: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Map plus recency index. `order` maps a monotonically increasing tick to its
/// key; the smallest tick is the least recently used entry.
struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    order: BTreeMap<u64, K>,
    next_tick: u64,
}

impl<K: Hash + Eq + Clone, V> Inner<K, V> {
    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn remove(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        Some(entry)
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
}

/// Thread-safe cache with LRU eviction and per-entry TTL
pub struct TtlLruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    max_entries: usize,
    stats: CacheStats,
}

/// Outcome of a cache probe
enum Probe<V> {
    Hit(V),
    Miss,
}

impl<K, V> TtlLruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a cache holding at most `max_entries` values
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_tick: 0,
            }),
            max_entries: max_entries.max(1),
            stats: CacheStats::default(),
        }
    }

    /// Return the cached value for `key`, computing and storing it on a miss.
    ///
    /// A hit moves the entry to the most-recently-used position. `ttl` of
    /// `None` stores the value without expiry.
    pub fn get_or_compute<F>(&self, key: K, ttl: Option<Duration>, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Probe::Hit(value) = self.probe(&key) {
            return value;
        }
        let started = Instant::now();
        let value = compute();
        self.insert_at(key, value.clone(), ttl.map(|t| started + t));
        value
    }

    /// Async, fallible variant of [`get_or_compute`](Self::get_or_compute).
    ///
    /// Errors are returned to the caller and never cached. The lock is not
    /// held while `compute` runs, so two concurrent misses on the same key
    /// may both compute; the later insert wins.
    pub async fn get_or_try_compute<F, Fut, E>(
        &self,
        key: K,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Probe::Hit(value) = self.probe(&key) {
            return Ok(value);
        }
        let started = Instant::now();
        let value = compute().await?;
        self.insert_at(key, value.clone(), ttl.map(|t| started + t));
        Ok(value)
    }

    /// Look up `key` without computing. Expired entries are dropped.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.probe(key) {
            Probe::Hit(value) => Some(value),
            Probe::Miss => None,
        }
    }

    /// Store `value` under `key`, replacing any previous entry
    pub fn insert(&self, key: K, value: V, ttl: Option<Duration>) {
        self.insert_at(key, value, ttl.map(|t| Instant::now() + t));
    }

    fn probe(&self, key: &K) -> Probe<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return Probe::Miss;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.remove(key);
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Probe::Miss;
        }

        let tick = inner.bump();
        let Some(entry) = inner.entries.get_mut(key) else {
            return Probe::Miss;
        };
        let old_tick = std::mem::replace(&mut entry.tick, tick);
        let value = entry.value.clone();
        inner.order.remove(&old_tick);
        inner.order.insert(tick, key.clone());

        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Probe::Hit(value)
    }

    fn insert_at(&self, key: K, value: V, expires_at: Option<Instant>) {
        let mut inner = self.inner.lock();
        inner.remove(&key);

        let tick = inner.bump();
        inner.order.insert(tick, key.clone());
        inner.entries.insert(
            key,
            Entry {
                value,
                expires_at,
                tick,
            },
        );

        while inner.entries.len() > self.max_entries {
            let Some((_, oldest)) = inner.order.pop_first() else {
                break;
            };
            inner.entries.remove(&oldest);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Keys from least to most recently used
    pub fn keys_by_recency(&self) -> Vec<K> {
        self.inner.lock().order.values().cloned().collect()
    }

    /// Number of stored entries (expired entries count until looked up)
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Snapshot of hit/miss counters
    pub fn stats(&self) -> CacheStatsSnapshot {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };
        CacheStatsSnapshot {
            hits,
            misses,
            expirations: self.stats.expirations.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.len(),
            hit_rate,
        }
    }
}

impl<K, V> Default for TtlLruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    /// Lookups served from cache
    pub hits: u64,
    /// Lookups that had to compute
    pub misses: u64,
    /// Entries dropped because their TTL had passed
    pub expirations: u64,
    /// Entries dropped to respect capacity
    pub evictions: u64,
    /// Current number of entries
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}
