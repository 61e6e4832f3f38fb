// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Coalescing loading cache with TTL and LRU bounds.
//!
//! [`Cache`] combines three behaviors that usually have to be assembled by
//! hand:
//!
//! - **Single-flight builds**: when multiple tasks request a missing key at
//!   the same time, one of them (the "leader") runs the build while the rest
//!   wait on the same in-flight cell and receive a clone of the outcome. The
//!   build runs at most once per miss.
//! - **Failure transparency**: a failed build is handed to every waiter but
//!   never stored, so the next request triggers a fresh build.
//! - **Bounded retention**: successful values are retained until their TTL
//!   lapses, subject to entry-count and byte bounds enforced by least
//!   recently used eviction. Eviction only ever sees settled values; an
//!   in-flight build cannot be evicted because it lives in a side table.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use coalesce::{Cache, CacheOptions};
//!
//! # async fn example() {
//! let cache: Cache<String, String, String> =
//!     Cache::new(CacheOptions::default(), |value| Some(value.len() as u64));
//!
//! let value = cache
//!     .get_or_build("key".to_string(), || async { Ok(Arc::new("expensive".to_string())) })
//!     .await
//!     .unwrap();
//! assert_eq!(*value, "expensive");
//! # }
//! ```
//!
//! # Time
//!
//! TTL bookkeeping uses [`tokio::time::Instant`], so tests can drive
//! expiration with tokio's paused clock.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_once_cell::OnceCell;
use dashmap::{
    DashMap,
    Entry::{Occupied, Vacant},
};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Retention bounds for a [`Cache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    /// How long a stored value stays fresh.
    pub ttl: Duration,

    /// Maximum number of stored values; `0` disables storage entirely while
    /// keeping single-flight coalescing.
    pub max_entries: usize,

    /// Maximum total cost (as reported by the weigher) of stored values.
    pub max_bytes: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            max_entries: 10_000,
            max_bytes: 256 * 1024 * 1024,
        }
    }
}

type Weigher<V> = Arc<dyn Fn(&V) -> Option<u64> + Send + Sync>;
type FlightCell<V, E> = OnceCell<Result<Arc<V>, E>>;

/// A coalescing loading cache.
///
/// `K` is the lookup key, `V` the stored value, and `E` the build error
/// type. Errors must be `Clone` because one build outcome is distributed to
/// every coalesced waiter.
pub struct Cache<K, V, E> {
    options: CacheOptions,
    weigh: Weigher<V>,
    store: Mutex<Store<K, V>>,
    in_flight: DashMap<K, Weak<FlightCell<V, E>>>,
}

impl<K, V, E> Debug for Cache<K, V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("options", &self.options)
            .field("len", &self.store.lock().entries.len())
            .finish_non_exhaustive()
    }
}

struct Store<K, V> {
    entries: HashMap<K, Slot<V>>,
    recency: BTreeMap<u64, K>,
    next_seq: u64,
    total_cost: u64,
}

struct Slot<V> {
    value: Arc<V>,
    cost: u64,
    expires_at: Instant,
    seq: u64,
}

impl<K, V, E> Cache<K, V, E>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Send + Sync,
    E: Clone + Send + Sync,
{
    /// Creates a cache with the given bounds and weigher.
    ///
    /// The weigher reports the retention cost of a built value, or `None`
    /// to hand the value to callers without storing it.
    pub fn new<W>(options: CacheOptions, weigh: W) -> Self
    where
        W: Fn(&V) -> Option<u64> + Send + Sync + 'static,
    {
        Self {
            options,
            weigh: Arc::new(weigh),
            store: Mutex::new(Store {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_seq: 0,
                total_cost: 0,
            }),
            in_flight: DashMap::new(),
        }
    }

    /// Looks up a fresh value, updating its recency.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut store = self.store.lock();
        let now = Instant::now();

        let expired = store.entries.get(key).is_some_and(|slot| slot.expires_at <= now);
        if expired {
            store.remove(key);
            return None;
        }

        let next_seq = store.next_seq;
        store.next_seq += 1;

        let Some(slot) = store.entries.get_mut(key) else {
            return None;
        };

        let old_seq = std::mem::replace(&mut slot.seq, next_seq);
        let value = Arc::clone(&slot.value);
        let _ = store.recency.remove(&old_seq);
        let _ = store.recency.insert(next_seq, key.clone());
        Some(value)
    }

    /// Returns the cached value or builds it, coalescing concurrent builds
    /// of the same key into a single execution.
    pub async fn get_or_build<F, Fut>(&self, key: K, build: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Arc<V>, E>> + Send,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let cell = self.flight_cell(&key);
        let result = cell
            .get_or_init(async {
                let outcome = build().await;
                if let Ok(value) = &outcome {
                    // Only the leader reaches this point, so the value is
                    // stored exactly once per flight.
                    self.store_value(key.clone(), Arc::clone(value));
                }

                outcome
            })
            .await
            .clone();

        // Drop the in-flight entry once the flight has settled.
        self.in_flight.remove_if(&key, |_, weak| weak.upgrade().is_none());

        result
    }

    /// Stores a value directly, bypassing single-flight.
    pub fn insert(&self, key: K, value: Arc<V>) {
        self.store_value(key, value);
    }

    /// Removes a stored value.
    pub fn invalidate(&self, key: &K) {
        self.store.lock().remove(key);
    }

    /// Number of stored values, counting expired entries not yet collected.
    pub fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    /// Whether the store holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every stored value. In-flight builds are unaffected.
    pub fn clear(&self) {
        let mut store = self.store.lock();
        store.entries.clear();
        store.recency.clear();
        store.total_cost = 0;
    }

    fn flight_cell(&self, key: &K) -> Arc<FlightCell<V, E>> {
        if let Some(entry) = self.in_flight.get(key)
            && let Some(cell) = entry.value().upgrade()
        {
            return cell;
        }

        let cell = Arc::new(OnceCell::new());
        let weak = Arc::downgrade(&cell);

        match self.in_flight.entry(key.clone()) {
            Occupied(mut entry) => {
                if let Some(existing) = entry.get().upgrade() {
                    return existing;
                }

                let _ = entry.insert(weak);
            }
            Vacant(entry) => {
                let _ = entry.insert(weak);
            }
        }

        cell
    }

    fn store_value(&self, key: K, value: Arc<V>) {
        if self.options.max_entries == 0 {
            return;
        }

        let Some(cost) = (self.weigh)(&value) else {
            return;
        };

        let mut store = self.store.lock();
        store.remove(&key);

        // Evict stale-first is unnecessary: LRU order already favors keys
        // nobody has touched recently, expired ones included.
        while !store.entries.is_empty()
            && (store.entries.len() >= self.options.max_entries
                || store.total_cost + cost > self.options.max_bytes)
        {
            store.evict_lru();
        }

        let seq = store.next_seq;
        store.next_seq += 1;
        let _ = store.recency.insert(seq, key.clone());
        store.total_cost += cost;
        let _ = store.entries.insert(
            key,
            Slot {
                value,
                cost,
                expires_at: Instant::now() + self.options.ttl,
                seq,
            },
        );
    }
}

impl<K, V> Store<K, V>
where
    K: Hash + Eq,
{
    fn remove(&mut self, key: &K) {
        if let Some(slot) = self.entries.remove(key) {
            let _ = self.recency.remove(&slot.seq);
            self.total_cost -= slot.cost;
        }
    }

    fn evict_lru(&mut self) {
        let Some((&seq, _)) = self.recency.iter().next() else {
            return;
        };

        if let Some(key) = self.recency.remove(&seq)
            && let Some(slot) = self.entries.remove(&key)
        {
            self.total_cost -= slot.cost;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    type TestCache = Cache<String, String, String>;

    fn cache_with(options: CacheOptions) -> TestCache {
        Cache::new(options, |value: &String| Some(value.len() as u64))
    }

    #[tokio::test]
    async fn build_then_hit() {
        let cache = cache_with(CacheOptions::default());

        let built = cache
            .get_or_build("k".to_string(), || async { Ok(Arc::new("v".to_string())) })
            .await
            .expect("build");
        assert_eq!(*built, "v");

        let hit = cache.get(&"k".to_string()).expect("hit");
        assert!(Arc::ptr_eq(&built, &hit));
    }

    #[tokio::test]
    async fn concurrent_builds_coalesce() {
        let cache = Arc::new(cache_with(CacheOptions::default()));
        let builds = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let builds = Arc::clone(&builds);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_build("k".to_string(), || async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Arc::new("shared".to_string()))
                    })
                    .await
            }));
        }

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.expect("join").expect("build"));
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        for value in &values[1..] {
            assert!(Arc::ptr_eq(&values[0], value));
        }
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = cache_with(CacheOptions::default());
        let builds = AtomicU32::new(0);

        let first = cache
            .get_or_build("k".to_string(), || async {
                builds.fetch_add(1, Ordering::SeqCst);
                Err::<Arc<String>, _>("boom".to_string())
            })
            .await;
        assert_eq!(first.unwrap_err(), "boom");

        let second = cache
            .get_or_build("k".to_string(), || async {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new("recovered".to_string()))
            })
            .await
            .expect("second build");

        assert_eq!(*second, "recovered");
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_entries() {
        let cache = cache_with(CacheOptions {
            ttl: Duration::from_secs(10),
            ..CacheOptions::default()
        });
        cache.insert("k".to_string(), Arc::new("v".to_string()));

        assert!(cache.get(&"k".to_string()).is_some());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get(&"k".to_string()).is_none());
    }

    #[tokio::test]
    async fn lru_evicts_cold_entries_first() {
        let cache = cache_with(CacheOptions {
            max_entries: 2,
            ..CacheOptions::default()
        });

        cache.insert("a".to_string(), Arc::new("1".to_string()));
        cache.insert("b".to_string(), Arc::new("2".to_string()));
        let _ = cache.get(&"a".to_string());
        cache.insert("c".to_string(), Arc::new("3".to_string()));

        assert!(cache.get(&"a".to_string()).is_some(), "recently used survives");
        assert!(cache.get(&"b".to_string()).is_none(), "cold entry evicted");
        assert!(cache.get(&"c".to_string()).is_some());
    }

    #[tokio::test]
    async fn byte_bound_evicts() {
        let cache = cache_with(CacheOptions {
            max_bytes: 8,
            ..CacheOptions::default()
        });

        cache.insert("a".to_string(), Arc::new("12345".to_string()));
        cache.insert("b".to_string(), Arc::new("67890".to_string()));

        assert!(cache.get(&"a".to_string()).is_none());
        assert!(cache.get(&"b".to_string()).is_some());
    }

    #[tokio::test]
    async fn zero_capacity_coalesces_without_storing() {
        let cache = Arc::new(cache_with(CacheOptions {
            max_entries: 0,
            ..CacheOptions::default()
        }));

        let built = cache
            .get_or_build("k".to_string(), || async { Ok(Arc::new("v".to_string())) })
            .await
            .expect("build");
        assert_eq!(*built, "v");
        assert!(cache.is_empty());
        assert!(cache.get(&"k".to_string()).is_none());
    }

    #[tokio::test]
    async fn weigher_veto_skips_storage() {
        let cache: TestCache = Cache::new(CacheOptions::default(), |value: &String| {
            (!value.starts_with("skip")).then(|| value.len() as u64)
        });

        let _ = cache
            .get_or_build("k".to_string(), || async { Ok(Arc::new("skip me".to_string())) })
            .await;
        assert!(cache.get(&"k".to_string()).is_none());
    }

    #[tokio::test]
    async fn invalidate_forces_rebuild() {
        let cache = cache_with(CacheOptions::default());
        cache.insert("k".to_string(), Arc::new("v".to_string()));
        cache.invalidate(&"k".to_string());
        assert!(cache.get(&"k".to_string()).is_none());
    }
}
