/// `rustls` client session storage backed by [`SessionCache`].
pub mod store;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub use store::{ResumptionStore, ServerSessions};

/// Default number of entries kept by a client session cache.
pub const DEFAULT_CAPACITY: usize = 128;

/// Hooks called after cache operations. They observe, they cannot veto.
///
/// Hooks run after the cache lock is released, so an observer may call back
/// into the cache.
pub trait CacheObserver<K>: Send + Sync {
    fn on_put(&self, _key: &K) {}
    fn on_get(&self, _key: &K, _hit: bool) {}
    fn on_evict(&self, _key: &K) {}
}

/// Running counters kept by every cache.
#[derive(Debug, Default)]
struct CacheStats {
    puts: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of a cache's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStatsSnapshot {
    pub puts: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStatsSnapshot {
    /// Counter increase from `earlier` to `self`.
    pub fn since(&self, earlier: &CacheStatsSnapshot) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            puts: self.puts - earlier.puts,
            hits: self.hits - earlier.hits,
            misses: self.misses - earlier.misses,
            evictions: self.evictions - earlier.evictions,
        }
    }
}

impl std::ops::AddAssign for CacheStatsSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.puts += other.puts;
        self.hits += other.hits;
        self.misses += other.misses;
        self.evictions += other.evictions;
    }
}

struct Entry<V> {
    value: V,
    stamp: u64,
}

struct Lru<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Recency order: smallest stamp is least recently used.
    order: BTreeMap<u64, K>,
    clock: u64,
}

impl<K: Clone + Eq + Hash, V> Lru<K, V> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Move an existing entry to the most-recently-used position.
    fn touch(&mut self, key: &K) -> Option<&mut V> {
        let stamp = self.tick();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.stamp);
        entry.stamp = stamp;
        self.order.insert(stamp, key.clone());
        Some(&mut entry.value)
    }

    fn insert(&mut self, key: K, value: V) {
        let stamp = self.tick();
        if let Some(old) = self.entries.insert(key.clone(), Entry { value, stamp }) {
            self.order.remove(&old.stamp);
        }
        self.order.insert(stamp, key);
    }

    fn evict_over(&mut self, capacity: usize) -> Vec<K> {
        let mut evicted = Vec::new();
        while self.entries.len() > capacity {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&key);
            evicted.push(key);
        }
        evicted
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.stamp);
        Some(entry.value)
    }
}

/// Bounded least-recently-used map from session identity to saved session
/// state.
///
/// Internally synchronized; share it behind an [`Arc`]. Every `put` and
/// `get` updates [`CacheStatsSnapshot`] counters and the optional
/// [`CacheObserver`].
pub struct SessionCache<K, V> {
    capacity: usize,
    inner: Mutex<Lru<K, V>>,
    stats: CacheStats,
    observer: Option<Arc<dyn CacheObserver<K>>>,
}

impl<K, V> fmt::Debug for SessionCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCache")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats)
            .field("observed", &self.observer.is_some())
            .finish()
    }
}

impl<K: Clone + Eq + Hash, V> SessionCache<K, V> {
    /// Create a cache holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Lru {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                clock: 0,
            }),
            stats: CacheStats::default(),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CacheObserver<K>>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is present. Does not count as a `get` or refresh recency.
    pub fn contains(&self, key: &K) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            puts: self.stats.puts.load(Ordering::Relaxed),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    /// Insert or overwrite `key`, evicting the least recently used entry if
    /// the cache is full.
    pub fn put(&self, key: K, value: V) {
        let evicted = {
            let mut lru = self.lock();
            lru.insert(key.clone(), value);
            lru.evict_over(self.capacity)
        };
        self.record_put(&key, evicted);
    }

    /// Look up `key`, marking it most recently used on a hit.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.lookup(key, |value| Some(value.clone()))
    }

    /// Mutate the entry for `key` in place, creating it with `make` first if
    /// absent. Counts as a `put`.
    pub fn update<F>(&self, key: K, make: impl FnOnce() -> V, f: F)
    where
        F: FnOnce(&mut V),
    {
        let evicted = self.upsert(&key, make, f);
        self.record_put(&key, evicted);
    }

    /// Like [`SessionCache::update`] but invisible to counters and hooks.
    /// Used for bookkeeping that is not session state.
    pub fn update_untracked<F>(&self, key: K, make: impl FnOnce() -> V, f: F)
    where
        F: FnOnce(&mut V),
    {
        let evicted = self.upsert(&key, make, f);
        self.record_evictions(evicted);
    }

    /// Run `f` on the entry for `key`. Counts as a `get`, which hits only
    /// when the entry exists and `f` returns `Some`.
    pub fn lookup<R, F>(&self, key: &K, f: F) -> Option<R>
    where
        F: FnOnce(&mut V) -> Option<R>,
    {
        let found = {
            let mut lru = self.lock();
            lru.touch(key).and_then(f)
        };
        let hit = found.is_some();
        if hit {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(observer) = &self.observer {
            observer.on_get(key, hit);
        }
        found
    }

    /// Read the entry for `key` without counting a `get` or refreshing it.
    pub fn peek<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.lock().entries.get(key).map(|entry| f(&entry.value))
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().remove(key)
    }

    fn upsert(&self, key: &K, make: impl FnOnce() -> V, f: impl FnOnce(&mut V)) -> Vec<K> {
        let mut lru = self.lock();
        match lru.touch(key) {
            Some(value) => {
                f(value);
                Vec::new()
            }
            None => {
                let mut value = make();
                f(&mut value);
                lru.insert(key.clone(), value);
                lru.evict_over(self.capacity)
            }
        }
    }

    fn record_put(&self, key: &K, evicted: Vec<K>) {
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        if let Some(observer) = &self.observer {
            observer.on_put(key);
        }
        self.record_evictions(evicted);
    }

    fn record_evictions(&self, evicted: Vec<K>) {
        for key in evicted {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("session cache evicted least recently used entry");
            if let Some(observer) = &self.observer {
                observer.on_evict(&key);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lru<K, V>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
