//! Namespaced TTL + LRU cache for expensive intermediate results
//!
//! Each namespace is an [`LruCache`] with its own TTL; all namespaces share
//! one `max_entries` bound. Expiry is checked on read: an expired entry is a
//! miss and is removed, but until then it may still occupy a slot. Writes
//! into a full namespace first drop expired entries, then evict the least
//! recently accessed one.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;

/// Well-known namespace names
pub mod namespaces {
    pub const CONTEXT: &str = "context";
    pub const WEB_SEARCH: &str = "webSearch";
    pub const GENERATED_ARTIFACT: &str = "generatedArtifact";
}

pub const DEFAULT_MAX_ENTRIES: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub access_count: u64,
    pub last_access_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.inserted_at) < ttl
    }
}

type Namespace<V> = LruCache<String, CacheEntry<V>>;

/// Pop every expired entry of one namespace, returning how many went
fn drop_expired<V>(entries: &mut Namespace<V>, ttl: Duration, now: Instant) -> usize {
    let expired: Vec<String> = entries
        .iter()
        .filter(|(_, entry)| !entry.is_fresh(ttl, now))
        .map(|(key, _)| key.clone())
        .collect();
    for key in &expired {
        entries.pop(key);
    }
    expired.len()
}

/// Aggregate cache counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub namespaces: BTreeMap<String, usize>,
    pub total_entries: usize,
}

#[derive(Debug)]
pub struct CacheLayer<V> {
    max_entries: usize,
    default_ttl: Duration,
    ttls: HashMap<String, Duration>,
    namespaces: Mutex<HashMap<String, Namespace<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> Default for CacheLayer<V> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TTL)
    }
}

impl<V: Clone> CacheLayer<V> {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            max_entries: max_entries.max(1),
            default_ttl,
            ttls: HashMap::new(),
            namespaces: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Give `namespace` its own TTL
    pub fn with_namespace(mut self, namespace: impl Into<String>, ttl: Duration) -> Self {
        self.ttls.insert(namespace.into(), ttl);
        self
    }

    pub fn ttl(&self, namespace: &str) -> Duration {
        self.ttls.get(namespace).copied().unwrap_or(self.default_ttl)
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<V> {
        let ttl = self.ttl(namespace);
        let now = Instant::now();
        let mut namespaces = self.namespaces.lock();

        let value = namespaces.get_mut(namespace).and_then(|entries| {
            match entries.peek(key).map(|entry| entry.is_fresh(ttl, now)) {
                // `get_mut` promotes the entry to most recently used
                Some(true) => entries.get_mut(key).map(|entry| {
                    entry.access_count += 1;
                    entry.last_access_at = now;
                    entry.value.clone()
                }),
                Some(false) => {
                    entries.pop(key);
                    None
                }
                None => None,
            }
        });

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(namespace, key, "cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(namespace, key, "cache miss");
        }
        value
    }

    pub fn set(&self, namespace: &str, key: impl Into<String>, value: V) {
        let key = key.into();
        let ttl = self.ttl(namespace);
        let now = Instant::now();
        let mut namespaces = self.namespaces.lock();
        let entries = namespaces
            .entry(namespace.to_string())
            .or_insert_with(LruCache::unbounded);

        if !entries.contains(&key) && entries.len() >= self.max_entries {
            drop_expired(entries, ttl, now);

            if entries.len() >= self.max_entries {
                if let Some((evicted, _)) = entries.pop_lru() {
                    tracing::debug!(
                        namespace,
                        key = %evicted,
                        "evicting least recently used entry"
                    );
                }
            }
        }

        entries.put(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                access_count: 0,
                last_access_at: now,
            },
        );
    }

    /// Remove one entry; returns whether it was present
    pub fn clear(&self, namespace: &str, key: &str) -> bool {
        self.namespaces
            .lock()
            .get_mut(namespace)
            .is_some_and(|entries| entries.pop(key).is_some())
    }

    pub fn clear_namespace(&self, namespace: &str) {
        self.namespaces.lock().remove(namespace);
    }

    pub fn clear_all(&self) {
        self.namespaces.lock().clear();
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        let mut namespaces = self.namespaces.lock();
        for (namespace, entries) in namespaces.iter_mut() {
            removed += drop_expired(entries, self.ttl(namespace), now);
        }
        removed
    }

    /// Physically stored entries in `namespace`, expired ones included
    pub fn len(&self, namespace: &str) -> usize {
        self.namespaces.lock().get(namespace).map_or(0, LruCache::len)
    }

    pub fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace) == 0
    }

    /// Copy of an entry's bookkeeping, without counting as an access
    pub fn entry(&self, namespace: &str, key: &str) -> Option<CacheEntry<V>> {
        self.namespaces
            .lock()
            .get(namespace)
            .and_then(|entries| entries.peek(key).cloned())
    }

    pub fn metrics(&self) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let namespaces: BTreeMap<String, usize> = self
            .namespaces
            .lock()
            .iter()
            .map(|(name, entries)| (name.clone(), entries.len()))
            .collect();

        CacheMetrics {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            total_entries: namespaces.values().sum(),
            namespaces,
        }
    }
}

/// Backing data loaded on first access and kept for the owner's lifetime
#[derive(Debug)]
pub struct LazyDataset<T> {
    cell: OnceCell<Arc<T>>,
}

impl<T> Default for LazyDataset<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LazyDataset<T> {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    /// Return the dataset, running `loader` only if nothing is loaded yet
    ///
    /// Concurrent first callers wait for a single load. A failed load leaves
    /// the dataset empty so the next call retries.
    pub async fn get_or_load<F, Fut, E>(&self, loader: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let data = self
            .cell
            .get_or_try_init(|| async { loader().await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(data))
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.cell.get().cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }
}
