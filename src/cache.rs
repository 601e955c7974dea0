//! In-memory TTL cache for provider metadata and stream locations
//!
//! Entries expire after their TTL and are dropped lazily on access or by the
//! periodic sweeper. When the cache is full, inserting a new key evicts the
//! entry that was inserted first; reads do not refresh an entry's position.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;

/// Cache key for provider metadata of an item
pub fn metadata_key(provider: &str, item_id: &str) -> String {
    format!("metadata:{provider}:{item_id}")
}

/// Cache key for a resolved stream location of an item at a quality
pub fn stream_key(provider: &str, item_id: &str, quality: crate::types::Quality) -> String {
    format!("stream:{provider}:{item_id}:{quality}")
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    /// Insertion sequence number, key into `CacheState::order`
    seq: u64,
}

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Insertion order index: oldest sequence number first
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl<V> CacheState<V> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

/// Bounded TTL cache shared between concurrent downloads
///
/// Cloning is cheap; clones share the same entries.
#[derive(Debug)]
pub struct MetadataCache<V> {
    state: Arc<Mutex<CacheState<V>>>,
    max_entries: usize,
    default_ttl: Duration,
}

impl<V> Clone for MetadataCache<V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            max_entries: self.max_entries,
            default_ttl: self.default_ttl,
        }
    }
}

impl<V: Clone + Send + 'static> MetadataCache<V> {
    /// Create an empty cache
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            })),
            max_entries,
            default_ttl,
        }
    }

    /// Create an empty cache sized by configuration
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.ttl)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// TTL applied by [`set`](Self::set)
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a live entry; an expired entry is removed and reported absent
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.lock();
        match state.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                state.remove(key);
                tracing::trace!(key, "cache entry expired");
                None
            }
            None => None,
        }
    }

    /// Insert with the default TTL
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Insert with an explicit TTL
    ///
    /// Replacing an existing key refreshes its insertion time. A zero TTL or a
    /// zero-capacity cache stores nothing and drops any previous value.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let mut state = self.lock();

        state.remove(&key);
        if ttl.is_zero() || self.max_entries == 0 {
            return;
        }

        while state.entries.len() >= self.max_entries {
            match state.evict_oldest() {
                Some(evicted) => tracing::trace!(key = %evicted, "cache entry evicted"),
                None => break,
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl,
                seq,
            },
        );
    }

    /// Remove an entry, returning its value if it was still live
    pub fn remove(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.lock()
            .remove(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value)
    }

    /// Number of stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }

    /// Remove all expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        self.lock().purge_expired(Instant::now())
    }

    /// Return the cached value or fetch, cache and return it
    ///
    /// Failures are returned to the caller and never cached. The lock is not
    /// held while `fetch` runs, so two concurrent misses on the same key may
    /// both fetch; the later result wins.
    pub async fn get_or_try_insert_with<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(key) {
            tracing::trace!(key, "cache hit");
            return Ok(hit);
        }

        let value = fetch().await?;
        self.set_with_ttl(key, value.clone(), ttl);
        Ok(value)
    }

    /// Periodically purge expired entries until `cancel` fires
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, remaining = cache.len(), "cache sweep");
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::debug!("cache sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}
