//! Page caching: in-memory TTL store for fetched page bodies.
//!
//! ## FIFO eviction
//!
//! When a new key would push the cache past `capacity`, the oldest-inserted
//! entry is evicted. Reads do not refresh an entry's position; overwriting a
//! key re-inserts it as the newest entry.
//!
//! Expired entries are dropped lazily on access, or in bulk by
//! [`PageCache::purge_expired`] (see [`spawn_sweeper`]).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Cache entry with metadata.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    /// When the entry was stored.
    stored_at: Instant,
    /// Insertion sequence number, the key into `order`.
    seq: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order: seq → key. The first entry is the oldest.
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl CacheState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// Bounded TTL cache keyed by URL.
///
/// Shared between concurrent fetches behind an `Arc`; the lock is held only
/// for map updates, never across an await point.
#[derive(Debug)]
pub struct PageCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    capacity: usize,
}

impl PageCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            ttl,
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // A panic while holding the lock cannot leave the maps half-updated
        // in a way that breaks lookups, so keep serving after poisoning.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        self.ttl.is_zero() || now.saturating_duration_since(entry.stored_at) > self.ttl
    }

    /// Get the cached body for `key` if it exists and is fresh.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut state = self.lock();
        match state.entries.get(key) {
            None => return None,
            Some(entry) if !self.is_expired(entry, now) => return Some(entry.value.clone()),
            Some(_) => {}
        }
        state.remove(key);
        tracing::trace!("dropped expired cache entry: {key}");
        None
    }

    /// Store `value` under `key`, evicting the oldest entry when full.
    pub fn put(&self, key: &str, value: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut state = self.lock();
        state.remove(key);
        while state.entries.len() >= self.capacity {
            match state.evict_oldest() {
                Some(evicted) => tracing::debug!("evicting oldest cache entry: {evicted}"),
                None => break,
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, key.to_string());
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.into(),
                stored_at: Instant::now(),
                seq,
            },
        );
    }

    /// Invalidate (remove) a cached entry.
    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }

    /// Remove all expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    /// Number of stored entries (including expired ones not yet purged).
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Spawn a background task that purges expired entries every `every`
/// until `shutdown` is notified.
pub fn spawn_sweeper(
    cache: Arc<PageCache>,
    every: Duration,
    shutdown: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!("cache sweeper started: every={}s", every.as_secs_f64());
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    tracing::debug!("cache sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = cache.purge_expired();
                    if removed > 0 {
                        tracing::info!("cache sweeper removed {removed} expired page(s)");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get() {
        let cache = PageCache::new(Duration::from_secs(60), 10);
        cache.put("key1", "value1");
        assert_eq!(cache.get("key1").as_deref(), Some("value1"));
        assert!(cache.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_value() {
        let cache = PageCache::new(Duration::from_secs(60), 10);
        cache.put("key1", "value1");
        cache.put("key1", "value2");
        assert_eq!(cache.get("key1").as_deref(), Some("value2"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_fifo_eviction_keeps_newest() {
        let cache = PageCache::new(Duration::from_secs(60), 3);
        cache.put("a", "1");
        cache.put("b", "2");
        cache.put("c", "3");

        // Reading "a" must not save it: this is FIFO, not LRU.
        assert!(cache.get("a").is_some());

        cache.put("d", "4");
        assert_eq!(cache.len(), 3);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
    }

    #[tokio::test]
    async fn test_overwrite_moves_key_to_newest() {
        let cache = PageCache::new(Duration::from_secs(60), 2);
        cache.put("a", "1");
        cache.put("b", "2");
        cache.put("a", "1b");
        cache.put("c", "3");
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").as_deref(), Some("1b"));
        assert!(cache.get("c").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = PageCache::new(Duration::from_secs(300), 10);
        cache.put("key1", "value1");

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(cache.get("key1").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("key1").is_none());
        // Lazily purged on access.
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_zero_ttl_never_returns() {
        let cache = PageCache::new(Duration::ZERO, 10);
        cache.put("key1", "value1");
        assert!(cache.get("key1").is_none());
    }

    #[tokio::test]
    async fn test_zero_capacity_stores_nothing() {
        let cache = PageCache::new(Duration::from_secs(60), 0);
        cache.put("key1", "value1");
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = PageCache::new(Duration::from_secs(10), 10);
        cache.put("old", "x");
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.put("new", "y");
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("new").is_some());
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = PageCache::new(Duration::from_secs(60), 10);
        cache.put("a", "1");
        cache.put("b", "2");
        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get("b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_until_shutdown() {
        let cache = Arc::new(PageCache::new(Duration::from_secs(1), 10));
        let shutdown = Arc::new(Notify::new());
        cache.put("a", "1");

        let handle = spawn_sweeper(Arc::clone(&cache), Duration::from_secs(5), Arc::clone(&shutdown));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.len(), 0);

        shutdown.notify_one();
        handle.await.unwrap();
    }
}
