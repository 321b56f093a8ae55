//! Response caching: templated keys with a fixed TTL per route.
//!
//! ## Eviction
//!
//! When the cache is full, expired entries go first; otherwise the
//! least-recently-accessed entry is evicted.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

/// Default maximum number of cached responses.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// TTLs per cached route.
pub mod ttl {
    use std::time::Duration;

    pub const PROFILE: Duration = Duration::from_secs(60 * 60);
    pub const STORY: Duration = Duration::from_secs(5 * 60);
    pub const HIGHLIGHT: Duration = Duration::from_secs(15 * 60);
    pub const POST: Duration = Duration::from_secs(60 * 60);
    pub const MEDIA: Duration = Duration::from_secs(30 * 60);
    pub const TIKTOK_POST: Duration = Duration::from_secs(30 * 60);
    pub const TIKTOK_USER: Duration = Duration::from_secs(30 * 60);
    pub const TIKTOK_POSTS: Duration = Duration::from_secs(5 * 60);
}

struct CacheEntry<V> {
    value: V,
    cached_at: Instant,
    ttl: Duration,
    last_accessed: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// In-memory TTL cache keyed by `<prefix>:<key>`.
pub struct ResponseCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    max_entries: usize,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    fn key(prefix: &str, key: &str) -> String {
        format!("{prefix}:{key}")
    }

    /// A fresh cached value, if any.
    pub fn get(&self, prefix: &str, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&Self::key(prefix, key))?;
        if entry.is_expired() {
            return None;
        }
        entry.last_accessed = Instant::now();
        Some(entry.value.clone())
    }

    pub fn insert(&self, prefix: &str, key: &str, value: V, ttl: Duration) {
        let full_key = Self::key(prefix, key);
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries && !entries.contains_key(&full_key) {
            evict(&mut entries);
        }
        let now = Instant::now();
        entries.insert(
            full_key,
            CacheEntry {
                value,
                cached_at: now,
                ttl,
                last_accessed: now,
            },
        );
    }

    /// Serve from cache or compute, caching only successes.
    pub async fn get_or_try_insert_with<F, Fut, E>(
        &self,
        prefix: &str,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(prefix, key) {
            tracing::debug!("cache hit for {prefix}:{key}");
            return Ok(value);
        }
        let value = compute().await?;
        self.insert(prefix, key, value.clone(), ttl);
        Ok(value)
    }

    pub fn invalidate(&self, prefix: &str, key: &str) {
        self.entries.lock().remove(&Self::key(prefix, key));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<V: Clone> Default for ResponseCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

fn evict<V>(entries: &mut HashMap<String, CacheEntry<V>>) {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired());
    if entries.len() < before {
        return;
    }

    if let Some(lru) = entries
        .iter()
        .min_by_key(|(_, entry)| entry.last_accessed)
        .map(|(key, _)| key.clone())
    {
        tracing::debug!("evicting LRU cache entry: {lru}");
        entries.remove(&lru);
    }
}
