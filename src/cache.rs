use bytes::Bytes;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Cache key for served configuration files
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub repository: String,
    pub path: String,
    /// Snapshot revision the content was rendered from
    pub revision: u64,
}

/// Cached, already detokenized, file content
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub content: Bytes,
    pub created_at: Instant,
}

impl CacheEntry {
    pub fn new(content: Bytes) -> Self {
        Self {
            content,
            created_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// TTL cache in front of detokenization
pub struct ContentCache {
    cache: DashMap<CacheKey, CacheEntry>,
    ttl: Duration,
    max_size: usize,
}

impl ContentCache {
    pub fn new(ttl_secs: u64, max_size: usize) -> Self {
        Self {
            cache: DashMap::new(),
            ttl: Duration::from_secs(ttl_secs),
            max_size,
        }
    }

    /// Get cached content if it exists and is not expired
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let entry = self.cache.get(key)?;
        if entry.is_expired(self.ttl) {
            drop(entry);
            self.cache.remove(key);
            None
        } else {
            Some(entry.content.clone())
        }
    }

    /// Insert rendered content into the cache
    pub fn insert(&self, key: CacheKey, content: Bytes) {
        if self.max_size == 0 {
            return;
        }

        if self.cache.len() >= self.max_size {
            self.evict_expired();
        }

        // Still full: drop roughly a tenth of the entries
        if self.cache.len() >= self.max_size {
            let keys_to_remove: Vec<_> = self
                .cache
                .iter()
                .take((self.max_size / 10).max(1))
                .map(|r| r.key().clone())
                .collect();
            for k in keys_to_remove {
                self.cache.remove(&k);
            }
        }

        self.cache.insert(key, CacheEntry::new(content));
    }

    /// Remove expired entries from the cache
    pub fn evict_expired(&self) {
        self.cache.retain(|_, entry| !entry.is_expired(self.ttl));
    }

    /// Drop every entry of a repository, used after a new snapshot lands
    pub fn invalidate_repository(&self, repository: &str) {
        self.cache.retain(|key, _| key.repository != repository);
    }

    /// Get current cache size
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
