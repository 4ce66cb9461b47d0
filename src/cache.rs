//! Content-addressed artifact cache.
//!
//! Artifacts are keyed by the SHA-256 hex digest of the code body that
//! produced them. The cache is bounded by total payload size, not entry
//! count: inserting a new artifact evicts least-recently-used entries until
//! it fits. Every mutation (lookup with recency refresh, insert, eviction)
//! happens inside one mutex critical section, so `total_size_bytes` never
//! exceeds `max_size_bytes` as seen by any caller.

use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::models::Artifact;

/// SHA-256 hex digest of a code body.
pub fn content_hash(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One cached artifact with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub artifact: Artifact,
    pub size_bytes: u64,
    pub inserted_at: Instant,
    pub last_accessed: Instant,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size_bytes: u64,
    pub max_size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Inner {
    entries: LruCache<String, CacheEntry>,
    total_size_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Size-bounded LRU store for rendered artifacts.
pub struct ContentCache {
    inner: Mutex<Inner>,
    max_size_bytes: u64,
    max_age: Option<Duration>,
}

impl ContentCache {
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_size_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_size_bytes,
            max_age: None,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let mut cache = Self::new(config.max_size_bytes);
        cache.max_age = config.max_age_secs.map(Duration::from_secs);
        cache
    }

    /// Treat entries older than `max_age` as missing.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Poisoning is ignored: no critical section panics between updates.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        match self.max_age {
            Some(age) => now.duration_since(entry.inserted_at) > age,
            None => false,
        }
    }

    /// Look up an artifact, refreshing its recency on a hit.
    pub fn get(&self, hash: &str) -> Option<Artifact> {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired = match inner.entries.peek(hash) {
            Some(entry) => self.is_expired(entry, now),
            None => {
                inner.misses += 1;
                return None;
            }
        };

        if expired {
            if let Some(old) = inner.entries.pop(hash) {
                inner.total_size_bytes -= old.size_bytes;
            }
            inner.misses += 1;
            debug!(operation = "cache", hash, outcome = "expired", "Cache entry expired");
            return None;
        }

        let artifact = inner.entries.get_mut(hash).map(|entry| {
            entry.last_accessed = now;
            entry.artifact.clone()
        });
        inner.hits += 1;
        artifact
    }

    /// Whether `hash` is present, without touching recency or counters.
    pub fn contains(&self, hash: &str) -> bool {
        self.lock().entries.contains(hash)
    }

    /// Insert or replace an artifact.
    ///
    /// Re-putting an existing hash replaces the entry and adjusts the total
    /// by the size difference. Artifacts larger than the whole cache are
    /// rejected and the cache is left unchanged.
    pub fn put(&self, hash: &str, artifact: Artifact) -> Result<(), CacheError> {
        let size_bytes = artifact.size_bytes;
        if size_bytes > self.max_size_bytes {
            return Err(CacheError::ArtifactTooLarge {
                size_bytes,
                max_size_bytes: self.max_size_bytes,
            });
        }

        let now = Instant::now();
        let mut inner = self.lock();

        if let Some(old) = inner.entries.pop(hash) {
            inner.total_size_bytes -= old.size_bytes;
        }

        while inner.total_size_bytes + size_bytes > self.max_size_bytes {
            match inner.entries.pop_lru() {
                Some((evicted_hash, evicted)) => {
                    inner.total_size_bytes -= evicted.size_bytes;
                    inner.evictions += 1;
                    debug!(
                        operation = "cache",
                        hash = %evicted_hash,
                        size_bytes = evicted.size_bytes,
                        outcome = "evicted",
                        "Evicted cache entry"
                    );
                }
                None => break,
            }
        }

        inner.entries.put(
            hash.to_string(),
            CacheEntry {
                artifact,
                size_bytes,
                inserted_at: now,
                last_accessed: now,
            },
        );
        inner.total_size_bytes += size_bytes;
        Ok(())
    }

    pub fn remove(&self, hash: &str) -> Option<Artifact> {
        let mut inner = self.lock();
        let entry = inner.entries.pop(hash)?;
        inner.total_size_bytes -= entry.size_bytes;
        Some(entry.artifact)
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.total_size_bytes = 0;
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        if self.max_age.is_none() {
            return 0;
        }
        let now = Instant::now();
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in &expired {
            if let Some(entry) = inner.entries.pop(hash) {
                inner.total_size_bytes -= entry.size_bytes;
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.lock().total_size_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            total_size_bytes: inner.total_size_bytes,
            max_size_bytes: self.max_size_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MimeType;

    fn artifact(hash: &str, size: usize) -> Artifact {
        Artifact::new(hash, MimeType::PlainText, vec![b'x'; size])
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(content_hash("plot(1)"), content_hash("plot(1)"));
        assert_ne!(content_hash("plot(1)"), content_hash("plot(2)"));
    }

    #[test]
    fn test_get_miss_then_hit() {
        let cache = ContentCache::new(100);
        assert!(cache.get("a").is_none());
        cache.put("a", artifact("a", 10)).unwrap();
        assert_eq!(cache.get("a").unwrap().size_bytes, 10);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_lru_eviction_respects_recency() {
        // max 100; A(40), B(40), touch A, insert C(40) → B evicted.
        let cache = ContentCache::new(100);
        cache.put("a", artifact("a", 40)).unwrap();
        cache.put("b", artifact("b", 40)).unwrap();
        assert!(cache.get("a").is_some());
        cache.put("c", artifact("c", 40)).unwrap();

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.total_size_bytes(), 80);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_evicts_several_until_fit() {
        let cache = ContentCache::new(100);
        for (i, h) in ["a", "b", "c", "d"].iter().enumerate() {
            cache.put(h, artifact(h, 20 + i)).unwrap();
        }
        cache.put("big", artifact("big", 90)).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_size_bytes(), 90);
    }

    #[test]
    fn test_reput_adjusts_total() {
        let cache = ContentCache::new(100);
        cache.put("a", artifact("a", 30)).unwrap();
        cache.put("a", artifact("a", 50)).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_size_bytes(), 50);
        cache.put("a", artifact("a", 10)).unwrap();
        assert_eq!(cache.total_size_bytes(), 10);
    }

    #[test]
    fn test_reput_does_not_evict_itself_needlessly() {
        let cache = ContentCache::new(100);
        cache.put("a", artifact("a", 60)).unwrap();
        cache.put("b", artifact("b", 30)).unwrap();
        cache.put("a", artifact("a", 70)).unwrap();
        assert!(cache.contains("a"));
        assert!(cache.contains("b"));
        assert_eq!(cache.total_size_bytes(), 100);
    }

    #[test]
    fn test_oversized_rejected_and_cache_untouched() {
        let cache = ContentCache::new(100);
        cache.put("a", artifact("a", 40)).unwrap();
        let err = cache.put("huge", artifact("huge", 101)).unwrap_err();
        assert_eq!(
            err,
            CacheError::ArtifactTooLarge {
                size_bytes: 101,
                max_size_bytes: 100
            }
        );
        assert!(cache.contains("a"));
        assert_eq!(cache.total_size_bytes(), 40);
    }

    #[test]
    fn test_exact_capacity_fits() {
        let cache = ContentCache::new(100);
        cache.put("a", artifact("a", 100)).unwrap();
        assert_eq!(cache.total_size_bytes(), 100);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = ContentCache::new(100);
        cache.put("a", artifact("a", 10)).unwrap();
        cache.put("b", artifact("b", 20)).unwrap();
        assert!(cache.remove("a").is_some());
        assert!(cache.remove("a").is_none());
        assert_eq!(cache.total_size_bytes(), 20);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_size_bytes(), 0);
    }

    #[test]
    fn test_expired_entries_dropped() {
        let cache = ContentCache::new(100).with_max_age(Duration::from_millis(0));
        cache.put("a", artifact("a", 10)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.total_size_bytes(), 0);

        cache.put("b", artifact("b", 10)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_size_bound_under_concurrency() {
        use std::sync::Arc;
        let cache = Arc::new(ContentCache::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let h = format!("{}-{}", t, i);
                        cache.put(&h, artifact(&h, 10 + (i % 50))).unwrap();
                        assert!(cache.total_size_bytes() <= 1000);
                        let _ = cache.get(&format!("{}-{}", t, i / 2));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.total_size_bytes() <= 1000);
    }
}
