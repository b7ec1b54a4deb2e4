//! multi-level object cache
//!
//! tiers in lookup order: L1 memory, L2 filesystem, L3 persistent store,
//! L4 remote blob service (authoritative). a hit populates every hotter
//! tier; evictions never affect correctness because content is always
//! reconstructible from the local store or the remote.

pub mod fs;
pub mod memory;
pub mod persistent;
pub mod prefetch;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use fs::FsCache;
pub use memory::MemoryCache;
pub use persistent::{EntryKind, PersistentCache};
pub use prefetch::CacheContext;

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::remote::RemoteStore;

/// which entries a prune pass may touch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrunePolicy {
    /// only entries past their maximum age
    Expired,
    /// expired entries plus lru eviction down to the tier watermarks
    Utilization,
}

/// hit/miss counts for one tier
#[derive(Clone, Copy, Debug, Default)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
}

impl TierStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// background prefetch outcomes
#[derive(Clone, Copy, Debug, Default)]
pub struct PrefetchStats {
    pub attempts: u64,
    pub successes: u64,
}

impl PrefetchStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

/// snapshot of cache metrics
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    pub memory: TierStats,
    pub filesystem: TierStats,
    pub persistent: TierStats,
    pub remote: TierStats,
    pub prefetching: PrefetchStats,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Default)]
struct Counters {
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l3_hits: AtomicU64,
    l3_misses: AtomicU64,
    l4_hits: AtomicU64,
    l4_misses: AtomicU64,
    prefetch_attempts: AtomicU64,
    prefetch_successes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

/// the tiered cache
pub struct MultiCache {
    l1: MemoryCache,
    l2: FsCache,
    l3: PersistentCache,
    remote: Option<Arc<RemoteStore>>,
    counters: Counters,
}

impl MultiCache {
    /// open the cache rooted at a directory (normally `.walgit/cache`)
    pub fn open(root: &Path, config: &StorageConfig) -> Result<Self> {
        Ok(Self {
            l1: MemoryCache::new(config.memory_cache_bytes),
            l2: FsCache::open(&root.join("fs"), config.fs_cache_bytes)?,
            l3: PersistentCache::open(&root.join("store"), config.persistent_cache_bytes)?,
            remote: None,
            counters: Counters::default(),
        })
    }

    /// attach the authoritative remote tier
    pub fn with_remote(mut self, remote: Arc<RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// walk the tiers for a key, populating hotter tiers on the way back
    pub async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<Option<Vec<u8>>> {
        if self.l1.is_negative(key) {
            self.counters.l1_misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        if let Some(bytes) = self.l1.get(key) {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes_read
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            return Ok(Some(bytes.as_ref().clone()));
        }
        self.counters.l1_misses.fetch_add(1, Ordering::Relaxed);

        if let Some(bytes) = self.l2.get(key)? {
            self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes_read
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            self.l1.set(key, bytes.clone(), 0);
            return Ok(Some(bytes));
        }
        self.counters.l2_misses.fetch_add(1, Ordering::Relaxed);

        if let Some(bytes) = self.l3.get(key)? {
            self.counters.l3_hits.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes_read
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            self.l2.set(key, &bytes)?;
            self.l1.set(key, bytes.clone(), 0);
            return Ok(Some(bytes));
        }
        self.counters.l3_misses.fetch_add(1, Ordering::Relaxed);

        if let Some(remote) = &self.remote {
            match remote.download(key, cancel).await {
                Ok(bytes) => {
                    self.counters.l4_hits.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .bytes_read
                        .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    self.l3.set(key, &bytes, EntryKind::Content)?;
                    self.l2.set(key, &bytes)?;
                    self.l1.set(key, bytes.clone(), 0);
                    return Ok(Some(bytes));
                }
                Err(Error::NotFound { .. }) => {
                    self.counters.l4_misses.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }

        // confirmed miss across every tier; remembered briefly, in memory only
        self.l1.set_negative(key);
        Ok(None)
    }

    /// like `get`, and on a hit from the colder tiers schedules background
    /// prefetch of the context's related keys
    pub async fn get_with_context(
        self: Arc<Self>,
        key: &str,
        context: &CacheContext,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>> {
        let warm = self.l1.has(key) || self.l2.has(key);
        let result = self.get(key, cancel).await?;

        if result.is_some() && !warm && !context.related_keys.is_empty() {
            prefetch::spawn(
                Arc::clone(&self),
                context.related_keys.clone(),
                cancel.clone(),
            );
        }

        Ok(result)
    }

    /// write through every local tier
    pub async fn set(&self, key: &str, bytes: &[u8], kind: EntryKind) -> Result<()> {
        self.counters
            .bytes_written
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.l1.set(key, bytes.to_vec(), 0);
        self.l2.set(key, bytes)?;
        self.l3.set(key, bytes, kind)?;
        Ok(())
    }

    /// check the local tiers, then the remote
    pub async fn has(&self, key: &str, cancel: &CancellationToken) -> Result<bool> {
        if self.l1.is_negative(key) {
            return Ok(false);
        }
        if self.l1.has(key) || self.l2.has(key) || self.l3.has(key) {
            return Ok(true);
        }
        match &self.remote {
            Some(remote) => remote.exists(key, cancel).await,
            None => Ok(false),
        }
    }

    /// prune the local tiers; returns the number of evicted entries
    pub fn prune(&self, policy: PrunePolicy) -> Result<u64> {
        let mut evicted = self.l3.prune()?;
        if policy == PrunePolicy::Utilization {
            evicted += self.l1.prune();
            evicted += self.l2.prune();
        }
        Ok(evicted)
    }

    /// empty every local tier; the authoritative remote is untouched
    pub fn clear(&self) -> Result<()> {
        self.l1.clear();
        self.l2.clear()?;
        self.l3.clear()?;
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            memory: TierStats {
                hits: c.l1_hits.load(Ordering::Relaxed),
                misses: c.l1_misses.load(Ordering::Relaxed),
            },
            filesystem: TierStats {
                hits: c.l2_hits.load(Ordering::Relaxed),
                misses: c.l2_misses.load(Ordering::Relaxed),
            },
            persistent: TierStats {
                hits: c.l3_hits.load(Ordering::Relaxed),
                misses: c.l3_misses.load(Ordering::Relaxed),
            },
            remote: TierStats {
                hits: c.l4_hits.load(Ordering::Relaxed),
                misses: c.l4_misses.load(Ordering::Relaxed),
            },
            prefetching: PrefetchStats {
                attempts: c.prefetch_attempts.load(Ordering::Relaxed),
                successes: c.prefetch_successes.load(Ordering::Relaxed),
            },
            bytes_read: c.bytes_read.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn memory_has(&self, key: &str) -> bool {
        self.l1.has(key)
    }

    pub(crate) fn record_prefetch_attempt(&self) {
        self.counters
            .prefetch_attempts
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_prefetch_success(&self) {
        self.counters
            .prefetch_successes
            .fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryBlobService;
    use tempfile::tempdir;

    fn open_cache(root: &Path) -> MultiCache {
        MultiCache::open(root, &StorageConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_set_then_get_same_task() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let cancel = CancellationToken::new();

        cache.set("k", b"v", EntryKind::Content).await.unwrap();
        assert_eq!(cache.get("k", &cancel).await.unwrap().unwrap(), b"v");

        let stats = cache.stats();
        assert_eq!(stats.memory.hits, 1);
    }

    #[tokio::test]
    async fn test_miss_walks_all_tiers() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let cancel = CancellationToken::new();

        assert_eq!(cache.get("absent", &cancel).await.unwrap(), None);

        let stats = cache.stats();
        assert_eq!(stats.memory.misses, 1);
        assert_eq!(stats.filesystem.misses, 1);
        assert_eq!(stats.persistent.misses, 1);
    }

    #[tokio::test]
    async fn test_negative_lookup_short_circuits() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let cancel = CancellationToken::new();

        assert_eq!(cache.get("absent", &cancel).await.unwrap(), None);
        // second lookup is answered by the negative cache without
        // touching the colder tiers
        assert_eq!(cache.get("absent", &cancel).await.unwrap(), None);

        let stats = cache.stats();
        assert_eq!(stats.filesystem.misses, 1);
    }

    #[tokio::test]
    async fn test_remote_tier_populates_local() {
        let dir = tempdir().unwrap();
        let service = Arc::new(MemoryBlobService::new());
        let remote = Arc::new(RemoteStore::new(
            service.clone(),
            &StorageConfig::default(),
            "blob.test",
        ));
        let cancel = CancellationToken::new();

        remote
            .upload("key", b"remote bytes", None, &cancel)
            .await
            .unwrap();

        let cache = open_cache(dir.path()).with_remote(remote);
        assert_eq!(
            cache.get("key", &cancel).await.unwrap().unwrap(),
            b"remote bytes"
        );
        assert_eq!(cache.stats().remote.hits, 1);

        // now served from memory
        cache.get("key", &cancel).await.unwrap();
        assert_eq!(cache.stats().memory.hits, 1);
    }

    #[tokio::test]
    async fn test_clear_falls_through_to_remote() {
        let dir = tempdir().unwrap();
        let service = Arc::new(MemoryBlobService::new());
        let remote = Arc::new(RemoteStore::new(
            service,
            &StorageConfig::default(),
            "blob.test",
        ));
        let cancel = CancellationToken::new();

        remote.upload("key", b"v", None, &cancel).await.unwrap();

        let cache = open_cache(dir.path()).with_remote(remote);
        cache.set("key", b"v", EntryKind::Content).await.unwrap();

        cache.clear().unwrap();
        // still resolvable from the authoritative tier
        assert_eq!(cache.get("key", &cancel).await.unwrap().unwrap(), b"v");
    }

    #[tokio::test]
    async fn test_prefetch_warms_sibling_keys() {
        let dir = tempdir().unwrap();
        let service = Arc::new(MemoryBlobService::new());
        let remote = Arc::new(RemoteStore::new(
            service,
            &StorageConfig::default(),
            "blob.test",
        ));
        let cancel = CancellationToken::new();

        for key in ["main", "sibling-1", "sibling-2"] {
            remote
                .upload(key, format!("content of {}", key).as_bytes(), None, &cancel)
                .await
                .unwrap();
        }

        let cache = Arc::new(open_cache(dir.path()).with_remote(remote));
        let context = CacheContext::for_path("src/index.js")
            .with_related(vec!["sibling-1".to_string(), "sibling-2".to_string()]);

        cache
            .clone()
            .get_with_context("main", &context, &cancel)
            .await
            .unwrap()
            .unwrap();

        // the background task warms the siblings shortly after
        for _ in 0..50 {
            if cache.memory_has("sibling-1") && cache.memory_has("sibling-2") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(cache.memory_has("sibling-1"));
        assert!(cache.memory_has("sibling-2"));
        assert!(cache.stats().prefetching.success_rate() > 0.0);
    }

    #[tokio::test]
    async fn test_has_checks_tiers() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let cancel = CancellationToken::new();

        assert!(!cache.has("k", &cancel).await.unwrap());
        cache.set("k", b"v", EntryKind::Content).await.unwrap();
        assert!(cache.has("k", &cancel).await.unwrap());
    }
}
