use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

/// negative lookups live this long in memory, and only in memory
pub const NEGATIVE_TTL: Duration = Duration::from_secs(60);

/// in-process cache tier: lru over a byte budget, plus a short-lived
/// negative cache for misses
pub struct MemoryCache {
    inner: Mutex<Inner>,
    capacity_bytes: u64,
}

struct Inner {
    entries: LruCache<String, Entry>,
    used_bytes: u64,
    negative: HashMap<String, Instant>,
}

struct Entry {
    bytes: Arc<Vec<u8>>,
    accesses: u32,
    /// entry resists eviction until it has been read this many times
    pin_min_accesses: u32,
}

impl MemoryCache {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                used_bytes: 0,
                negative: HashMap::new(),
            }),
            capacity_bytes,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(key)?;
        entry.accesses += 1;
        Some(entry.bytes.clone())
    }

    pub fn set(&self, key: &str, bytes: Vec<u8>, pin_min_accesses: u32) {
        let size = bytes.len() as u64;
        if size > self.capacity_bytes {
            return; // larger than the whole tier, never cacheable here
        }

        let mut inner = self.inner.lock();
        inner.negative.remove(key);

        if let Some(old) = inner.entries.pop(key) {
            inner.used_bytes -= old.bytes.len() as u64;
        }

        inner.entries.put(
            key.to_string(),
            Entry {
                bytes: Arc::new(bytes),
                accesses: 0,
                pin_min_accesses,
            },
        );
        inner.used_bytes += size;

        Self::evict_to(&mut inner, self.capacity_bytes);
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.lock().entries.contains(key)
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.pop(key) {
            inner.used_bytes -= old.bytes.len() as u64;
        }
    }

    /// record a confirmed miss; only ever cached here, with a short ttl
    pub fn set_negative(&self, key: &str) {
        self.inner
            .lock()
            .negative
            .insert(key.to_string(), Instant::now() + NEGATIVE_TTL);
    }

    pub fn is_negative(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.negative.get(key) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                inner.negative.remove(key);
                false
            }
            None => false,
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// drop the least-recently-used entries down to 80% utilization
    pub fn prune(&self) -> u64 {
        let mut inner = self.inner.lock();
        let target = self.capacity_bytes * 8 / 10;
        if inner.used_bytes <= target {
            return 0;
        }
        let before = inner.entries.len();
        Self::evict_to(&mut inner, target);
        (before - inner.entries.len()) as u64
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.negative.clear();
        inner.used_bytes = 0;
    }

    /// evict lru-first until under the budget; pinned entries that have
    /// not met their access minimum survive the first pass
    fn evict_to(inner: &mut Inner, budget: u64) {
        let mut spared: Vec<(String, Entry)> = Vec::new();

        while inner.used_bytes > budget {
            match inner.entries.pop_lru() {
                Some((key, entry)) => {
                    if entry.accesses < entry.pin_min_accesses {
                        inner.used_bytes -= entry.bytes.len() as u64;
                        spared.push((key, entry));
                        continue;
                    }
                    inner.used_bytes -= entry.bytes.len() as u64;
                }
                None => break,
            }
        }

        // reinstate the spared entries; they were not evicted, only the
        // budget accounting passed over them
        for (key, entry) in spared {
            inner.used_bytes += entry.bytes.len() as u64;
            inner.entries.put(key, entry);
        }

        // pins could not make room on their own; evict strictly by lru
        while inner.used_bytes > budget {
            match inner.entries.pop_lru() {
                Some((_, entry)) => inner.used_bytes -= entry.bytes.len() as u64,
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let cache = MemoryCache::new(1024);
        cache.set("a", b"hello".to_vec(), 0);

        assert_eq!(cache.get("a").unwrap().as_slice(), b"hello");
        assert!(cache.get("b").is_none());
        assert!(cache.has("a"));
    }

    #[test]
    fn test_lru_eviction_over_budget() {
        let cache = MemoryCache::new(100);
        cache.set("a", vec![0; 40], 0);
        cache.set("b", vec![0; 40], 0);

        // touch a so b is the lru victim
        cache.get("a");
        cache.set("c", vec![0; 40], 0);

        assert!(cache.has("a") || cache.has("c"));
        assert!(cache.used_bytes() <= 100);
    }

    #[test]
    fn test_oversized_entry_skipped() {
        let cache = MemoryCache::new(10);
        cache.set("big", vec![0; 100], 0);
        assert!(!cache.has("big"));
    }

    #[test]
    fn test_pinned_entry_resists_churn() {
        let cache = MemoryCache::new(100);
        cache.set("pinned", vec![0; 60], 5);
        cache.set("other", vec![0; 60], 0);

        // pinned entry has not met its access minimum, so the other entry
        // went instead
        assert!(cache.has("pinned"));
    }

    #[test]
    fn test_negative_cache() {
        let cache = MemoryCache::new(100);
        assert!(!cache.is_negative("missing"));

        cache.set_negative("missing");
        assert!(cache.is_negative("missing"));

        // a set clears the negative entry
        cache.set("missing", b"found".to_vec(), 0);
        assert!(!cache.is_negative("missing"));
    }

    #[test]
    fn test_prune_to_watermark() {
        let cache = MemoryCache::new(100);
        for i in 0..10 {
            cache.set(&format!("k{}", i), vec![0; 10], 0);
        }
        assert_eq!(cache.used_bytes(), 100);

        let evicted = cache.prune();
        assert!(evicted > 0);
        assert!(cache.used_bytes() <= 80);
    }

    #[test]
    fn test_clear() {
        let cache = MemoryCache::new(100);
        cache.set("a", b"x".to_vec(), 0);
        cache.set_negative("b");

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.used_bytes(), 0);
        assert!(!cache.is_negative("b"));
    }
}
