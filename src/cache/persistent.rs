use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, Result};
use crate::hash::sha256_hex;

/// content entries expire after 3 days
pub const MAX_AGE_CONTENT_SECS: i64 = 3 * 24 * 3600;
/// metadata entries expire after 7 days
pub const MAX_AGE_METADATA_SECS: i64 = 7 * 24 * 3600;

/// what an entry holds, which decides its maximum age
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Content,
    Metadata,
}

impl EntryKind {
    fn max_age_secs(&self) -> i64 {
        match self {
            EntryKind::Content => MAX_AGE_CONTENT_SECS,
            EntryKind::Metadata => MAX_AGE_METADATA_SECS,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct IndexEntry {
    size: u64,
    stored_at: i64,
    last_access: i64,
    kind: EntryKind,
}

/// persistent key-value cache tier surviving process restarts
///
/// data files live under a fanout layout; a json index carries sizes,
/// timestamps and kinds for ttl and lru decisions.
pub struct PersistentCache {
    root: PathBuf,
    capacity_bytes: u64,
    index: Mutex<HashMap<String, IndexEntry>>,
}

impl PersistentCache {
    pub fn open(root: &Path, capacity_bytes: u64) -> Result<Self> {
        fs::create_dir_all(root).with_path(root)?;

        let index_path = root.join("index.json");
        let index = if index_path.exists() {
            let content = fs::read_to_string(&index_path).with_path(&index_path)?;
            serde_json::from_str(&content).unwrap_or_default()
        } else {
            HashMap::new()
        };

        Ok(Self {
            root: root.to_path_buf(),
            capacity_bytes,
            index: Mutex::new(index),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let name = sha256_hex(key.as_bytes());
        let now = Utc::now().timestamp();

        {
            let mut index = self.index.lock();
            match index.get_mut(&name) {
                None => return Ok(None),
                Some(entry) if now - entry.stored_at > entry.kind.max_age_secs() => {
                    index.remove(&name);
                    drop(index);
                    let _ = fs::remove_file(self.entry_path(&name));
                    self.save_index()?;
                    return Ok(None);
                }
                Some(entry) => {
                    entry.last_access = now;
                }
            }
        }

        let path = self.entry_path(&name);
        match fs::read(&path) {
            Ok(bytes) => {
                self.save_index()?;
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // index said yes but the file is gone; heal the index
                self.index.lock().remove(&name);
                self.save_index()?;
                Ok(None)
            }
            Err(e) => Err(crate::Error::Io { path, source: e }),
        }
    }

    pub fn set(&self, key: &str, bytes: &[u8], kind: EntryKind) -> Result<()> {
        let size = bytes.len() as u64;
        if size > self.capacity_bytes {
            return Ok(());
        }

        let name = sha256_hex(key.as_bytes());
        let path = self.entry_path(&name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }

        let tmp = self.root.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        {
            let mut f = File::create(&tmp).with_path(&tmp)?;
            f.write_all(bytes).with_path(&tmp)?;
            f.sync_all().with_path(&tmp)?;
        }
        fs::rename(&tmp, &path).with_path(&path)?;

        let now = Utc::now().timestamp();
        {
            let mut index = self.index.lock();
            index.insert(
                name,
                IndexEntry {
                    size,
                    stored_at: now,
                    last_access: now,
                    kind,
                },
            );
            self.evict_locked(&mut index);
        }
        self.save_index()
    }

    pub fn has(&self, key: &str) -> bool {
        let name = sha256_hex(key.as_bytes());
        let now = Utc::now().timestamp();
        self.index
            .lock()
            .get(&name)
            .map(|e| now - e.stored_at <= e.kind.max_age_secs())
            .unwrap_or(false)
    }

    pub fn used_bytes(&self) -> u64 {
        self.index.lock().values().map(|e| e.size).sum()
    }

    /// drop expired entries and shrink to 80% utilization
    pub fn prune(&self) -> Result<u64> {
        let now = Utc::now().timestamp();
        let mut removed = 0u64;

        {
            let mut index = self.index.lock();
            let expired: Vec<String> = index
                .iter()
                .filter(|(_, e)| now - e.stored_at > e.kind.max_age_secs())
                .map(|(name, _)| name.clone())
                .collect();
            for name in expired {
                index.remove(&name);
                let _ = fs::remove_file(self.entry_path(&name));
                removed += 1;
            }
            removed += self.evict_to_locked(&mut index, self.capacity_bytes * 8 / 10);
        }

        self.save_index()?;
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        self.index.lock().clear();
        if self.root.exists() {
            fs::remove_dir_all(&self.root).with_path(&self.root)?;
            fs::create_dir_all(&self.root).with_path(&self.root)?;
        }
        self.save_index()
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.root.join(&name[..2]).join(&name[2..])
    }

    fn evict_locked(&self, index: &mut HashMap<String, IndexEntry>) {
        self.evict_to_locked(index, self.capacity_bytes);
    }

    fn evict_to_locked(&self, index: &mut HashMap<String, IndexEntry>, budget: u64) -> u64 {
        let mut evicted = 0u64;
        loop {
            let used: u64 = index.values().map(|e| e.size).sum();
            if used <= budget {
                break;
            }
            let victim = index
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(name, _)| name.clone());
            match victim {
                Some(name) => {
                    index.remove(&name);
                    let _ = fs::remove_file(self.entry_path(&name));
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    fn save_index(&self) -> Result<()> {
        let snapshot = self.index.lock().clone();
        let json = serde_json::to_string(&snapshot)?;
        let index_path = self.root.join("index.json");
        let tmp = self.root.join(format!(".index-{}", uuid::Uuid::new_v4()));
        {
            let mut f = File::create(&tmp).with_path(&tmp)?;
            f.write_all(json.as_bytes()).with_path(&tmp)?;
            f.sync_all().with_path(&tmp)?;
        }
        fs::rename(&tmp, &index_path).with_path(&index_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_set_get_roundtrip() {
        let dir = tempdir().unwrap();
        let cache = PersistentCache::open(dir.path(), 1024).unwrap();

        cache.set("key", b"value", EntryKind::Content).unwrap();
        assert!(cache.has("key"));
        assert_eq!(cache.get("key").unwrap().unwrap(), b"value");
        assert_eq!(cache.get("missing").unwrap(), None);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let cache = PersistentCache::open(dir.path(), 1024).unwrap();
            cache.set("key", b"durable", EntryKind::Metadata).unwrap();
        }

        let cache = PersistentCache::open(dir.path(), 1024).unwrap();
        assert_eq!(cache.get("key").unwrap().unwrap(), b"durable");
    }

    #[test]
    fn test_eviction_over_budget() {
        let dir = tempdir().unwrap();
        let cache = PersistentCache::open(dir.path(), 100).unwrap();

        cache.set("a", &[0; 60], EntryKind::Content).unwrap();
        cache.set("b", &[0; 60], EntryKind::Content).unwrap();

        assert!(cache.used_bytes() <= 100);
    }

    #[test]
    fn test_prune_and_clear() {
        let dir = tempdir().unwrap();
        let cache = PersistentCache::open(dir.path(), 100).unwrap();

        for i in 0..10 {
            cache
                .set(&format!("k{}", i), &[0; 10], EntryKind::Content)
                .unwrap();
        }
        let removed = cache.prune().unwrap();
        assert!(removed > 0);
        assert!(cache.used_bytes() <= 80);

        cache.clear().unwrap();
        assert_eq!(cache.used_bytes(), 0);
        assert_eq!(cache.get("k9").unwrap(), None);
    }
}
