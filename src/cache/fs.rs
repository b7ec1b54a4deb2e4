use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;

use crate::error::{IoResultExt, Result};
use crate::hash::sha256_hex;

/// filesystem cache tier
///
/// entries live under a fanout layout keyed by the sha256 of the cache
/// key; an in-memory index tracks sizes and access order for eviction.
pub struct FsCache {
    root: PathBuf,
    capacity_bytes: u64,
    index: Mutex<Index>,
}

struct Index {
    entries: HashMap<String, IndexEntry>,
    used_bytes: u64,
}

struct IndexEntry {
    size: u64,
    last_access: Instant,
}

impl FsCache {
    /// open the tier, scanning any entries left by previous sessions
    pub fn open(root: &Path, capacity_bytes: u64) -> Result<Self> {
        fs::create_dir_all(root).with_path(root)?;

        let mut entries = HashMap::new();
        let mut used_bytes = 0u64;
        let scan_start = Instant::now();

        for dir in fs::read_dir(root).with_path(root)? {
            let dir = dir.with_path(root)?;
            if !dir.path().is_dir() {
                continue;
            }
            let prefix = dir.file_name().to_string_lossy().to_string();
            for file in fs::read_dir(dir.path()).with_path(dir.path())? {
                let file = file.with_path(dir.path())?;
                let meta = file.metadata().with_path(file.path())?;
                if !meta.is_file() {
                    continue;
                }
                let name = format!("{}{}", prefix, file.file_name().to_string_lossy());
                // order survivors by mtime so eviction stays lru-ish
                // across sessions
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|m| SystemTime::now().duration_since(m).ok())
                    .unwrap_or_default();
                entries.insert(
                    name,
                    IndexEntry {
                        size: meta.len(),
                        last_access: scan_start.checked_sub(age).unwrap_or(scan_start),
                    },
                );
                used_bytes += meta.len();
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            capacity_bytes,
            index: Mutex::new(Index {
                entries,
                used_bytes,
            }),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let name = file_name(key);
        let path = self.entry_path(&name);

        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(crate::Error::Io {
                    path,
                    source: e,
                })
            }
        };

        let mut index = self.index.lock();
        if let Some(entry) = index.entries.get_mut(&name) {
            entry.last_access = Instant::now();
        }
        Ok(Some(bytes))
    }

    pub fn set(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let size = bytes.len() as u64;
        if size > self.capacity_bytes {
            return Ok(());
        }

        let name = file_name(key);
        let path = self.entry_path(&name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }

        // atomic write: temp -> fsync -> rename
        let tmp = self.root.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        {
            let mut f = File::create(&tmp).with_path(&tmp)?;
            f.write_all(bytes).with_path(&tmp)?;
            f.sync_all().with_path(&tmp)?;
        }
        fs::rename(&tmp, &path).with_path(&path)?;

        let mut index = self.index.lock();
        if let Some(old) = index.entries.remove(&name) {
            index.used_bytes -= old.size;
        }
        index.entries.insert(
            name,
            IndexEntry {
                size,
                last_access: Instant::now(),
            },
        );
        index.used_bytes += size;

        self.evict_locked(&mut index, self.capacity_bytes);
        Ok(())
    }

    pub fn has(&self, key: &str) -> bool {
        self.entry_path(&file_name(key)).exists()
    }

    pub fn used_bytes(&self) -> u64 {
        self.index.lock().used_bytes
    }

    /// evict down to 80% utilization; returns evicted entry count
    pub fn prune(&self) -> u64 {
        let mut index = self.index.lock();
        let before = index.entries.len();
        self.evict_locked(&mut index, self.capacity_bytes * 8 / 10);
        (before - index.entries.len()) as u64
    }

    pub fn clear(&self) -> Result<()> {
        let mut index = self.index.lock();
        index.entries.clear();
        index.used_bytes = 0;
        drop(index);

        if self.root.exists() {
            fs::remove_dir_all(&self.root).with_path(&self.root)?;
            fs::create_dir_all(&self.root).with_path(&self.root)?;
        }
        Ok(())
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.root.join(&name[..2]).join(&name[2..])
    }

    fn evict_locked(&self, index: &mut Index, budget: u64) {
        while index.used_bytes > budget {
            let victim = index
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(name, _)| name.clone());
            match victim {
                Some(name) => {
                    if let Some(entry) = index.entries.remove(&name) {
                        index.used_bytes -= entry.size;
                    }
                    let _ = fs::remove_file(self.entry_path(&name));
                }
                None => break,
            }
        }
    }
}

/// cache keys map to filenames through sha256; keys are arbitrary strings
fn file_name(key: &str) -> String {
    sha256_hex(key.as_bytes())
}
