use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, LedgerErrorKind, NetworkErrorKind, Result};
use crate::remote::{BlobMeta, BlobService, RemoteBlobInfo};

/// blob service backed by process memory, for tests and localnet
///
/// supports transient-failure injection and in-transit chunk corruption so
/// the transport's retry and integrity paths can be exercised.
pub struct MemoryBlobService {
    blobs: Mutex<HashMap<String, Stored>>,
    fail_next: AtomicU32,
    corrupt_chunk: Mutex<Option<(String, u32)>>,
}

struct Stored {
    bytes: Vec<u8>,
    chunks: HashMap<u32, (Vec<u8>, u64)>,
    total_chunks: u32,
    finalized: bool,
    integrity: Option<String>,
    content_type: Option<String>,
    size: u64,
}

impl MemoryBlobService {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            fail_next: AtomicU32::new(0),
            corrupt_chunk: Mutex::new(None),
        }
    }

    /// make the next `n` write calls fail with a transient network error
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// flip a byte of one chunk on its next download, leaving the stored
    /// checksum intact (simulated transport corruption)
    pub fn corrupt_chunk_in_transit(&self, key: &str, index: u32) {
        *self.corrupt_chunk.lock() = Some((key.to_string(), index));
    }

    /// number of stored chunks for a key (test introspection)
    pub fn chunk_count(&self, key: &str) -> Option<u32> {
        self.blobs
            .lock()
            .get(key)
            .filter(|s| s.total_chunks > 0)
            .map(|s| s.chunks.len() as u32)
    }

    fn maybe_fail(&self) -> Result<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Network {
                kind: NetworkErrorKind::Transient,
                message: "injected transient failure".into(),
            });
        }
        Ok(())
    }
}

impl Default for MemoryBlobService {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(key: &str) -> Error {
    Error::NotFound {
        kind: "blob",
        id: key.to_string(),
    }
}

#[async_trait]
impl BlobService for MemoryBlobService {
    async fn put(&self, key: &str, bytes: Vec<u8>, meta: &BlobMeta) -> Result<String> {
        self.maybe_fail()?;
        let mut blobs = self.blobs.lock();
        let size = bytes.len() as u64;
        blobs.insert(
            key.to_string(),
            Stored {
                bytes,
                chunks: HashMap::new(),
                total_chunks: 0,
                finalized: true,
                integrity: meta.integrity.clone(),
                content_type: meta.content_type.clone(),
                size,
            },
        );
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let blobs = self.blobs.lock();
        let stored = blobs.get(key).ok_or_else(|| not_found(key))?;
        if stored.total_chunks > 0 {
            return Err(Error::Format(format!("blob {} is chunked", key)));
        }
        Ok(stored.bytes.clone())
    }

    async fn init_chunked(&self, key: &str, total_chunks: u32, meta: &BlobMeta) -> Result<()> {
        self.maybe_fail()?;
        let mut blobs = self.blobs.lock();
        blobs.insert(
            key.to_string(),
            Stored {
                bytes: Vec::new(),
                chunks: HashMap::new(),
                total_chunks,
                finalized: false,
                integrity: None,
                content_type: meta.content_type.clone(),
                size: meta.size,
            },
        );
        Ok(())
    }

    async fn put_chunk(&self, key: &str, index: u32, bytes: Vec<u8>, quick_sum: u64) -> Result<()> {
        self.maybe_fail()?;
        let mut blobs = self.blobs.lock();
        let stored = blobs.get_mut(key).ok_or_else(|| not_found(key))?;
        if index >= stored.total_chunks {
            return Err(Error::Ledger {
                kind: LedgerErrorKind::Validation,
                message: format!("chunk index {} out of range", index),
            });
        }
        stored.chunks.insert(index, (bytes, quick_sum));
        Ok(())
    }

    async fn finalize_chunks(&self, key: &str, integrity: &str) -> Result<String> {
        self.maybe_fail()?;
        let mut blobs = self.blobs.lock();
        let stored = blobs.get_mut(key).ok_or_else(|| not_found(key))?;
        for index in 0..stored.total_chunks {
            if !stored.chunks.contains_key(&index) {
                return Err(Error::NotFound {
                    kind: "chunk",
                    id: format!("{}#{}", key, index),
                });
            }
        }
        stored.finalized = true;
        stored.integrity = Some(integrity.to_string());
        Ok(key.to_string())
    }

    async fn get_chunk(&self, key: &str, index: u32) -> Result<(Vec<u8>, u64)> {
        let corruption = self.corrupt_chunk.lock().clone();
        let blobs = self.blobs.lock();
        let stored = blobs.get(key).ok_or_else(|| not_found(key))?;
        let (bytes, sum) = stored.chunks.get(&index).ok_or_else(|| Error::NotFound {
            kind: "chunk",
            id: format!("{}#{}", key, index),
        })?;

        let mut bytes = bytes.clone();
        if corruption == Some((key.to_string(), index)) {
            if let Some(b) = bytes.first_mut() {
                *b ^= 0xff;
            }
        }
        Ok((bytes, *sum))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .blobs
            .lock()
            .get(key)
            .map(|s| s.finalized)
            .unwrap_or(false))
    }

    async fn info(&self, key: &str) -> Result<RemoteBlobInfo> {
        let blobs = self.blobs.lock();
        let stored = blobs.get(key).ok_or_else(|| not_found(key))?;
        Ok(RemoteBlobInfo {
            id: key.to_string(),
            size: stored.size,
            chunked: stored.total_chunks > 0,
            total_chunks: stored.total_chunks,
            integrity: stored.integrity.clone(),
            content_type: stored.content_type.clone(),
        })
    }

    async fn list(&self) -> Result<Vec<RemoteBlobInfo>> {
        let blobs = self.blobs.lock();
        let mut infos: Vec<_> = blobs
            .iter()
            .filter(|(_, s)| s.finalized)
            .map(|(key, stored)| RemoteBlobInfo {
                id: key.clone(),
                size: stored.size,
                chunked: stored.total_chunks > 0,
                total_chunks: stored.total_chunks,
                integrity: stored.integrity.clone(),
                content_type: stored.content_type.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }
}
