//! remote blob transport
//!
//! wraps a key-value blob service with the size policy (single-shot vs
//! chunked), bounded concurrency, per-chunk checksums, retries and a
//! per-endpoint circuit breaker.

pub mod circuit;
pub mod memory;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub use circuit::CircuitBreaker;
pub use memory::MemoryBlobService;
pub use retry::{with_retry, RetryPolicy};

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::hash;

/// metadata attached to an upload
#[derive(Clone, Debug, Default)]
pub struct BlobMeta {
    pub content_type: Option<String>,
    pub size: u64,
    /// sha256 hex of the payload as transported
    pub integrity: Option<String>,
}

/// what the blob service knows about a stored payload
#[derive(Clone, Debug)]
pub struct RemoteBlobInfo {
    pub id: String,
    pub size: u64,
    pub chunked: bool,
    pub total_chunks: u32,
    pub integrity: Option<String>,
    pub content_type: Option<String>,
}

/// capability set of the external blob service
///
/// implementations are selected by configuration; the rest of the crate
/// sees only this trait.
#[async_trait]
pub trait BlobService: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, meta: &BlobMeta) -> Result<String>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn init_chunked(&self, key: &str, total_chunks: u32, meta: &BlobMeta) -> Result<()>;
    async fn put_chunk(&self, key: &str, index: u32, bytes: Vec<u8>, quick_sum: u64) -> Result<()>;
    async fn finalize_chunks(&self, key: &str, integrity: &str) -> Result<String>;
    async fn get_chunk(&self, key: &str, index: u32) -> Result<(Vec<u8>, u64)>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn info(&self, key: &str) -> Result<RemoteBlobInfo>;
    async fn list(&self) -> Result<Vec<RemoteBlobInfo>>;
}

/// transport over a blob service with the upload size policy applied
pub struct RemoteStore {
    service: Arc<dyn BlobService>,
    chunk_size: u64,
    chunk_concurrency: usize,
    write_policy: RetryPolicy,
    read_policy: RetryPolicy,
    breaker: CircuitBreaker,
    inflight: Arc<Semaphore>,
}

impl RemoteStore {
    pub fn new(service: Arc<dyn BlobService>, config: &StorageConfig, endpoint: &str) -> Self {
        Self {
            service,
            chunk_size: config.chunk_size.max(1),
            chunk_concurrency: config.chunk_concurrency.max(1),
            write_policy: RetryPolicy::writes().with_attempts(config.write_attempts),
            read_policy: RetryPolicy::reads().with_attempts(config.read_attempts),
            breaker: CircuitBreaker::new(endpoint, 5, Duration::from_secs(30)),
            inflight: Arc::new(Semaphore::new(config.chunk_concurrency.max(1))),
        }
    }

    /// upload a payload; single-shot at or under the chunk size, chunked
    /// above it. returns the remote identifier.
    pub async fn upload(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let integrity = hash::sha256_hex(bytes);
        let meta = BlobMeta {
            content_type,
            size: bytes.len() as u64,
            integrity: Some(integrity.clone()),
        };

        if bytes.len() as u64 <= self.chunk_size {
            let payload = bytes.to_vec();
            return with_retry(&self.write_policy, cancel, "blob.put", || {
                let payload = payload.clone();
                let meta = meta.clone();
                async move { self.guarded(self.service.put(key, payload, &meta)).await }
            })
            .await;
        }

        self.upload_chunked(key, bytes, meta, integrity, cancel).await
    }

    async fn put_one_chunk(
        &self,
        key: &str,
        index: u32,
        chunk: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let quick_sum = hash::quick_checksum(&chunk);
        with_retry(&self.write_policy, cancel, "blob.put_chunk", || {
            let chunk = chunk.clone();
            async move {
                self.guarded(self.service.put_chunk(key, index, chunk, quick_sum))
                    .await
            }
        })
        .await
    }

    async fn upload_chunked(
        &self,
        key: &str,
        bytes: &[u8],
        meta: BlobMeta,
        integrity: String,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let chunks: Vec<Vec<u8>> = bytes
            .chunks(self.chunk_size as usize)
            .map(|c| c.to_vec())
            .collect();
        let total = chunks.len() as u32;

        tracing::debug!(key, total, size = bytes.len(), "chunked upload");

        with_retry(&self.write_policy, cancel, "blob.init_chunked", || {
            let meta = meta.clone();
            async move { self.guarded(self.service.init_chunked(key, total, &meta)).await }
        })
        .await?;

        let mut uploads = stream::iter(chunks.into_iter().enumerate().map(move |(index, chunk)| {
            self.put_one_chunk(key, index as u32, chunk, cancel).boxed()
        }))
        .buffer_unordered(self.chunk_concurrency);

        while let Some(result) = uploads.next().await {
            result?;
        }
        drop(uploads);

        with_retry(&self.write_policy, cancel, "blob.finalize", || {
            let integrity = integrity.clone();
            async move {
                self.guarded(self.service.finalize_chunks(key, &integrity))
                    .await
            }
        })
        .await
    }

    /// download a payload, verifying per-chunk checksums and the overall
    /// integrity hash
    pub async fn download(&self, key: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let info = self.info_inner(key, cancel).await?;

        let bytes = if !info.chunked {
            with_retry(&self.read_policy, cancel, "blob.get", || async move {
                self.guarded(self.service.get(key)).await
            })
            .await?
        } else {
            self.download_chunked(key, info.total_chunks, cancel).await?
        };

        // overall integrity after reassembly
        if let Some(expected) = &info.integrity {
            let got = hash::sha256_hex(&bytes);
            if got != *expected {
                return Err(Error::Integrity {
                    expected: expected.clone(),
                    got,
                    algo: "sha256",
                });
            }
        }

        Ok(bytes)
    }

    async fn download_chunked(
        &self,
        key: &str,
        total: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut downloads = stream::iter((0..total).map(|index| async move {
            let (bytes, stored_sum) =
                with_retry(&self.read_policy, cancel, "blob.get_chunk", || async move {
                    self.guarded(self.service.get_chunk(key, index)).await
                })
                .await?;

            // quick checksum before reassembly
            let got = hash::quick_checksum(&bytes);
            if got != stored_sum {
                return Err(Error::Integrity {
                    expected: format!("{:016x}", stored_sum),
                    got: format!("{:016x}", got),
                    algo: "xxh64",
                });
            }
            Ok::<_, Error>((index, bytes))
        }))
        .buffer_unordered(self.chunk_concurrency);

        let mut parts: Vec<Option<Vec<u8>>> = vec![None; total as usize];
        while let Some(result) = downloads.next().await {
            let (index, bytes) = result?;
            parts[index as usize] = Some(bytes);
        }
        drop(downloads);

        let mut out = Vec::new();
        for (index, part) in parts.into_iter().enumerate() {
            match part {
                Some(bytes) => out.extend_from_slice(&bytes),
                None => {
                    return Err(Error::NotFound {
                        kind: "chunk",
                        id: format!("{}#{}", key, index),
                    })
                }
            }
        }
        Ok(out)
    }

    pub async fn exists(&self, key: &str, cancel: &CancellationToken) -> Result<bool> {
        with_retry(&self.read_policy, cancel, "blob.exists", || async move {
            self.guarded(self.service.exists(key)).await
        })
        .await
    }

    pub async fn info(&self, key: &str, cancel: &CancellationToken) -> Result<RemoteBlobInfo> {
        self.info_inner(key, cancel).await
    }

    pub async fn list(&self, cancel: &CancellationToken) -> Result<Vec<RemoteBlobInfo>> {
        with_retry(&self.read_policy, cancel, "blob.list", || async move {
            self.guarded(self.service.list()).await
        })
        .await
    }

    async fn info_inner(&self, key: &str, cancel: &CancellationToken) -> Result<RemoteBlobInfo> {
        with_retry(&self.read_policy, cancel, "blob.info", || async move {
            self.guarded(self.service.info(key)).await
        })
        .await
    }

    /// gate a service call through the breaker and the per-endpoint
    /// concurrency bound
    async fn guarded<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        self.breaker.check()?;
        let _permit = self
            .inflight
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;

        match fut.await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(e) => {
                if e.is_retryable() {
                    self.breaker.record_failure();
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(service: Arc<MemoryBlobService>) -> RemoteStore {
        RemoteStore::new(service, &StorageConfig::default(), "blob.test")
    }

    #[tokio::test]
    async fn test_small_upload_roundtrip() {
        let service = Arc::new(MemoryBlobService::new());
        let store = store_with(service.clone());
        let cancel = CancellationToken::new();

        let id = store
            .upload("key-1", b"small payload", None, &cancel)
            .await
            .unwrap();
        assert_eq!(id, "key-1");
        assert!(store.exists("key-1", &cancel).await.unwrap());

        let bytes = store.download("key-1", &cancel).await.unwrap();
        assert_eq!(bytes, b"small payload");

        let info = store.info("key-1", &cancel).await.unwrap();
        assert!(!info.chunked);
        assert_eq!(info.size, 13);
    }

    #[tokio::test]
    async fn test_chunked_upload_roundtrip() {
        let service = Arc::new(MemoryBlobService::new());
        let store = store_with(service.clone());
        let cancel = CancellationToken::new();

        // 3 MiB + 1 byte: three full chunks and a one-byte tail
        let payload: Vec<u8> = (0..3 * 1024 * 1024 + 1).map(|i| (i % 251) as u8).collect();
        store.upload("big", &payload, None, &cancel).await.unwrap();

        assert_eq!(service.chunk_count("big"), Some(4));
        let info = store.info("big", &cancel).await.unwrap();
        assert!(info.chunked);
        assert_eq!(info.total_chunks, 4);

        let downloaded = store.download("big", &cancel).await.unwrap();
        assert_eq!(downloaded, payload);
    }

    #[tokio::test]
    async fn test_corrupted_chunk_detected() {
        let service = Arc::new(MemoryBlobService::new());
        let store = store_with(service.clone());
        let cancel = CancellationToken::new();

        let payload = vec![7u8; 2 * 1024 * 1024 + 17];
        store.upload("big", &payload, None, &cancel).await.unwrap();

        service.corrupt_chunk_in_transit("big", 1);
        let result = store.download("big", &cancel).await;
        assert!(matches!(result, Err(Error::Integrity { algo: "xxh64", .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_write_failures_retried() {
        let service = Arc::new(MemoryBlobService::new());
        let store = store_with(service.clone());
        let cancel = CancellationToken::new();

        service.fail_next_writes(2);
        store
            .upload("flaky", b"eventually lands", None, &cancel)
            .await
            .unwrap();
        assert_eq!(
            store.download("flaky", &cancel).await.unwrap(),
            b"eventually lands"
        );
    }

    #[tokio::test]
    async fn test_missing_blob_not_retried_as_network() {
        let service = Arc::new(MemoryBlobService::new());
        let store = store_with(service);
        let cancel = CancellationToken::new();

        let result = store.download("absent", &cancel).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_list_blobs() {
        let service = Arc::new(MemoryBlobService::new());
        let store = store_with(service);
        let cancel = CancellationToken::new();

        store.upload("a", b"one", None, &cancel).await.unwrap();
        store.upload("b", b"two", None, &cancel).await.unwrap();

        let listed = store.list(&cancel).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }
}
