//! object engine
//!
//! create/get/verify/migrate/repair for blobs, trees and commits across
//! the local store, the cache tiers and the remote blob service. remote
//! payloads for git objects are the same zlib-deflated framed bytes the
//! local store holds, keyed by the object hash.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::{CacheContext, EntryKind, MultiCache};
use crate::codec;
use crate::error::{Error, Result};
use crate::hash::{self, ChecksumAlgo, Hash, ObjectKind};
use crate::object;
use crate::remote::RemoteStore;
use crate::repo::Repo;
use crate::types::{Commit, Tree, TreeEntry};

/// where a blob was found
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Presence {
    pub cache: bool,
    pub local: bool,
    pub remote: bool,
}

impl Presence {
    pub fn found(&self) -> bool {
        self.cache || self.local || self.remote
    }
}

/// description of a stored blob
#[derive(Clone, Debug)]
pub struct BlobInfo {
    pub hash: Hash,
    pub size: u64,
    pub content_type: Option<String>,
    pub compressed_size: u64,
    pub compression_ratio: f64,
    pub integrity: Option<BTreeMap<ChecksumAlgo, String>>,
    pub remote_id: Option<String>,
}

/// options for blob creation
#[derive(Clone, Debug, Default)]
pub struct CreateBlobOptions {
    /// keep the blob local even when a remote is configured
    pub skip_upload: bool,
    /// re-read and re-hash after storage
    pub verify: bool,
    /// record multi-algorithm checksums in the returned info
    pub with_integrity: bool,
    pub content_type: Option<String>,
}

/// options for blob reads
#[derive(Clone, Debug, Default)]
pub struct GetBlobOptions {
    /// return the compressed framed bytes instead of the content
    pub raw: bool,
    /// re-verify the hash even on local hits
    pub verify: bool,
    /// hints for the cache prefetcher
    pub context: Option<CacheContext>,
}

/// outcome of a migrate or repair pass for one hash
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepairOutcome {
    Healthy,
    RepairedLocal,
    RepairedRemote,
    Unrecoverable,
}

/// per-hash report of a migrate/repair run
#[derive(Debug, Default)]
pub struct Report {
    pub transferred: Vec<Hash>,
    pub skipped: Vec<Hash>,
    pub failed: Vec<(Hash, String)>,
}

/// direction for object migration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrateDirection {
    ToRemote,
    ToLocal,
}

/// storage totals
#[derive(Clone, Debug)]
pub struct StorageStats {
    pub local_objects: u64,
    pub local_bytes: u64,
    pub cache: crate::cache::CacheStats,
}

/// the object engine
pub struct ObjectEngine {
    repo: Arc<Repo>,
    cache: Arc<MultiCache>,
    remote: Option<Arc<RemoteStore>>,
}

impl ObjectEngine {
    pub fn new(repo: Arc<Repo>, cache: Arc<MultiCache>, remote: Option<Arc<RemoteStore>>) -> Self {
        Self {
            repo,
            cache,
            remote,
        }
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    pub fn cache(&self) -> &Arc<MultiCache> {
        &self.cache
    }

    pub fn remote(&self) -> Option<&Arc<RemoteStore>> {
        self.remote.as_ref()
    }

    /// store blob content everywhere it belongs
    ///
    /// short-circuits when the object already exists in any store; the
    /// compressed framed payload is what travels to the cache and remote.
    pub async fn create_blob(
        &self,
        content: &[u8],
        opts: &CreateBlobOptions,
        cancel: &CancellationToken,
    ) -> Result<BlobInfo> {
        let hash = hash::hash_blob(content);
        let key = hash.to_hex();

        let content_type = opts
            .content_type
            .clone()
            .or_else(|| codec::sniff_content_type(content, None).map(str::to_string));

        let presence = self.exists(&hash, cancel).await?;
        if presence.found() && (presence.remote || self.remote.is_none() || opts.skip_upload) {
            tracing::debug!(%hash, "blob already stored, skipping");
            let compressed_size = object::get(&self.repo, &hash)
                .map(|b| b.len() as u64)
                .unwrap_or(0);
            return Ok(self.blob_info(hash, content, content_type, compressed_size, opts));
        }

        let mut framed = hash::frame_header(ObjectKind::Blob, content.len());
        framed.extend_from_slice(content);
        let level = codec::adaptive_level(content.len() as u64, content_type.as_deref());
        let compressed = codec::compress(&framed, level)?;

        object::put(&self.repo, &hash, &compressed)?;
        self.cache.set(&key, &compressed, EntryKind::Content).await?;

        let mut remote_id = None;
        if !opts.skip_upload {
            if let Some(remote) = &self.remote {
                let id = remote
                    .upload(&key, &compressed, content_type.clone(), cancel)
                    .await?;
                remote_id = Some(id);
            }
        }

        if opts.verify {
            let (kind, payload) = object::read_object(&self.repo, &hash)?;
            hash::verify(&hash, kind, &payload)?;
        }

        let mut info =
            self.blob_info(hash, content, content_type, compressed.len() as u64, opts);
        info.remote_id = remote_id;
        Ok(info)
    }

    /// hash a file and store it as a blob
    pub async fn create_blob_from_path(
        &self,
        path: &Path,
        opts: &CreateBlobOptions,
        cancel: &CancellationToken,
    ) -> Result<BlobInfo> {
        let content = std::fs::read(path).map_err(|e| Error::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut opts = opts.clone();
        if opts.content_type.is_none() {
            opts.content_type = codec::sniff_content_type(
                &content,
                path.file_name().and_then(|n| n.to_str()),
            )
            .map(str::to_string);
        }
        self.create_blob(&content, &opts, cancel).await
    }

    /// read blob content through cache -> local -> remote, writing back
    /// to the warmer tiers on the way
    pub async fn get_blob(
        &self,
        hash: &Hash,
        opts: &GetBlobOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let compressed = self.get_object_bytes(hash, opts.context.as_ref(), cancel).await?;
        if opts.raw {
            return Ok(compressed);
        }

        let framed = codec::decompress(&compressed)?;
        let (kind, payload) = object::parse_frame(&framed)?;
        if kind != ObjectKind::Blob {
            return Err(Error::Format(format!("expected blob, found {}", kind)));
        }
        if opts.verify {
            hash::verify(hash, kind, payload)?;
        }
        Ok(payload.to_vec())
    }

    /// where, if anywhere, this object lives
    pub async fn exists(&self, hash: &Hash, cancel: &CancellationToken) -> Result<Presence> {
        let key = hash.to_hex();
        let mut presence = Presence {
            cache: false,
            local: object::exists(&self.repo, hash),
            remote: false,
        };
        presence.cache = self.cache.has(&key, cancel).await.unwrap_or(false) && !presence.local;
        if let Some(remote) = &self.remote {
            presence.remote = remote.exists(&key, cancel).await.unwrap_or(false);
        }
        Ok(presence)
    }

    /// verify content against a blob hash; with `thorough` the stored
    /// local and remote copies are checked too
    pub async fn verify_blob(
        &self,
        hash: &Hash,
        content: &[u8],
        thorough: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        hash::verify(hash, ObjectKind::Blob, content)?;

        if thorough {
            if object::exists(&self.repo, hash) {
                object::read_object(&self.repo, hash)?;
            }
            if let Some(remote) = &self.remote {
                let key = hash.to_hex();
                if remote.exists(&key, cancel).await? {
                    let compressed = remote.download(&key, cancel).await?;
                    let framed = codec::decompress(&compressed)?;
                    let (kind, payload) = object::parse_frame(&framed)?;
                    hash::verify(hash, kind, payload)?;
                }
            }
        }
        Ok(())
    }

    /// group paths by content hash; only groups with more than one path
    /// are returned
    pub fn find_duplicates(&self, paths: &[PathBuf]) -> Result<BTreeMap<Hash, Vec<PathBuf>>> {
        let mut groups: BTreeMap<Hash, Vec<PathBuf>> = BTreeMap::new();
        for path in paths {
            let content = std::fs::read(path).map_err(|e| Error::Io {
                path: path.clone(),
                source: e,
            })?;
            groups
                .entry(hash::hash_blob(&content))
                .or_default()
                .push(path.clone());
        }
        groups.retain(|_, paths| paths.len() > 1);
        Ok(groups)
    }

    /// enumerate local blobs with their sizes
    pub fn list_blobs(&self) -> Result<Vec<BlobInfo>> {
        let mut out = Vec::new();
        for hash in object::list(&self.repo)? {
            let compressed = object::get(&self.repo, &hash)?;
            let framed = codec::decompress(&compressed)?;
            let (kind, payload) = object::parse_frame(&framed)?;
            if kind != ObjectKind::Blob {
                continue;
            }
            out.push(BlobInfo {
                hash,
                size: payload.len() as u64,
                content_type: None,
                compressed_size: compressed.len() as u64,
                compression_ratio: ratio(compressed.len() as u64, payload.len() as u64),
                integrity: None,
                remote_id: None,
            });
        }
        Ok(out)
    }

    /// copy objects between the local store and the remote
    pub async fn migrate(
        &self,
        direction: MigrateDirection,
        hashes: &[Hash],
        cancel: &CancellationToken,
    ) -> Result<Report> {
        let remote = self.remote.as_ref().ok_or_else(|| Error::NotFound {
            kind: "remote",
            id: "blob service not configured".to_string(),
        })?;
        let mut report = Report::default();

        for hash in hashes {
            let key = hash.to_hex();
            let outcome = match direction {
                MigrateDirection::ToRemote => {
                    if remote.exists(&key, cancel).await? {
                        report.skipped.push(*hash);
                        continue;
                    }
                    match object::get(&self.repo, hash) {
                        Ok(compressed) => remote
                            .upload(&key, &compressed, None, cancel)
                            .await
                            .map(|_| ()),
                        Err(e) => Err(e),
                    }
                }
                MigrateDirection::ToLocal => {
                    if object::exists(&self.repo, hash) {
                        report.skipped.push(*hash);
                        continue;
                    }
                    match remote.download(&key, cancel).await {
                        Ok(compressed) => self
                            .verify_compressed(hash, &compressed)
                            .and_then(|_| object::put(&self.repo, hash, &compressed)),
                        Err(e) => Err(e),
                    }
                }
            };

            match outcome {
                Ok(()) => report.transferred.push(*hash),
                Err(e) => report.failed.push((*hash, e.to_string())),
            }
        }

        Ok(report)
    }

    /// compare local and remote copies, healing from the intact side
    pub async fn repair(
        &self,
        hashes: &[Hash],
        cancel: &CancellationToken,
    ) -> Result<Vec<(Hash, RepairOutcome)>> {
        let remote = self.remote.as_ref().ok_or_else(|| Error::NotFound {
            kind: "remote",
            id: "blob service not configured".to_string(),
        })?;
        let mut outcomes = Vec::new();

        for hash in hashes {
            let key = hash.to_hex();

            let local_ok = object::read_object(&self.repo, hash).is_ok();
            let remote_bytes = match remote.download(&key, cancel).await {
                Ok(bytes) => match self.verify_compressed(hash, &bytes) {
                    Ok(()) => Some(bytes),
                    Err(_) => None,
                },
                Err(_) => None,
            };

            let outcome = match (local_ok, remote_bytes) {
                (true, Some(_)) => RepairOutcome::Healthy,
                (true, None) => {
                    let compressed = object::get(&self.repo, hash)?;
                    remote.upload(&key, &compressed, None, cancel).await?;
                    tracing::warn!(%hash, "re-uploaded corrupt remote copy");
                    RepairOutcome::RepairedRemote
                }
                (false, Some(bytes)) => {
                    // replace the damaged local file before the idempotent put
                    let path = object::object_path(&self.repo, hash);
                    if path.exists() {
                        std::fs::remove_file(&path).map_err(|e| Error::Io {
                            path: path.clone(),
                            source: e,
                        })?;
                    }
                    object::put(&self.repo, hash, &bytes)?;
                    tracing::warn!(%hash, "restored corrupt local copy from remote");
                    RepairOutcome::RepairedLocal
                }
                (false, None) => RepairOutcome::Unrecoverable,
            };
            outcomes.push((*hash, outcome));
        }

        Ok(outcomes)
    }

    /// store a validated tree locally and remotely
    pub async fn create_tree(
        &self,
        entries: Vec<TreeEntry>,
        cancel: &CancellationToken,
    ) -> Result<(Hash, Tree)> {
        let tree = Tree::new(entries)?;
        let hash = self
            .store_object(ObjectKind::Tree, &tree.to_canonical_bytes(), cancel)
            .await?;
        Ok((hash, tree))
    }

    /// store a commit locally and remotely
    pub async fn create_commit(
        &self,
        commit: &Commit,
        cancel: &CancellationToken,
    ) -> Result<Hash> {
        self.store_object(ObjectKind::Commit, &commit.to_canonical_bytes(), cancel)
            .await
    }

    /// read a tree, falling back to the remote
    pub async fn get_tree(&self, hash: &Hash, cancel: &CancellationToken) -> Result<Tree> {
        let compressed = self.get_object_bytes(hash, None, cancel).await?;
        let framed = codec::decompress(&compressed)?;
        let (kind, payload) = object::parse_frame(&framed)?;
        if kind != ObjectKind::Tree {
            return Err(Error::Format(format!("expected tree, found {}", kind)));
        }
        hash::verify(hash, kind, payload)?;
        Tree::from_canonical_bytes(payload)
    }

    /// read a commit, falling back to the remote
    pub async fn get_commit(&self, hash: &Hash, cancel: &CancellationToken) -> Result<Commit> {
        let compressed = self.get_object_bytes(hash, None, cancel).await?;
        let framed = codec::decompress(&compressed)?;
        let (kind, payload) = object::parse_frame(&framed)?;
        if kind != ObjectKind::Commit {
            return Err(Error::Format(format!("expected commit, found {}", kind)));
        }
        hash::verify(hash, kind, payload)?;
        Commit::from_canonical_bytes(payload)
    }

    /// local store and cache totals
    pub fn stats(&self) -> Result<StorageStats> {
        let mut local_objects = 0u64;
        let mut local_bytes = 0u64;
        for hash in object::list(&self.repo)? {
            local_objects += 1;
            local_bytes += object::get(&self.repo, &hash)?.len() as u64;
        }
        Ok(StorageStats {
            local_objects,
            local_bytes,
            cache: self.cache.stats(),
        })
    }

    /// fetch compressed object bytes: cache, then local store, then
    /// remote, writing through to the warmer tiers
    async fn get_object_bytes(
        &self,
        hash: &Hash,
        context: Option<&CacheContext>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let key = hash.to_hex();

        let cached = match context {
            Some(ctx) => {
                self.cache
                    .clone()
                    .get_with_context(&key, ctx, cancel)
                    .await?
            }
            None => self.cache.get(&key, cancel).await?,
        };
        if let Some(bytes) = cached {
            return Ok(bytes);
        }

        if object::exists(&self.repo, hash) {
            let compressed = object::get(&self.repo, hash)?;
            self.cache.set(&key, &compressed, EntryKind::Content).await?;
            return Ok(compressed);
        }

        if let Some(remote) = &self.remote {
            let compressed = remote.download(&key, cancel).await?;
            self.verify_compressed(hash, &compressed)?;
            object::put(&self.repo, hash, &compressed)?;
            self.cache.set(&key, &compressed, EntryKind::Content).await?;
            return Ok(compressed);
        }

        Err(Error::object_not_found(hash))
    }

    /// store a framed payload locally, in cache, and remotely
    async fn store_object(
        &self,
        kind: ObjectKind,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Hash> {
        let (hash, _) = object::write_object(&self.repo, kind, payload)?;
        let key = hash.to_hex();
        let compressed = object::get(&self.repo, &hash)?;
        self.cache.set(&key, &compressed, EntryKind::Content).await?;

        if let Some(remote) = &self.remote {
            if !remote.exists(&key, cancel).await? {
                remote.upload(&key, &compressed, None, cancel).await?;
            }
        }
        Ok(hash)
    }

    fn verify_compressed(&self, hash: &Hash, compressed: &[u8]) -> Result<()> {
        let framed = codec::decompress(compressed)?;
        let (kind, payload) = object::parse_frame(&framed)?;
        hash::verify(hash, kind, payload)
    }

    fn blob_info(
        &self,
        hash: Hash,
        content: &[u8],
        content_type: Option<String>,
        compressed_size: u64,
        opts: &CreateBlobOptions,
    ) -> BlobInfo {
        let integrity = if opts.with_integrity {
            Some(hash::checksums(
                content,
                &[ChecksumAlgo::Sha1, ChecksumAlgo::Sha256, ChecksumAlgo::Blake2b],
            ))
        } else {
            None
        };
        BlobInfo {
            hash,
            size: content.len() as u64,
            content_type,
            compressed_size,
            compression_ratio: ratio(compressed_size, content.len() as u64),
            integrity,
            remote_id: None,
        }
    }
}

fn ratio(compressed: u64, uncompressed: u64) -> f64 {
    if uncompressed == 0 {
        1.0
    } else {
        compressed as f64 / uncompressed as f64
    }
}
