//! pull: fetch, reconcile histories, then materialize changed files in
//! the working directory, backing up local edits that would be lost.

use std::collections::BTreeMap;

use crate::codec;
use crate::crypto::Dek;
use crate::engine::GetBlobOptions;
use crate::error::{Error, IoResultExt, Result};
use crate::hash::{self, Hash};
use crate::history;
use crate::manifest::Manifest;
use crate::progress::Phase;
use crate::refs;
use crate::sync::{
    backup_working_file, changed_paths, fetch, flatten_tree, working_file_sha256, FetchOptions,
    FetchReport, SyncContext,
};
use crate::types::{Commit, EntryMode};

/// options for a pull
#[derive(Clone, Debug, Default)]
pub struct PullOptions {
    pub fetch: FetchOptions,
}

/// what a pull changed
#[derive(Debug)]
pub struct PullReport {
    pub branch: String,
    pub fetched: FetchReport,
    pub updated_files: usize,
    pub removed_files: usize,
    /// paths backed up to `<path>.local`, or the divergent paths when the
    /// histories forked
    pub conflicts: Vec<String>,
    pub diverged: bool,
    pub new_tip: Option<Hash>,
}

/// pull a branch: fetch and apply to the working directory
pub async fn pull(
    ctx: &SyncContext,
    branch: Option<&str>,
    opts: &PullOptions,
) -> Result<PullReport> {
    let fetched = fetch(ctx, branch, &opts.fetch).await?;
    let branch = fetched.branch.clone();

    let remote_tip = match fetched.remote_tip {
        Some(tip) => tip,
        None => {
            return Ok(PullReport {
                branch,
                fetched,
                updated_files: 0,
                removed_files: 0,
                conflicts: vec![],
                diverged: false,
                new_tip: None,
            })
        }
    };

    let local_tip = refs::read_ref(&ctx.repo, &refs::branch_ref(&branch))?;

    // reconcile histories before touching any file
    if let Some(local_tip) = local_tip {
        if local_tip == remote_tip {
            return Ok(PullReport {
                branch,
                fetched,
                updated_files: 0,
                removed_files: 0,
                conflicts: vec![],
                diverged: false,
                new_tip: Some(local_tip),
            });
        }

        let cmp = history::compare(&ctx.repo, &local_tip, &remote_tip)?;
        if cmp.diverged {
            // no merge machinery: mark the divergent paths and stop
            let conflicts = divergent_paths(ctx, &local_tip, &remote_tip).await?;
            tracing::warn!(%branch, conflicts = conflicts.len(), "histories diverged");
            return Ok(PullReport {
                branch,
                fetched,
                updated_files: 0,
                removed_files: 0,
                conflicts,
                diverged: true,
                new_tip: None,
            });
        }
        if cmp.remote_ahead == 0 {
            // local is ahead; nothing to apply
            return Ok(PullReport {
                branch,
                fetched,
                updated_files: 0,
                removed_files: 0,
                conflicts: vec![],
                diverged: false,
                new_tip: Some(local_tip),
            });
        }
    }

    ctx.progress.emit(Phase::Executing, "applying files");

    let old_flat = match local_tip {
        Some(tip) => {
            let commit = ctx.engine.get_commit(&tip, &ctx.cancel).await?;
            flatten_tree(&ctx.engine, &commit.tree, &ctx.cancel).await?
        }
        None => BTreeMap::new(),
    };
    let remote_commit = ctx.engine.get_commit(&remote_tip, &ctx.cancel).await?;
    let new_flat = flatten_tree(&ctx.engine, &remote_commit.tree, &ctx.cancel).await?;

    let (updated, removed) = changed_paths(&old_flat, &new_flat);

    // index hashes from the external scanner decide what counts as a
    // local modification
    let index = match &ctx.scanner {
        Some(scanner) => scanner.status()?.index,
        None => BTreeMap::new(),
    };

    let reader = ContentReader::open(ctx, &remote_commit).await?;

    let mut conflicts = Vec::new();
    let mut updated_files = 0usize;

    for path in &updated {
        let (blob_hash, mode) = new_flat[path];

        if is_locally_modified(ctx, path, &index)? {
            let backup = backup_working_file(&ctx.repo, path)?;
            tracing::warn!(%path, backup = %backup.display(), "backed up local edit");
            conflicts.push(path.clone());
        }

        let content = reader.read(ctx, path, &blob_hash, &new_flat, mode).await?;
        crate::sync::write_working_file(&ctx.repo, path, &content, mode)?;
        updated_files += 1;
    }

    let mut removed_files = 0usize;
    for path in &removed {
        if is_locally_modified(ctx, path, &index)? {
            let backup = backup_working_file(&ctx.repo, path)?;
            tracing::warn!(%path, backup = %backup.display(), "backed up local edit");
            conflicts.push(path.clone());
        }
        let full = ctx.repo.work_dir().join(path);
        if full.exists() {
            std::fs::remove_file(&full).with_path(&full)?;
            removed_files += 1;
        }
    }

    // advance the branch and leave HEAD attached to it
    refs::write_ref(
        &ctx.repo,
        &refs::branch_ref(&branch),
        &remote_tip,
        local_tip.as_ref(),
    )?;

    ctx.progress.emit(
        Phase::Completed,
        format!("updated {} files", updated_files),
    );
    tracing::info!(
        %branch,
        updated_files,
        removed_files,
        conflicts = conflicts.len(),
        "pull complete"
    );

    Ok(PullReport {
        branch,
        fetched,
        updated_files,
        removed_files,
        conflicts,
        diverged: false,
        new_tip: Some(remote_tip),
    })
}

/// a file is locally modified when its working bytes disagree with the
/// hash the index recorded for it
fn is_locally_modified(
    ctx: &SyncContext,
    path: &str,
    index: &BTreeMap<String, String>,
) -> Result<bool> {
    let index_hash = match index.get(path) {
        Some(h) => h,
        None => return Ok(false),
    };
    match working_file_sha256(&ctx.repo, path)? {
        Some(working_hash) => Ok(&working_hash != index_hash),
        None => Ok(false),
    }
}

/// paths that differ between two tips, reported when a merge would be
/// needed
async fn divergent_paths(
    ctx: &SyncContext,
    local: &Hash,
    remote: &Hash,
) -> Result<Vec<String>> {
    let local_commit = ctx.engine.get_commit(local, &ctx.cancel).await?;
    let remote_commit = ctx.engine.get_commit(remote, &ctx.cancel).await?;
    let local_flat = flatten_tree(&ctx.engine, &local_commit.tree, &ctx.cancel).await?;
    let remote_flat = flatten_tree(&ctx.engine, &remote_commit.tree, &ctx.cancel).await?;

    let (mut changed, mut removed) = changed_paths(&local_flat, &remote_flat);
    changed.append(&mut removed);
    changed.sort();
    Ok(changed)
}

/// file-content source for a pull: the commit's sealed manifest when a
/// dek can be unwrapped, otherwise direct blob objects
pub(crate) enum ContentReader {
    Manifest { manifest: Manifest, dek: Dek },
    Objects,
}

impl ContentReader {
    pub(crate) async fn open(ctx: &SyncContext, commit: &Commit) -> Result<Self> {
        let (manifest_cid, wrapped_dek_cid) = match (&commit.manifest_cid, &commit.wrapped_dek_cid)
        {
            (Some(m), Some(w)) => (m, w),
            _ => return Ok(ContentReader::Objects),
        };
        let (key_client, session) = match (&ctx.key_client, &ctx.session) {
            (Some(k), Some(s)) => (k, s),
            _ => return Ok(ContentReader::Objects),
        };
        let remote = match ctx.engine.remote() {
            Some(remote) => remote,
            None => return Ok(ContentReader::Objects),
        };
        let policy_id = match &ctx.repo.config().repository.policy_id {
            Some(p) => p.clone(),
            None => return Ok(ContentReader::Objects),
        };

        let wrapped = remote.download(wrapped_dek_cid, &ctx.cancel).await?;
        let dek = key_client
            .unwrap_dek(&wrapped, &policy_id, session)
            .await?;
        let sealed = remote.download(manifest_cid, &ctx.cancel).await?;
        let manifest = Manifest::open(&sealed, &dek)?;

        Ok(ContentReader::Manifest { manifest, dek })
    }

    /// fetch one file's plaintext, verifying the recorded sha256
    pub(crate) async fn read(
        &self,
        ctx: &SyncContext,
        path: &str,
        blob_hash: &Hash,
        flat: &BTreeMap<String, (Hash, EntryMode)>,
        _mode: EntryMode,
    ) -> Result<Vec<u8>> {
        match self {
            ContentReader::Manifest { manifest, dek } => {
                let entry = manifest.tree.get(path).ok_or_else(|| Error::NotFound {
                    kind: "manifest entry",
                    id: path.to_string(),
                })?;
                let remote = ctx.engine.remote().ok_or_else(|| Error::NotFound {
                    kind: "blob",
                    id: entry.cid.clone(),
                })?;
                let payload = remote.download(&entry.cid, &ctx.cancel).await?;
                let compressed = crate::crypto::decrypt_framed(&payload, dek)?;
                let content = codec::decompress(&compressed)?;

                let got = hash::sha256_hex(&content);
                if got != entry.hash {
                    return Err(Error::Integrity {
                        expected: entry.hash.clone(),
                        got,
                        algo: "sha256",
                    });
                }
                Ok(content)
            }
            ContentReader::Objects => {
                // hint the prefetcher with sibling blobs of the same directory
                let dir = path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
                let related: Vec<String> = flat
                    .iter()
                    .filter(|(p, _)| {
                        p.as_str() != path
                            && p.rsplit_once('/').map(|(d, _)| d).unwrap_or("") == dir
                    })
                    .take(8)
                    .map(|(_, (h, _))| h.to_hex())
                    .collect();

                let opts = GetBlobOptions {
                    verify: true,
                    context: Some(
                        crate::cache::CacheContext::for_path(path).with_related(related),
                    ),
                    ..Default::default()
                };
                ctx.engine.get_blob(blob_hash, &opts, &ctx.cancel).await
            }
        }
    }
}
