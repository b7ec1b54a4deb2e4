//! the commit data flow: snapshot the working directory, store and upload
//! blobs, build the tree, seal the manifest under a fresh dek, and record
//! everything on the ledger while advancing the branch in one transaction.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::crypto::{self, Dek};
use crate::engine::{CreateBlobOptions, ObjectEngine};
use crate::error::{Error, IoResultExt, Result};
use crate::hash::{self, Hash};
use crate::ledger::{LedgerTreeEntry, Operation, SubmitOptions, TxDigest};
use crate::manifest::{Manifest, ManifestEntry};
use crate::progress::Phase;
use crate::refs;
use crate::sync::{is_internal_path, SyncContext};
use crate::types::{Commit, EntryMode, TreeEntry};

/// options for the commit flow
#[derive(Clone, Debug)]
pub struct CommitOptions {
    pub message: String,
    /// defaults to the signer address
    pub author: Option<String>,
    /// encrypt file payloads and build a manifest when a key client and
    /// policy are available
    pub encrypt: bool,
}

impl CommitOptions {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            author: None,
            encrypt: true,
        }
    }
}

/// what a commit produced
#[derive(Clone, Debug)]
pub struct CommitReport {
    pub commit: Hash,
    pub tree: Hash,
    pub branch: String,
    pub files: usize,
    pub manifest_cid: Option<String>,
    pub wrapped_dek_cid: Option<String>,
    pub digest: Option<TxDigest>,
}

/// commit the working directory to the current branch
pub async fn commit(ctx: &SyncContext, opts: &CommitOptions) -> Result<CommitReport> {
    ctx.progress.emit(Phase::Preparing, "snapshotting working directory");

    let branch = current_branch(ctx)?;
    let parent = refs::resolve_head(&ctx.repo)?;

    // gather the snapshot before any async work
    let files = collect_files(ctx.repo.work_dir())?;

    let author = opts
        .author
        .clone()
        .or_else(|| ctx.signer.as_ref().map(|s| s.address().to_string()))
        .unwrap_or_else(|| "walgit".to_string());

    // hash, store and upload every blob
    let mut blob_map: BTreeMap<String, (Hash, EntryMode)> = BTreeMap::new();
    let mut blob_infos = Vec::new();
    for (rel_path, content, mode) in &files {
        let info = ctx
            .engine
            .create_blob(content, &CreateBlobOptions::default(), &ctx.cancel)
            .await?;
        blob_map.insert(rel_path.clone(), (info.hash, *mode));
        blob_infos.push((rel_path.clone(), info));
    }

    // canonical tree objects, bottom-up
    let (tree_hash, tree_ops) =
        build_tree(&ctx.engine, &blob_map, String::new(), &ctx.cancel).await?;

    // per-commit encryption: payloads, manifest, wrapped dek
    let mut manifest_cid = None;
    let mut wrapped_dek_cid = None;
    let mut encrypted_cids: BTreeMap<String, String> = BTreeMap::new();
    let policy_id = ctx.repo.config().repository.policy_id.clone();

    if opts.encrypt {
        if let (Some(key_client), Some(remote), Some(policy_id)) =
            (&ctx.key_client, ctx.engine.remote(), policy_id)
        {
            let dek = Dek::generate();
            let mut manifest = Manifest::new(
                author.clone(),
                opts.message.clone(),
                parent.map(|p| p.to_hex()),
            );

            for (rel_path, content, _) in &files {
                let content_type = codec::sniff_content_type(content, Some(rel_path));
                let level = codec::adaptive_level(content.len() as u64, content_type);
                let compressed = codec::compress(content, level)?;
                let payload = crypto::encrypt_framed(&compressed, &dek)?;
                let cid = hash::sha256_hex(&payload);
                remote
                    .upload(&cid, &payload, content_type.map(str::to_string), &ctx.cancel)
                    .await?;
                manifest.insert(
                    rel_path.clone(),
                    ManifestEntry {
                        cid: cid.clone(),
                        size: content.len() as u64,
                        hash: hash::sha256_hex(content),
                        encrypted: true,
                        timestamp: manifest.timestamp,
                    },
                );
                encrypted_cids.insert(rel_path.clone(), cid);
            }

            let sealed = manifest.seal(&dek)?;
            let cid = hash::sha256_hex(&sealed);
            remote.upload(&cid, &sealed, None, &ctx.cancel).await?;
            manifest_cid = Some(cid);

            let wrapped = key_client.wrap_dek(&dek, &policy_id).await?;
            let cid = hash::sha256_hex(&wrapped);
            remote.upload(&cid, &wrapped, None, &ctx.cancel).await?;
            wrapped_dek_cid = Some(cid);
        }
    }

    // the commit object itself
    let mut commit = Commit::new(
        tree_hash,
        parent.into_iter().collect(),
        author,
        opts.message.clone(),
    );
    commit.manifest_cid = manifest_cid.clone();
    commit.wrapped_dek_cid = wrapped_dek_cid.clone();
    let commit_hash = ctx.engine.create_commit(&commit, &ctx.cancel).await?;

    // one ledger transaction: objects plus the branch advance; objects a
    // previous commit already recorded are skipped, duplicates are refused
    // by the ledger
    let mut digest = None;
    if let (Some(tx_engine), Some(signer)) = (&ctx.tx, &ctx.signer) {
        let ledger = tx_engine.client();
        let mut builder = tx_engine.build();
        let mut recorded = HashSet::new();
        for (rel_path, info) in &blob_infos {
            if !recorded.insert(info.hash) || ledger.has_object(&ctx.repo_id, &info.hash).await? {
                continue;
            }
            let remote_id = encrypted_cids
                .get(rel_path)
                .cloned()
                .or_else(|| info.remote_id.clone())
                .unwrap_or_else(|| info.hash.to_hex());
            builder = builder.create_blob(remote_id, info.size, info.hash, "zlib");
        }
        for op in tree_ops {
            if let Operation::CreateTree { hash, .. } = &op {
                if ledger.has_object(&ctx.repo_id, hash).await? {
                    continue;
                }
            }
            builder = builder.push(op);
        }
        builder = builder.create_commit(
            commit_hash,
            tree_hash,
            commit.parents.clone(),
            commit.message.clone(),
            commit.timestamp.to_rfc3339(),
            manifest_cid.clone(),
            wrapped_dek_cid.clone(),
        );
        builder = builder.update_branch(&ctx.repo_id, &branch, commit_hash, parent);

        let submit_opts = SubmitOptions {
            progress: ctx.progress.clone(),
            cancel: ctx.cancel.clone(),
            ..Default::default()
        };
        let result = tx_engine
            .submit_and_wait(&builder.finish(), signer.as_ref(), &submit_opts)
            .await?;
        digest = Some(result.digest);
    }

    // local branch ref follows, guarded against concurrent movement
    refs::write_ref(
        &ctx.repo,
        &refs::branch_ref(&branch),
        &commit_hash,
        Some(&parent.unwrap_or(Hash::ZERO)),
    )?;

    tracing::info!(%commit_hash, %branch, files = files.len(), "committed");

    Ok(CommitReport {
        commit: commit_hash,
        tree: tree_hash,
        branch,
        files: files.len(),
        manifest_cid,
        wrapped_dek_cid,
        digest,
    })
}

/// branch HEAD points at; committing on a detached HEAD is refused
fn current_branch(ctx: &SyncContext) -> Result<String> {
    match refs::read_head(&ctx.repo)? {
        refs::Head::Symbolic(target) => match target.strip_prefix("refs/heads/") {
            Some(branch) => Ok(branch.to_string()),
            None => Err(Error::InvalidRef(target)),
        },
        refs::Head::Detached(_) => Err(Error::InvalidRef("HEAD is detached".to_string())),
    }
}

/// walk the working directory into (relative path, content, mode),
/// sorted by path
fn collect_files(work_dir: &Path) -> Result<Vec<(String, Vec<u8>, EntryMode)>> {
    let mut files = Vec::new();

    for entry in walkdir::WalkDir::new(work_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_internal_path(e.path()))
    {
        let entry = entry.map_err(|e| Error::Io {
            path: work_dir.to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(work_dir)
            .map_err(|_| Error::Format("path outside working directory".to_string()))?
            .to_string_lossy()
            .to_string();

        let content = std::fs::read(entry.path()).with_path(entry.path())?;
        let mode = file_mode(entry.path())?;
        files.push((rel, content, mode));
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Result<EntryMode> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path).with_path(path)?.permissions().mode();
    Ok(if mode & 0o111 != 0 {
        EntryMode::BlobExecutable
    } else {
        EntryMode::Blob
    })
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Result<EntryMode> {
    Ok(EntryMode::Blob)
}

/// build nested tree objects for every directory under `prefix`;
/// returns the subtree hash and the ledger operations recording each tree
pub(crate) fn build_tree<'a>(
    engine: &'a ObjectEngine,
    files: &'a BTreeMap<String, (Hash, EntryMode)>,
    prefix: String,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<(Hash, Vec<Operation>)>> {
    async move {
        let mut entries = Vec::new();
        let mut ops = Vec::new();
        let mut seen_dirs = Vec::new();

        for (path, (hash, mode)) in files.range(prefix.clone()..) {
            let rest = match strip_tree_prefix(path, &prefix) {
                Some(rest) => rest,
                None => break, // past the prefix range
            };

            match rest.split_once('/') {
                None => {
                    entries.push(TreeEntry::new(rest, *mode, *hash));
                }
                Some((dir, _)) => {
                    if seen_dirs.last().map(String::as_str) == Some(dir) {
                        continue;
                    }
                    seen_dirs.push(dir.to_string());

                    let child_prefix = if prefix.is_empty() {
                        format!("{}/", dir)
                    } else {
                        format!("{}{}/", prefix, dir)
                    };
                    let (child_hash, child_ops) =
                        build_tree(engine, files, child_prefix, cancel).await?;
                    ops.extend(child_ops);
                    entries.push(TreeEntry::new(dir, EntryMode::Tree, child_hash));
                }
            }
        }

        let (tree_hash, tree) = engine.create_tree(entries, cancel).await?;
        ops.push(Operation::CreateTree {
            hash: tree_hash,
            entries: tree
                .entries()
                .iter()
                .map(|e| LedgerTreeEntry {
                    name: e.name.clone(),
                    kind: if e.mode.is_tree() { "tree" } else { "blob" }.to_string(),
                    id: e.id,
                    mode: e.mode.octal(),
                })
                .collect(),
        });

        Ok((tree_hash, ops))
    }
    .boxed()
}

/// strip a directory prefix (ending in '/') from a path inside it
fn strip_tree_prefix<'p>(path: &'p str, prefix: &str) -> Option<&'p str> {
    if prefix.is_empty() {
        Some(path)
    } else {
        path.strip_prefix(prefix)
    }
}
