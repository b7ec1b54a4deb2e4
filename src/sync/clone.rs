//! clone: resolve a repository on the ledger, unwrap its dek through the
//! wallet, fetch the manifest, and materialize the working tree.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::MultiCache;
use crate::codec;
use crate::config::StorageConfig;
use crate::crypto::{KeyWrapClient, SessionSignature};
use crate::engine::ObjectEngine;
use crate::error::{Error, Result};
use crate::hash::{self, Hash};
use crate::ledger::LedgerClient;
use crate::manifest::Manifest;
use crate::refs;
use crate::remote::RemoteStore;
use crate::repo::Repo;
use crate::sync::{flatten_tree, write_working_file};
use crate::types::EntryMode;

/// collaborators a clone needs before any repository exists
pub struct CloneContext {
    pub ledger: Arc<dyn LedgerClient>,
    pub remote: Arc<RemoteStore>,
    pub key_client: Arc<dyn KeyWrapClient>,
    pub session: SessionSignature,
    pub storage: StorageConfig,
    pub cancel: CancellationToken,
}

/// options for a clone
#[derive(Clone, Debug, Default)]
pub struct CloneOptions {
    /// branch to check out; the repository default when absent
    pub branch: Option<String>,
    /// local repository name; falls back to the ledger id
    pub name: Option<String>,
    /// threshold policy guarding the repository deks
    pub policy_id: Option<String>,
}

/// what a clone produced
#[derive(Debug)]
pub struct CloneReport {
    pub branch: String,
    pub tip: Hash,
    pub commits_fetched: usize,
    pub files_written: usize,
}

/// clone a repository into a target directory
pub async fn clone(
    ctx: &CloneContext,
    repo_id: &str,
    target_dir: &Path,
    opts: &CloneOptions,
) -> Result<(Repo, CloneReport)> {
    let branch = opts.branch.clone().unwrap_or_else(|| "main".to_string());

    let tip = ctx
        .ledger
        .get_branch(repo_id, &branch)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: "repository",
            id: format!("{}#{}", repo_id, branch),
        })?;

    // initialize the local mirror
    let name = opts.name.clone().unwrap_or_else(|| repo_id.to_string());
    let mut repo = Repo::init(target_dir, &name)?;
    {
        let config = repo.config_mut();
        config.repository.id = Some(repo_id.to_string());
        config.repository.default_branch = branch.clone();
        config.repository.policy_id = opts.policy_id.clone();
        config.add_remote("origin", repo_id)?;
    }
    repo.save_config()?;
    let repo = Arc::new(repo);

    let cache = Arc::new(MultiCache::open(
        &repo.walgit_path().join("cache"),
        &ctx.storage,
    )?);
    let engine = ObjectEngine::new(repo.clone(), cache, Some(ctx.remote.clone()));

    // mirror the commit chain and its trees
    let mut commits_fetched = 0usize;
    let mut queue = vec![tip];
    let mut visited: HashSet<Hash> = HashSet::new();
    let mut tip_commit = None;

    while let Some(commit_hash) = queue.pop() {
        if !visited.insert(commit_hash) {
            continue;
        }
        let commit = engine.get_commit(&commit_hash, &ctx.cancel).await?;
        commits_fetched += 1;
        flatten_tree(&engine, &commit.tree, &ctx.cancel).await?;
        for parent in &commit.parents {
            queue.push(*parent);
        }
        if commit_hash == tip {
            tip_commit = Some(commit);
        }
    }

    let tip_commit = match tip_commit {
        Some(c) => c,
        None => engine.get_commit(&tip, &ctx.cancel).await?,
    };

    // the dek and manifest gate the working tree
    let manifest_cid = tip_commit.manifest_cid.as_ref().ok_or_else(|| {
        Error::NotFound {
            kind: "manifest",
            id: tip.to_hex(),
        }
    })?;
    let wrapped_dek_cid = tip_commit.wrapped_dek_cid.as_ref().ok_or_else(|| {
        Error::NotFound {
            kind: "wrapped dek",
            id: tip.to_hex(),
        }
    })?;
    let policy_id = opts
        .policy_id
        .clone()
        .ok_or_else(|| Error::Crypto(crate::error::CryptoError::Policy("unset".to_string())))?;

    let wrapped = ctx.remote.download(wrapped_dek_cid, &ctx.cancel).await?;
    let dek = ctx
        .key_client
        .unwrap_dek(&wrapped, &policy_id, &ctx.session)
        .await?;
    let sealed = ctx.remote.download(manifest_cid, &ctx.cancel).await?;
    let manifest = Manifest::open(&sealed, &dek)?;

    // modes come from the tree; content comes from the manifest payloads
    let flat = flatten_tree(&engine, &tip_commit.tree, &ctx.cancel).await?;

    let mut files_written = 0usize;
    for (path, entry) in &manifest.tree {
        let payload = ctx.remote.download(&entry.cid, &ctx.cancel).await?;
        let compressed = crate::crypto::decrypt_framed(&payload, &dek)?;
        let content = codec::decompress(&compressed)?;

        let got = hash::sha256_hex(&content);
        if got != entry.hash {
            return Err(Error::Integrity {
                expected: entry.hash.clone(),
                got,
                algo: "sha256",
            });
        }

        let mode = flat
            .get(path)
            .map(|(_, mode)| *mode)
            .unwrap_or(EntryMode::Blob);
        write_working_file(&repo, path, &content, mode)?;
        files_written += 1;
    }

    // refs and HEAD complete the mirror
    refs::write_ref(&repo, &refs::branch_ref(&branch), &tip, None)?;
    refs::write_ref(&repo, &refs::remote_ref("origin", &branch), &tip, None)?;
    refs::write_head_symbolic(&repo, &refs::branch_ref(&branch))?;

    tracing::info!(
        repo_id,
        %branch,
        commits = commits_fetched,
        files = files_written,
        "clone complete"
    );

    let report = CloneReport {
        branch,
        tip,
        commits_fetched,
        files_written,
    };

    // hand back an owned handle; the engine keeps its own Arc
    let repo = Repo::open(target_dir)?;
    Ok((repo, report))
}
