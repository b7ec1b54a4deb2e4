//! sync protocol: commit, push, fetch, pull, clone
//!
//! orchestrates the object engine, the transaction engine and the blob
//! transport to reconcile local and remote histories.

pub mod clone;
pub mod commit;
pub mod fetch;
pub mod pull;
pub mod push;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use clone::{clone, CloneContext, CloneOptions, CloneReport};
pub use commit::{commit, CommitOptions, CommitReport};
pub use fetch::{fetch, FetchOptions, FetchReport};
pub use pull::{pull, PullOptions, PullReport};
pub use push::{push, BatchReport, PushOptions, PushReport};

use crate::crypto::{KeyWrapClient, SessionSignature};
use crate::engine::ObjectEngine;
use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::ledger::{LedgerClient, Signer, TxEngine};
use crate::progress::Progress;
use crate::repo::Repo;
use crate::types::EntryMode;

/// file-level change kinds as reported by the workspace scanner
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// snapshot of the working directory produced by the external scanner
#[derive(Clone, Debug, Default)]
pub struct WorkingSetStatus {
    pub staged: Vec<(PathBuf, ChangeKind)>,
    pub unstaged: Vec<(PathBuf, ChangeKind)>,
    pub untracked: Vec<PathBuf>,
    /// path -> sha256 hex recorded in the index
    pub index: BTreeMap<String, String>,
}

/// the working-directory staging/status scanner is an external
/// collaborator; the core only consumes its snapshots
pub trait WorkspaceScanner: Send + Sync {
    fn status(&self) -> Result<WorkingSetStatus>;
}

/// everything a sync operation needs, passed explicitly
pub struct SyncContext {
    pub repo: Arc<Repo>,
    pub engine: Arc<ObjectEngine>,
    /// absent when WALGIT_USE_BLOCKCHAIN is off
    pub tx: Option<Arc<TxEngine>>,
    pub signer: Option<Arc<dyn Signer>>,
    pub key_client: Option<Arc<dyn KeyWrapClient>>,
    /// wallet-approved session for dek unwrap
    pub session: Option<SessionSignature>,
    pub scanner: Option<Arc<dyn WorkspaceScanner>>,
    /// ledger object id of the repository
    pub repo_id: String,
    pub remote_name: String,
    pub progress: Progress,
    pub cancel: CancellationToken,
}

impl SyncContext {
    /// the ledger client, when configured
    pub fn ledger(&self) -> Result<&Arc<dyn LedgerClient>> {
        self.tx.as_ref().map(|tx| tx.client()).ok_or_else(|| {
            Error::Auth {
                kind: crate::error::AuthErrorKind::Permission,
                message: "operation requires ledger access".to_string(),
            }
        })
    }

    /// ledger operations need both an endpoint and a signer
    pub fn require_ledger(&self) -> Result<(&Arc<TxEngine>, &Arc<dyn Signer>)> {
        match (&self.tx, &self.signer) {
            (Some(tx), Some(signer)) => Ok((tx, signer)),
            _ => Err(Error::Auth {
                kind: crate::error::AuthErrorKind::Permission,
                message: "operation requires ledger access and a signer".to_string(),
            }),
        }
    }

    /// pass-through to the external working-directory scanner
    pub fn status(&self) -> Result<WorkingSetStatus> {
        match &self.scanner {
            Some(scanner) => scanner.status(),
            None => Err(Error::NotFound {
                kind: "scanner",
                id: "workspace scanner not configured".to_string(),
            }),
        }
    }
}

/// flatten a tree into path -> (blob hash, mode), recursing subtrees
pub(crate) async fn flatten_tree(
    engine: &ObjectEngine,
    root: &Hash,
    cancel: &CancellationToken,
) -> Result<BTreeMap<String, (Hash, EntryMode)>> {
    let mut out = BTreeMap::new();
    let mut stack = vec![(String::new(), *root)];

    while let Some((prefix, tree_hash)) = stack.pop() {
        let tree = engine.get_tree(&tree_hash, cancel).await?;
        for entry in tree.entries() {
            let path = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", prefix, entry.name)
            };
            match entry.mode {
                EntryMode::Tree => stack.push((path, entry.id)),
                mode => {
                    out.insert(path, (entry.id, mode));
                }
            }
        }
    }

    Ok(out)
}

/// paths whose blob differs between two flattened trees (added or
/// modified on the new side, plus deletions)
pub(crate) fn changed_paths(
    old: &BTreeMap<String, (Hash, EntryMode)>,
    new: &BTreeMap<String, (Hash, EntryMode)>,
) -> (Vec<String>, Vec<String>) {
    let mut updated = Vec::new();
    let mut removed = Vec::new();

    for (path, (hash, _)) in new {
        match old.get(path) {
            Some((old_hash, _)) if old_hash == hash => {}
            _ => updated.push(path.clone()),
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            removed.push(path.clone());
        }
    }

    (updated, removed)
}

/// materialize one file in the working directory
pub(crate) fn write_working_file(
    repo: &Repo,
    rel_path: &str,
    content: &[u8],
    mode: EntryMode,
) -> Result<()> {
    let path = repo.work_dir().join(rel_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_path(parent)?;
    }
    std::fs::write(&path, content).with_path(&path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode.posix()))
            .with_path(&path)?;
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
    }

    Ok(())
}

/// back up a locally modified file before overwriting it
pub(crate) fn backup_working_file(repo: &Repo, rel_path: &str) -> Result<PathBuf> {
    let path = repo.work_dir().join(rel_path);
    let backup = repo.work_dir().join(format!("{}.local", rel_path));
    std::fs::copy(&path, &backup).with_path(&path)?;
    Ok(backup)
}

/// sha256 hex of a working file, None when it does not exist
pub(crate) fn working_file_sha256(repo: &Repo, rel_path: &str) -> Result<Option<String>> {
    let path = repo.work_dir().join(rel_path);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(Some(crate::hash::sha256_hex(&bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io { path, source: e }),
    }
}

/// true for paths that never belong in a snapshot
pub(crate) fn is_internal_path(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str() == crate::repo::WALGIT_DIR
    })
}
