//! stash store
//!
//! snapshots of uncommitted work under `.walgit/stash/<id>/`, split into
//! staged, unstaged and untracked areas, with a json index of stash ids
//! ordered newest first.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};
use crate::refs;
use crate::repo::Repo;
use crate::sync::{ChangeKind, WorkingSetStatus};

/// which snapshot area a file was taken from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StashArea {
    Staged,
    Unstaged,
    Untracked,
}

impl StashArea {
    fn dir_name(&self) -> &'static str {
        match self {
            StashArea::Staged => "staged",
            StashArea::Unstaged => "unstaged",
            StashArea::Untracked => "untracked",
        }
    }
}

/// per-stash metadata.json
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StashMetadata {
    pub id: String,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// branch HEAD pointed at when the stash was taken
    pub branch: Option<String>,
    /// relative path -> area it was snapshotted from
    pub files: BTreeMap<String, StashArea>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StashIndex {
    /// newest first
    stashes: Vec<String>,
}

/// snapshot the changed files reported by the scanner
pub fn save(
    repo: &Repo,
    status: &WorkingSetStatus,
    message: Option<&str>,
) -> Result<StashMetadata> {
    let id = uuid::Uuid::new_v4().to_string();
    let stash_dir = repo.stash_path().join(&id);

    let branch = match refs::read_head(repo)? {
        refs::Head::Symbolic(target) => target
            .strip_prefix("refs/heads/")
            .map(str::to_string),
        refs::Head::Detached(_) => None,
    };

    let mut files = BTreeMap::new();

    for (path, kind) in &status.staged {
        if *kind != ChangeKind::Deleted {
            snapshot_file(repo, &stash_dir, StashArea::Staged, path)?;
            files.insert(rel_str(path), StashArea::Staged);
        }
    }
    for (path, kind) in &status.unstaged {
        if *kind != ChangeKind::Deleted {
            snapshot_file(repo, &stash_dir, StashArea::Unstaged, path)?;
            files.insert(rel_str(path), StashArea::Unstaged);
        }
    }
    for path in &status.untracked {
        snapshot_file(repo, &stash_dir, StashArea::Untracked, path)?;
        files.insert(rel_str(path), StashArea::Untracked);
    }

    let metadata = StashMetadata {
        id: id.clone(),
        message: message.map(str::to_string),
        created_at: Utc::now(),
        branch,
        files,
    };

    let metadata_path = stash_dir.join("metadata.json");
    fs::create_dir_all(&stash_dir).with_path(&stash_dir)?;
    fs::write(&metadata_path, serde_json::to_vec_pretty(&metadata)?).with_path(&metadata_path)?;

    let mut index = read_index(repo)?;
    index.stashes.insert(0, id);
    write_index(repo, &index)?;

    Ok(metadata)
}

/// stashes, newest first
pub fn list(repo: &Repo) -> Result<Vec<StashMetadata>> {
    let index = read_index(repo)?;
    index
        .stashes
        .iter()
        .map(|id| show(repo, id))
        .collect()
}

/// metadata of one stash
pub fn show(repo: &Repo, id: &str) -> Result<StashMetadata> {
    let path = repo.stash_path().join(id).join("metadata.json");
    let content = fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound {
                kind: "stash",
                id: id.to_string(),
            }
        } else {
            Error::Io { path, source: e }
        }
    })?;
    Ok(serde_json::from_slice(&content)?)
}

/// copy a stash's files back into the working directory; plain file
/// copies, no merging
pub fn apply(repo: &Repo, id: &str) -> Result<usize> {
    let metadata = show(repo, id)?;
    let stash_dir = repo.stash_path().join(id);

    let mut restored = 0usize;
    for (rel_path, area) in &metadata.files {
        let source = stash_dir.join(area.dir_name()).join(rel_path);
        let target = repo.work_dir().join(rel_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        fs::copy(&source, &target).with_path(&source)?;
        restored += 1;
    }

    Ok(restored)
}

/// delete a stash and its index entry
pub fn drop(repo: &Repo, id: &str) -> Result<()> {
    let stash_dir = repo.stash_path().join(id);
    if !stash_dir.exists() {
        return Err(Error::NotFound {
            kind: "stash",
            id: id.to_string(),
        });
    }
    fs::remove_dir_all(&stash_dir).with_path(&stash_dir)?;

    let mut index = read_index(repo)?;
    index.stashes.retain(|s| s != id);
    write_index(repo, &index)
}

/// apply then drop
pub fn pop(repo: &Repo, id: &str) -> Result<usize> {
    let restored = apply(repo, id)?;
    drop(repo, id)?;
    Ok(restored)
}

fn snapshot_file(repo: &Repo, stash_dir: &Path, area: StashArea, rel_path: &Path) -> Result<()> {
    let source = repo.work_dir().join(rel_path);
    let target = stash_dir.join(area.dir_name()).join(rel_path);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }
    fs::copy(&source, &target).with_path(&source)?;
    Ok(())
}

fn rel_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn index_path(repo: &Repo) -> PathBuf {
    repo.stash_path().join("stash-index.json")
}

fn read_index(repo: &Repo) -> Result<StashIndex> {
    let path = index_path(repo);
    if !path.exists() {
        return Ok(StashIndex::default());
    }
    let content = fs::read(&path).with_path(&path)?;
    Ok(serde_json::from_slice(&content)?)
}

fn write_index(repo: &Repo, index: &StashIndex) -> Result<()> {
    let path = index_path(repo);
    fs::write(&path, serde_json::to_vec_pretty(index)?).with_path(&path)?;
    Ok(())
}
