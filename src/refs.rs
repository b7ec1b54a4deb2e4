use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::repo::Repo;

/// full ref name for a branch
pub fn branch_ref(name: &str) -> String {
    format!("refs/heads/{}", name)
}

/// full ref name for a tag
pub fn tag_ref(name: &str) -> String {
    format!("refs/tags/{}", name)
}

/// full ref name for a remote-tracking branch
pub fn remote_ref(remote: &str, branch: &str) -> String {
    format!("refs/remotes/{}/{}", remote, branch)
}

/// read a ref, returning None when it does not exist
pub fn read_ref(repo: &Repo, ref_name: &str) -> Result<Option<Hash>> {
    let path = ref_file(repo, ref_name);
    let content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io { path, source: e }),
    };
    Ok(Some(Hash::from_hex(content.trim())?))
}

/// write a ref (create or update)
///
/// when `old` is provided the write is compare-and-set: it succeeds only
/// if the ref currently points at `old` (or is absent when `old` is the
/// zero hash). unconditional otherwise.
pub fn write_ref(repo: &Repo, ref_name: &str, hash: &Hash, old: Option<&Hash>) -> Result<()> {
    validate_ref_name(ref_name)?;

    // serialize cas attempts through the repo lock so losers observe the
    // winning value rather than a torn read
    let _guard = if old.is_some() {
        Some(acquire_lock(repo)?)
    } else {
        None
    };

    if let Some(expected) = old {
        let current = read_ref(repo, ref_name)?;
        let matches = match current {
            Some(actual) => actual == *expected,
            None => *expected == Hash::ZERO,
        };
        if !matches {
            return Err(Error::CasFailure {
                name: ref_name.to_string(),
                expected: expected.to_hex(),
                actual: current.map(|h| h.to_hex()).unwrap_or_else(|| "<none>".into()),
            });
        }
    }

    let ref_path = ref_file(repo, ref_name);
    if let Some(parent) = ref_path.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }

    // atomic write: temp -> fsync -> rename
    let tmp_path = repo.tmp_path().join(uuid::Uuid::new_v4().to_string());
    {
        let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
        writeln!(tmp_file, "{}", hash.to_hex()).with_path(&tmp_path)?;
        tmp_file.sync_all().with_path(&tmp_path)?;
    }
    fs::rename(&tmp_path, &ref_path).with_path(&ref_path)?;

    if let Some(parent) = ref_path.parent() {
        let dir = File::open(parent).with_path(parent)?;
        dir.sync_all().with_path(parent)?;
    }

    Ok(())
}

/// delete a ref
pub fn delete_ref(repo: &Repo, ref_name: &str) -> Result<()> {
    let path = ref_file(repo, ref_name);
    fs::remove_file(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::ref_not_found(ref_name)
        } else {
            Error::Io { path, source: e }
        }
    })
}

/// check if a ref exists
pub fn ref_exists(repo: &Repo, ref_name: &str) -> bool {
    ref_file(repo, ref_name).exists()
}

/// list refs under a prefix (e.g. "refs/heads"), sorted by name
pub fn list_refs(repo: &Repo, prefix: &str) -> Result<Vec<(String, Hash)>> {
    let walgit = repo.walgit_path();
    let base = walgit.join(prefix);
    let mut refs = Vec::new();

    if base.exists() {
        collect_refs(&walgit, &base, &mut refs)?;
    }

    refs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(refs)
}

/// state of the HEAD pointer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Head {
    /// `ref: refs/heads/<branch>`
    Symbolic(String),
    /// direct commit hash
    Detached(Hash),
}

/// parse HEAD; a leading `"ref: "` marks a symbolic reference, anything
/// else must be a commit hash
pub fn read_head(repo: &Repo) -> Result<Head> {
    let path = repo.head_path();
    let content = fs::read_to_string(&path).with_path(&path)?;
    let line = content.trim();

    if let Some(target) = line.strip_prefix("ref: ") {
        Ok(Head::Symbolic(target.trim().to_string()))
    } else {
        Ok(Head::Detached(Hash::from_hex(line)?))
    }
}

/// point HEAD at a branch ref
pub fn write_head_symbolic(repo: &Repo, ref_name: &str) -> Result<()> {
    validate_ref_name(ref_name)?;
    let path = repo.head_path();
    fs::write(&path, format!("ref: {}\n", ref_name)).with_path(&path)?;
    Ok(())
}

/// detach HEAD at a commit
pub fn write_head_detached(repo: &Repo, hash: &Hash) -> Result<()> {
    let path = repo.head_path();
    fs::write(&path, format!("{}\n", hash.to_hex())).with_path(&path)?;
    Ok(())
}

/// resolve HEAD to a commit hash; None on an unborn branch
pub fn resolve_head(repo: &Repo) -> Result<Option<Hash>> {
    match read_head(repo)? {
        Head::Symbolic(ref_name) => read_ref(repo, &ref_name),
        Head::Detached(hash) => Ok(Some(hash)),
    }
}

/// resolve a revision string: 40-hex parses as a hash, otherwise the
/// name is tried as a branch, a tag, then a full ref path
pub fn resolve_revision(repo: &Repo, revision: &str) -> Result<Hash> {
    if revision.len() == 40 && revision.chars().all(|c| c.is_ascii_hexdigit()) {
        return Hash::from_hex(revision);
    }

    for candidate in [
        branch_ref(revision),
        tag_ref(revision),
        revision.to_string(),
    ] {
        if let Some(hash) = read_ref(repo, &candidate)? {
            return Ok(hash);
        }
    }

    Err(Error::ref_not_found(revision))
}

/// filesystem path for a ref
fn ref_file(repo: &Repo, ref_name: &str) -> PathBuf {
    repo.walgit_path().join(ref_name)
}

/// recursively collect refs from a directory
fn collect_refs(base: &PathBuf, dir: &PathBuf, refs: &mut Vec<(String, Hash)>) -> Result<()> {
    for entry in fs::read_dir(dir).with_path(dir)? {
        let entry = entry.with_path(dir)?;
        let path = entry.path();

        if path.is_dir() {
            collect_refs(base, &path, refs)?;
        } else if path.is_file() {
            if let Ok(rel) = path.strip_prefix(base) {
                let name = rel.to_string_lossy().to_string();
                if let Some(hash) = read_ref_at(&path)? {
                    refs.push((name, hash));
                }
            }
        }
    }
    Ok(())
}

fn read_ref_at(path: &PathBuf) -> Result<Option<Hash>> {
    let content = fs::read_to_string(path).with_path(path)?;
    Ok(Hash::from_hex(content.trim()).ok())
}

/// validate ref name
fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidRef("empty ref name".to_string()));
    }
    if !name.starts_with("refs/") {
        return Err(Error::InvalidRef(format!(
            "ref name must start with 'refs/': {}",
            name
        )));
    }
    if name.ends_with('/') || name.contains("//") || name.contains('\0') {
        return Err(Error::InvalidRef(name.to_string()));
    }
    for component in name.split('/') {
        if component == "." || component == ".." {
            return Err(Error::InvalidRef(format!(
                "ref name cannot contain '.' or '..': {}",
                name
            )));
        }
    }
    Ok(())
}

/// bounded spin on the repo lock; cas writers must not fail spuriously
fn acquire_lock(repo: &Repo) -> Result<crate::repo::RepoLock> {
    for _ in 0..500 {
        if let Some(lock) = repo.try_lock()? {
            return Ok(lock);
        }
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    Err(Error::LockContention)
}
