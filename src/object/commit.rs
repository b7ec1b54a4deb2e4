use crate::error::{Error, Result};
use crate::hash::{Hash, ObjectKind};
use crate::object;
use crate::repo::Repo;
use crate::types::Commit;

/// store a commit in its canonical serialization; returns its hash
pub fn write_commit(repo: &Repo, commit: &Commit) -> Result<Hash> {
    let (hash, _) = object::write_object(repo, ObjectKind::Commit, &commit.to_canonical_bytes())?;
    Ok(hash)
}

/// read and parse a commit, verifying the hash
pub fn read_commit(repo: &Repo, hash: &Hash) -> Result<Commit> {
    let (kind, payload) = object::read_object(repo, hash)?;
    if kind != ObjectKind::Commit {
        return Err(Error::Format(format!("expected commit, found {}", kind)));
    }
    Commit::from_canonical_bytes(&payload)
}

/// check if a commit exists in the local store
pub fn commit_exists(repo: &Repo, hash: &Hash) -> bool {
    object::exists(repo, hash)
}
