use crate::error::{Error, Result};
use crate::hash::{Hash, ObjectKind};
use crate::object;
use crate::repo::Repo;

/// store blob content; returns its hash
pub fn write_blob(repo: &Repo, content: &[u8]) -> Result<Hash> {
    let (hash, _) = object::write_object(repo, ObjectKind::Blob, content)?;
    Ok(hash)
}

/// read blob content, verifying the hash
pub fn read_blob(repo: &Repo, hash: &Hash) -> Result<Vec<u8>> {
    let (kind, payload) = object::read_object(repo, hash)?;
    if kind != ObjectKind::Blob {
        return Err(Error::Format(format!("expected blob, found {}", kind)));
    }
    Ok(payload)
}

/// check if a blob exists in the local store
pub fn blob_exists(repo: &Repo, hash: &Hash) -> bool {
    object::exists(repo, hash)
}
