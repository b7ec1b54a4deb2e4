use crate::error::{Error, Result};
use crate::hash::{Hash, ObjectKind};
use crate::object;
use crate::repo::Repo;
use crate::types::Tree;

/// store a tree in its canonical serialization; returns its hash
pub fn write_tree(repo: &Repo, tree: &Tree) -> Result<Hash> {
    let (hash, _) = object::write_object(repo, ObjectKind::Tree, &tree.to_canonical_bytes())?;
    Ok(hash)
}

/// read and parse a tree, verifying the hash
pub fn read_tree(repo: &Repo, hash: &Hash) -> Result<Tree> {
    let (kind, payload) = object::read_object(repo, hash)?;
    if kind != ObjectKind::Tree {
        return Err(Error::Format(format!("expected tree, found {}", kind)));
    }
    Tree::from_canonical_bytes(&payload)
}

/// check if a tree exists in the local store
pub fn tree_exists(repo: &Repo, hash: &Hash) -> bool {
    object::exists(repo, hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryMode, TreeEntry};
    use tempfile::tempdir;

    #[test]
    fn test_write_and_read_tree() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path(), "test").unwrap();

        let tree = Tree::new(vec![
            TreeEntry::new("file.txt", EntryMode::Blob, Hash::ZERO),
            TreeEntry::new("subdir", EntryMode::Tree, Hash::ZERO),
        ])
        .unwrap();

        let hash = write_tree(&repo, &tree).unwrap();
        assert_eq!(hash, tree.hash());
        assert!(tree_exists(&repo, &hash));

        let read = read_tree(&repo, &hash).unwrap();
        assert_eq!(read, tree);
    }

    #[test]
    fn test_tree_deduplication() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path(), "test").unwrap();

        let tree = Tree::new(vec![TreeEntry::new("f", EntryMode::Blob, Hash::ZERO)]).unwrap();
        let h1 = write_tree(&repo, &tree).unwrap();
        let h2 = write_tree(&repo, &tree).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_empty_tree_roundtrip() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path(), "test").unwrap();

        let hash = write_tree(&repo, &Tree::empty()).unwrap();
        assert!(read_tree(&repo, &hash).unwrap().is_empty());
    }
}
