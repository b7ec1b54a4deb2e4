use crate::error::{Error, Result};
use crate::hash::{self, Hash, ObjectKind};

/// entry mode carried in the canonical tree serialization
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryMode {
    /// regular file, 0o644
    Blob,
    /// executable file, 0o755
    BlobExecutable,
    /// subtree
    Tree,
}

impl EntryMode {
    /// octal mode written into the tree entry
    pub fn octal(&self) -> u32 {
        match self {
            EntryMode::Blob => 0o100644,
            EntryMode::BlobExecutable => 0o100755,
            EntryMode::Tree => 0o40000,
        }
    }

    /// posix permission bits for working-directory materialization
    pub fn posix(&self) -> u32 {
        match self {
            EntryMode::Blob => 0o644,
            EntryMode::BlobExecutable | EntryMode::Tree => 0o755,
        }
    }

    pub fn from_octal(mode: u32) -> Result<Self> {
        match mode {
            0o100644 | 0o644 => Ok(EntryMode::Blob),
            0o100755 | 0o755 => Ok(EntryMode::BlobExecutable),
            0o40000 => Ok(EntryMode::Tree),
            other => Err(Error::Format(format!("tree entry mode {:o}", other))),
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, EntryMode::Tree)
    }
}

/// a named reference to a blob or subtree
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub mode: EntryMode,
    pub id: Hash,
}

impl TreeEntry {
    pub fn new(name: impl Into<String>, mode: EntryMode, id: Hash) -> Self {
        Self {
            name: name.into(),
            mode,
            id,
        }
    }
}

/// an ordered set of entries, canonically sorted by name byte order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// build a tree, validating names and enforcing the canonical order
    pub fn new(mut entries: Vec<TreeEntry>) -> Result<Self> {
        for entry in &entries {
            if entry.name.is_empty() {
                return Err(Error::InvalidEntryName("<empty>".to_string()));
            }
            if entry.name.contains('/') || entry.name.contains('\0') {
                return Err(Error::InvalidEntryName(entry.name.clone()));
            }
        }

        entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));

        for pair in entries.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(Error::DuplicateEntryName(pair[0].name.clone()));
            }
        }

        Ok(Self { entries })
    }

    pub fn empty() -> Self {
        Self { entries: vec![] }
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// canonical serialization: per entry `<octal mode> ' ' <name> \0 <raw id>`
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.entries {
            out.extend_from_slice(format!("{:o} ", entry.mode.octal()).as_bytes());
            out.extend_from_slice(entry.name.as_bytes());
            out.push(0);
            out.extend_from_slice(entry.id.as_bytes());
        }
        out
    }

    /// parse the canonical serialization
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self> {
        let mut entries = Vec::new();
        let mut rest = bytes;

        while !rest.is_empty() {
            let space = rest
                .iter()
                .position(|&b| b == b' ')
                .ok_or_else(|| Error::Format("tree entry".to_string()))?;
            let mode_str = std::str::from_utf8(&rest[..space])
                .map_err(|_| Error::Format("tree entry mode".to_string()))?;
            let mode = u32::from_str_radix(mode_str, 8)
                .map_err(|_| Error::Format("tree entry mode".to_string()))?;

            rest = &rest[space + 1..];
            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| Error::Format("tree entry name".to_string()))?;
            let name = std::str::from_utf8(&rest[..nul])
                .map_err(|_| Error::Format("tree entry name".to_string()))?
                .to_string();

            rest = &rest[nul + 1..];
            if rest.len() < 20 {
                return Err(Error::Format("tree entry id".to_string()));
            }
            let mut raw = [0u8; 20];
            raw.copy_from_slice(&rest[..20]);
            rest = &rest[20..];

            entries.push(TreeEntry::new(
                name,
                EntryMode::from_octal(mode)?,
                Hash::from_bytes(raw),
            ));
        }

        Tree::new(entries)
    }

    /// content hash over the canonical serialization
    pub fn hash(&self) -> Hash {
        hash::hash_object(ObjectKind::Tree, &self.to_canonical_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_entry(name: &str) -> TreeEntry {
        TreeEntry::new(name, EntryMode::Blob, Hash::ZERO)
    }

    #[test]
    fn test_tree_sorts_entries() {
        let tree = Tree::new(vec![blob_entry("zeta"), blob_entry("alpha"), blob_entry("mid")])
            .unwrap();
        let names: Vec<_> = tree.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_tree_hash_input_order_invariant() {
        let t1 = Tree::new(vec![blob_entry("a"), blob_entry("b")]).unwrap();
        let t2 = Tree::new(vec![blob_entry("b"), blob_entry("a")]).unwrap();
        assert_eq!(t1.hash(), t2.hash());
    }

    #[test]
    fn test_tree_rejects_bad_names() {
        assert!(Tree::new(vec![blob_entry("")]).is_err());
        assert!(Tree::new(vec![blob_entry("a/b")]).is_err());
        assert!(Tree::new(vec![blob_entry("a\0b")]).is_err());
        assert!(Tree::new(vec![blob_entry("dup"), blob_entry("dup")]).is_err());
    }

    #[test]
    fn test_tree_canonical_roundtrip() {
        let tree = Tree::new(vec![
            TreeEntry::new("file.txt", EntryMode::Blob, Hash::ZERO),
            TreeEntry::new("run.sh", EntryMode::BlobExecutable, Hash::ZERO),
            TreeEntry::new("src", EntryMode::Tree, Hash::ZERO),
        ])
        .unwrap();

        let bytes = tree.to_canonical_bytes();
        let parsed = Tree::from_canonical_bytes(&bytes).unwrap();
        assert_eq!(tree, parsed);
    }

    #[test]
    fn test_tree_entry_serialization_shape() {
        let tree = Tree::new(vec![TreeEntry::new("f", EntryMode::Blob, Hash::ZERO)]).unwrap();
        let bytes = tree.to_canonical_bytes();
        // "100644 f\0" + 20 raw bytes
        assert!(bytes.starts_with(b"100644 f\0"));
        assert_eq!(bytes.len(), 9 + 20);
    }

    #[test]
    fn test_tree_parse_truncated() {
        let tree = Tree::new(vec![blob_entry("f")]).unwrap();
        let bytes = tree.to_canonical_bytes();
        assert!(Tree::from_canonical_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_empty_tree() {
        let tree = Tree::empty();
        assert!(tree.is_empty());
        assert_eq!(
            Tree::from_canonical_bytes(&tree.to_canonical_bytes()).unwrap(),
            tree
        );
    }

    #[test]
    fn test_tree_get() {
        let tree = Tree::new(vec![blob_entry("a"), blob_entry("b")]).unwrap();
        assert!(tree.get("a").is_some());
        assert!(tree.get("missing").is_none());
    }
}
