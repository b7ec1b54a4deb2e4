use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Error, Result};
use crate::hash::{self, Hash, ObjectKind};

/// a commit object pointing to a root tree with metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    /// root tree hash
    pub tree: Hash,
    /// parent commit hashes (empty for initial, 1 for linear, 2+ for merge)
    pub parents: Vec<Hash>,
    /// ledger address of the author
    pub author: String,
    /// informational only; never part of any ordering decision
    pub timestamp: DateTime<Utc>,
    /// commit message
    pub message: String,
    /// remote identifier of the encrypted manifest, when one was uploaded
    pub manifest_cid: Option<String>,
    /// remote identifier of the wrapped per-commit dek
    pub wrapped_dek_cid: Option<String>,
}

impl Commit {
    /// create a new commit stamped now
    pub fn new(
        tree: Hash,
        parents: Vec<Hash>,
        author: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::with_timestamp(tree, parents, author, Utc::now(), message)
    }

    /// create a new commit with explicit timestamp
    pub fn with_timestamp(
        tree: Hash,
        parents: Vec<Hash>,
        author: impl Into<String>,
        timestamp: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tree,
            parents,
            author: author.into(),
            timestamp,
            message: message.into(),
            manifest_cid: None,
            wrapped_dek_cid: None,
        }
    }

    /// is this an initial commit (no parents)
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// is this a merge commit (multiple parents)
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// canonical serialization: `tree`/`parent`/`author`/`committer`
    /// headers (plus optional `manifest` and `wrapped-dek`), a blank line,
    /// then the message
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        let ts = self
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut out = String::new();
        out.push_str(&format!("tree {}\n", self.tree.to_hex()));
        for parent in &self.parents {
            out.push_str(&format!("parent {}\n", parent.to_hex()));
        }
        out.push_str(&format!("author {} {}\n", self.author, ts));
        out.push_str(&format!("committer {} {}\n", self.author, ts));
        if let Some(cid) = &self.manifest_cid {
            out.push_str(&format!("manifest {}\n", cid));
        }
        if let Some(cid) = &self.wrapped_dek_cid {
            out.push_str(&format!("wrapped-dek {}\n", cid));
        }
        out.push('\n');
        out.push_str(&self.message);
        out.into_bytes()
    }

    /// parse the canonical serialization
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self> {
        let text =
            std::str::from_utf8(bytes).map_err(|_| Error::Format("commit object".to_string()))?;
        let (headers, message) = text
            .split_once("\n\n")
            .ok_or_else(|| Error::Format("commit object".to_string()))?;

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut timestamp = None;
        let mut manifest_cid = None;
        let mut wrapped_dek_cid = None;

        for line in headers.lines() {
            let (key, value) = line
                .split_once(' ')
                .ok_or_else(|| Error::Format("commit header".to_string()))?;
            match key {
                "tree" => tree = Some(Hash::from_hex(value)?),
                "parent" => parents.push(Hash::from_hex(value)?),
                "author" => {
                    let (who, ts) = value
                        .rsplit_once(' ')
                        .ok_or_else(|| Error::Format("commit author".to_string()))?;
                    author = Some(who.to_string());
                    timestamp = Some(
                        DateTime::parse_from_rfc3339(ts)
                            .map_err(|_| Error::Format("commit timestamp".to_string()))?
                            .with_timezone(&Utc),
                    );
                }
                "committer" => {} // mirrors author in this client
                "manifest" => manifest_cid = Some(value.to_string()),
                "wrapped-dek" => wrapped_dek_cid = Some(value.to_string()),
                other => {
                    return Err(Error::Format(format!("commit header '{}'", other)));
                }
            }
        }

        Ok(Self {
            tree: tree.ok_or_else(|| Error::Format("commit missing tree".to_string()))?,
            parents,
            author: author.ok_or_else(|| Error::Format("commit missing author".to_string()))?,
            timestamp: timestamp
                .ok_or_else(|| Error::Format("commit missing timestamp".to_string()))?,
            message: message.to_string(),
            manifest_cid,
            wrapped_dek_cid,
        })
    }

    /// content hash over the canonical serialization
    pub fn hash(&self) -> Hash {
        hash::hash_object(ObjectKind::Commit, &self.to_canonical_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_commit_new() {
        let c = Commit::new(Hash::ZERO, vec![], "0xauthor", "message");
        assert_eq!(c.tree, Hash::ZERO);
        assert!(c.parents.is_empty());
        assert!(c.is_root());
        assert!(!c.is_merge());
    }

    #[test]
    fn test_commit_merge() {
        let p1 = Hash::from_hex("1111111111111111111111111111111111111111").unwrap();
        let p2 = Hash::from_hex("2222222222222222222222222222222222222222").unwrap();
        let c = Commit::new(Hash::ZERO, vec![p1, p2], "0xauthor", "merge");
        assert!(c.is_merge());
        assert!(!c.is_root());
    }

    #[test]
    fn test_commit_canonical_roundtrip() {
        let parent = Hash::from_hex("abcdef0123456789abcdef0123456789abcdef01").unwrap();
        let mut c = Commit::with_timestamp(
            Hash::ZERO,
            vec![parent],
            "0xauthor",
            fixed_time(),
            "fix the frobnicator\n\nlonger body text\n",
        );
        c.manifest_cid = Some("manifest-cid-1".to_string());
        c.wrapped_dek_cid = Some("dek-cid-1".to_string());

        let bytes = c.to_canonical_bytes();
        let parsed = Commit::from_canonical_bytes(&bytes).unwrap();
        assert_eq!(c, parsed);
    }

    #[test]
    fn test_commit_hash_deterministic() {
        let c1 = Commit::with_timestamp(Hash::ZERO, vec![], "a", fixed_time(), "m");
        let c2 = Commit::with_timestamp(Hash::ZERO, vec![], "a", fixed_time(), "m");
        assert_eq!(c1.hash(), c2.hash());

        let c3 = Commit::with_timestamp(Hash::ZERO, vec![], "a", fixed_time(), "other");
        assert_ne!(c1.hash(), c3.hash());
    }

    #[test]
    fn test_commit_hash_covers_cids() {
        let plain = Commit::with_timestamp(Hash::ZERO, vec![], "a", fixed_time(), "m");
        let mut with_manifest = plain.clone();
        with_manifest.manifest_cid = Some("cid".to_string());
        assert_ne!(plain.hash(), with_manifest.hash());
    }

    #[test]
    fn test_commit_header_shape() {
        let c = Commit::with_timestamp(Hash::ZERO, vec![], "0xabc", fixed_time(), "msg");
        let text = String::from_utf8(c.to_canonical_bytes()).unwrap();
        assert!(text.starts_with("tree 0000000000000000000000000000000000000000\n"));
        assert!(text.contains("author 0xabc 2024-03-15T12:30:00Z\n"));
        assert!(text.contains("committer 0xabc 2024-03-15T12:30:00Z\n"));
        assert!(text.ends_with("\n\nmsg"));
    }

    #[test]
    fn test_commit_parse_rejects_garbage() {
        assert!(Commit::from_canonical_bytes(b"no blank line").is_err());
        assert!(Commit::from_canonical_bytes(b"tree zzz\n\nmsg").is_err());
        assert!(Commit::from_canonical_bytes(b"unknown header\n\nmsg").is_err());
    }
}
