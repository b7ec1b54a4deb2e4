use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{self, Dek};
use crate::error::Result;

/// one file recorded in a commit manifest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// remote identifier of the encrypted payload
    pub cid: String,
    /// plaintext size in bytes
    pub size: u64,
    /// sha256 hex of the plaintext
    pub hash: String,
    pub encrypted: bool,
    pub timestamp: DateTime<Utc>,
}

/// per-commit document mapping file paths to their encrypted payloads
///
/// uploaded as an encrypted blob; its remote identifier becomes the
/// commit's manifest cid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub message: String,
    pub parent_commit_cid: Option<String>,
    pub tree: BTreeMap<String, ManifestEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Manifest {
    pub fn new(
        author: impl Into<String>,
        message: impl Into<String>,
        parent_commit_cid: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            author: author.into(),
            message: message.into(),
            parent_commit_cid,
            tree: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, path: impl Into<String>, entry: ManifestEntry) {
        self.tree.insert(path.into(), entry);
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// serialize and seal under the commit dek
    pub fn seal(&self, dek: &Dek) -> Result<Vec<u8>> {
        crypto::encrypt_framed(&self.to_json()?, dek)
    }

    /// open a sealed manifest
    pub fn open(bytes: &[u8], dek: &Dek) -> Result<Self> {
        Self::from_json(&crypto::decrypt_framed(bytes, dek)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        let mut manifest = Manifest::new("0xauthor", "update readme", Some("parent-cid".into()));
        manifest.insert(
            "README.md",
            ManifestEntry {
                cid: "cid-1".into(),
                size: 42,
                hash: "ab".repeat(32),
                encrypted: true,
                timestamp: Utc::now(),
            },
        );
        manifest.insert(
            "src/main.rs",
            ManifestEntry {
                cid: "cid-2".into(),
                size: 100,
                hash: "cd".repeat(32),
                encrypted: true,
                timestamp: Utc::now(),
            },
        );
        manifest
    }

    #[test]
    fn test_json_roundtrip() {
        let manifest = sample();
        let json = manifest.to_json().unwrap();
        let parsed = Manifest::from_json(&json).unwrap();
        assert_eq!(manifest, parsed);
    }

    #[test]
    fn test_json_shape() {
        let json = String::from_utf8(sample().to_json().unwrap()).unwrap();
        assert!(json.contains("\"parent_commit_cid\":\"parent-cid\""));
        assert!(json.contains("\"tree\""));
        assert!(json.contains("\"README.md\""));
        assert!(json.contains("\"encrypted\":true"));
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let dek = Dek::generate();
        let manifest = sample();

        let sealed = manifest.seal(&dek).unwrap();
        assert!(sealed.starts_with(b"WALGIT1"));

        let opened = Manifest::open(&sealed, &dek).unwrap();
        assert_eq!(manifest, opened);
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let manifest = sample();
        let sealed = manifest.seal(&Dek::generate()).unwrap();
        assert!(Manifest::open(&sealed, &Dek::generate()).is_err());
    }
}
