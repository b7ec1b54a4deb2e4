use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher as _;

use blake2::Blake2b512;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use twox_hash::XxHash64;

use crate::Error;

/// SHA-1 hash used for content addressing
///
/// computed over the framed payload `"<kind> <size>\0<bytes>"`, which is
/// the sole identity of blobs, trees and commits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 20]);

impl Hash {
    /// zero hash (useful as sentinel)
    pub const ZERO: Hash = Hash([0u8; 20]);

    /// create from raw bytes
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// parse from hex string
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidHashHex(s.to_string()))?;
        if bytes.len() != 20 {
            return Err(Error::InvalidHashHex(s.to_string()));
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// get raw bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// convert to lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// split into path components for the object store
    /// returns (first 2 hex chars, remaining 38 hex chars)
    pub fn to_path_components(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[..2].to_string(), hex[2..].to_string())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..12])
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// object kinds carried in the canonical framing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }

    pub fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "blob" => Ok(ObjectKind::Blob),
            "tree" => Ok(ObjectKind::Tree),
            "commit" => Ok(ObjectKind::Commit),
            other => Err(Error::Format(format!("unknown object kind: {}", other))),
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// canonical framing header: `"<kind> <size>\0"`
pub fn frame_header(kind: ObjectKind, size: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(16);
    header.extend_from_slice(kind.as_str().as_bytes());
    header.push(b' ');
    header.extend_from_slice(size.to_string().as_bytes());
    header.push(0);
    header
}

/// hash a payload under the canonical framing
pub fn hash_object(kind: ObjectKind, payload: &[u8]) -> Hash {
    let mut hasher = Sha1::new();
    hasher.update(frame_header(kind, payload.len()));
    hasher.update(payload);
    Hash(hasher.finalize().into())
}

/// hash blob content
pub fn hash_blob(content: &[u8]) -> Hash {
    hash_object(ObjectKind::Blob, content)
}

/// streaming object hasher for large payloads
///
/// the payload size must be known up front since it is part of the framing.
pub struct ObjectHasher {
    hasher: Sha1,
}

impl ObjectHasher {
    /// create new hasher, writing the framing header immediately
    pub fn new(kind: ObjectKind, size: u64) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b" ");
        hasher.update(size.to_string().as_bytes());
        hasher.update([0u8]);
        Self { hasher }
    }

    /// feed payload bytes
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// finalize and return hash
    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

/// checksum algorithms for multi-algorithm integrity records
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgo {
    Sha1,
    Sha256,
    Blake2b,
}

impl ChecksumAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgo::Sha1 => "sha1",
            ChecksumAlgo::Sha256 => "sha256",
            ChecksumAlgo::Blake2b => "blake2b",
        }
    }
}

/// compute hex checksums of raw bytes under the requested algorithms
pub fn checksums(bytes: &[u8], algos: &[ChecksumAlgo]) -> BTreeMap<ChecksumAlgo, String> {
    let mut out = BTreeMap::new();
    for algo in algos {
        let digest = match algo {
            ChecksumAlgo::Sha1 => hex::encode(Sha1::digest(bytes)),
            ChecksumAlgo::Sha256 => hex::encode(Sha256::digest(bytes)),
            ChecksumAlgo::Blake2b => hex::encode(Blake2b512::digest(bytes)),
        };
        out.insert(*algo, digest);
    }
    out
}

/// sha256 hex of raw bytes (manifest and transport integrity records)
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// fast non-cryptographic 64-bit digest for chunk transport
///
/// detects transport corruption only; cryptographic integrity is verified
/// separately against the object hash after reassembly.
pub fn quick_checksum(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    hasher.finish()
}

/// verify content against its claimed hash
pub fn verify(expected: &Hash, kind: ObjectKind, payload: &[u8]) -> crate::Result<()> {
    let got = hash_object(kind, payload);
    if got != *expected {
        return Err(Error::Integrity {
            expected: expected.to_hex(),
            got: got.to_hex(),
            algo: "sha1",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_roundtrip() {
        let original = Hash::from_hex("abcdef0123456789abcdef0123456789abcdef01").unwrap();
        let hex = original.to_hex();
        let parsed = Hash::from_hex(&hex).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_hash_invalid_hex() {
        assert!(Hash::from_hex("not valid hex").is_err());
        assert!(Hash::from_hex("abcd").is_err()); // too short
        assert!(Hash::from_hex("abcdef0123456789abcdef0123456789abcdef01ff").is_err());
        // too long
    }

    #[test]
    fn test_hash_path_components() {
        let h = Hash::from_hex("abcdef0123456789abcdef0123456789abcdef01").unwrap();
        let (dir, file) = h.to_path_components();
        assert_eq!(dir, "ab");
        assert_eq!(file, "cdef0123456789abcdef0123456789abcdef01");
    }

    #[test]
    fn test_blob_hash_known_value() {
        // git's own identity for the bytes "hello\n"
        let h = hash_blob(b"hello\n");
        assert_eq!(h.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    #[test]
    fn test_blob_hash_determinism() {
        assert_eq!(hash_blob(b"hello"), hash_blob(b"hello"));
        assert_ne!(hash_blob(b"hello"), hash_blob(b"world"));
    }

    #[test]
    fn test_kind_affects_hash() {
        let payload = b"same payload";
        assert_ne!(
            hash_object(ObjectKind::Blob, payload),
            hash_object(ObjectKind::Tree, payload)
        );
    }

    #[test]
    fn test_streaming_hasher() {
        let direct = hash_blob(b"helloworld");

        let mut streaming = ObjectHasher::new(ObjectKind::Blob, 10);
        streaming.update(b"hello");
        streaming.update(b"world");
        let streamed = streaming.finalize();

        assert_eq!(direct, streamed);
    }

    #[test]
    fn test_checksums_all_algos() {
        let sums = checksums(
            b"abc",
            &[ChecksumAlgo::Sha1, ChecksumAlgo::Sha256, ChecksumAlgo::Blake2b],
        );
        assert_eq!(
            sums.get(&ChecksumAlgo::Sha1).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            sums.get(&ChecksumAlgo::Sha256).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sums.get(&ChecksumAlgo::Blake2b).unwrap().len(), 128);
    }

    #[test]
    fn test_quick_checksum_detects_corruption() {
        let a = quick_checksum(b"chunk data");
        let mut corrupted = b"chunk data".to_vec();
        corrupted[3] ^= 0xff;
        assert_ne!(a, quick_checksum(&corrupted));
        assert_eq!(a, quick_checksum(b"chunk data"));
    }

    #[test]
    fn test_verify_mismatch() {
        let h = hash_blob(b"original");
        assert!(verify(&h, ObjectKind::Blob, b"original").is_ok());
        let err = verify(&h, ObjectKind::Blob, b"tampered").unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
    }

    #[test]
    fn test_hash_serde_json() {
        let h = Hash::from_hex("abcdef0123456789abcdef0123456789abcdef01").unwrap();
        let json = serde_json::to_string(&h).unwrap();
        assert!(json.contains("abcdef"));
        let parsed: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(h, parsed);
    }
}
