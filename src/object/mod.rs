//! local content-addressed object store
//!
//! objects live at `.walgit/objects/<hh>/<rest>` as zlib-deflated framed
//! bytes. writes are idempotent and atomic (temp file, fsync, rename); the
//! hash is verified on every read.

pub mod blob;
pub mod commit;
pub mod tree;

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub use blob::{blob_exists, read_blob, write_blob};
pub use commit::{commit_exists, read_commit, write_commit};
pub use tree::{read_tree, tree_exists, write_tree};

use crate::codec;
use crate::error::{Error, IoResultExt, Result};
use crate::hash::{self, Hash, ObjectKind};
use crate::repo::Repo;

/// fanout directory names reserved by other tools, never objects
const RESERVED_DIRS: &[&str] = &["info", "pack"];

/// filesystem path of an object
pub fn object_path(repo: &Repo, hash: &Hash) -> PathBuf {
    let (dir, file) = hash.to_path_components();
    repo.objects_path().join(dir).join(file)
}

/// store already-compressed object bytes under their hash
///
/// idempotent: an existing object is left untouched. atomic with respect
/// to readers: temp file, fsync, rename, then directory fsync.
pub fn put(repo: &Repo, hash: &Hash, compressed: &[u8]) -> Result<()> {
    let (dir, file) = hash.to_path_components();
    let obj_dir = repo.objects_path().join(&dir);
    let obj_path = obj_dir.join(&file);

    // first write wins
    if obj_path.exists() {
        return Ok(());
    }

    fs::create_dir_all(&obj_dir).with_path(&obj_dir)?;

    let tmp_path = repo.tmp_path().join(uuid::Uuid::new_v4().to_string());
    {
        let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
        tmp_file.write_all(compressed).with_path(&tmp_path)?;
        tmp_file.sync_all().with_path(&tmp_path)?;
    }

    fs::rename(&tmp_path, &obj_path).with_path(&obj_path)?;
    fsync_dir(&obj_dir)?;

    Ok(())
}

/// read the compressed bytes of an object
pub fn get(repo: &Repo, hash: &Hash) -> Result<Vec<u8>> {
    let path = object_path(repo, hash);
    fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::object_not_found(hash)
        } else {
            Error::Io { path, source: e }
        }
    })
}

/// check if an object exists in the local store
pub fn exists(repo: &Repo, hash: &Hash) -> bool {
    object_path(repo, hash).exists()
}

/// enumerate all object hashes in the local store
///
/// filters for hex directory/file names and skips the reserved
/// `info` and `pack` entries.
pub fn list(repo: &Repo) -> Result<Vec<Hash>> {
    let objects = repo.objects_path();
    let mut hashes = Vec::new();

    if !objects.exists() {
        return Ok(hashes);
    }

    for entry in fs::read_dir(&objects).with_path(&objects)? {
        let entry = entry.with_path(&objects)?;
        let dir_name = entry.file_name().to_string_lossy().to_string();

        if RESERVED_DIRS.contains(&dir_name.as_str()) {
            continue;
        }
        if dir_name.len() != 2 || !dir_name.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        if !entry.path().is_dir() {
            continue;
        }

        for file in fs::read_dir(entry.path()).with_path(entry.path())? {
            let file = file.with_path(entry.path())?;
            let file_name = file.file_name().to_string_lossy().to_string();
            if file_name.len() != 38 || !file_name.chars().all(|c| c.is_ascii_hexdigit()) {
                continue;
            }
            if let Ok(hash) = Hash::from_hex(&format!("{}{}", dir_name, file_name)) {
                hashes.push(hash);
            }
        }
    }

    hashes.sort();
    Ok(hashes)
}

/// frame, compress and store a payload; returns (hash, compressed size)
pub fn write_object(repo: &Repo, kind: ObjectKind, payload: &[u8]) -> Result<(Hash, u64)> {
    let hash = hash::hash_object(kind, payload);

    let mut framed = hash::frame_header(kind, payload.len());
    framed.extend_from_slice(payload);

    let level = codec::adaptive_level(payload.len() as u64, None);
    let compressed = codec::compress(&framed, level)?;
    let compressed_len = compressed.len() as u64;

    put(repo, &hash, &compressed)?;
    Ok((hash, compressed_len))
}

/// read, decompress and verify an object; returns (kind, payload)
pub fn read_object(repo: &Repo, hash: &Hash) -> Result<(ObjectKind, Vec<u8>)> {
    let compressed = get(repo, hash)?;
    let framed = codec::decompress(&compressed)?;

    let (kind, payload) = parse_frame(&framed)?;

    // identity check on every read
    hash::verify(hash, kind, payload)?;

    Ok((kind, payload.to_vec()))
}

/// split framed bytes into (kind, payload), checking the declared size
pub fn parse_frame(framed: &[u8]) -> Result<(ObjectKind, &[u8])> {
    let nul = framed
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Format("object header".to_string()))?;

    let header = std::str::from_utf8(&framed[..nul])
        .map_err(|_| Error::Format("object header".to_string()))?;
    let (kind_str, size_str) = header
        .split_once(' ')
        .ok_or_else(|| Error::Format("object header".to_string()))?;

    let kind = ObjectKind::from_str(kind_str)?;
    let size: usize = size_str
        .parse()
        .map_err(|_| Error::Format("object size".to_string()))?;

    let payload = &framed[nul + 1..];
    if payload.len() != size {
        return Err(Error::Format(format!(
            "object size: declared {}, got {}",
            size,
            payload.len()
        )));
    }

    Ok((kind, payload))
}

/// fsync a directory
fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}
