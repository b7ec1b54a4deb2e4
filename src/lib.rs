//! walgit - decentralized version control core
//!
//! the object and reference engine of a git-style client that stores
//! repository data in a remote content-addressable blob service and
//! anchors branch state on a transactional object ledger.
//!
//! # Core concepts
//!
//! - **Blob**: content-addressed file data, zlib-deflated under git-style
//!   framing, encrypted per commit for remote storage
//! - **Tree**: a canonical directory listing hashed over sorted entries
//! - **Commit**: a snapshot of a tree with parents, an author and
//!   optional pointers to its encrypted manifest and wrapped dek
//! - **Ref**: a named pointer to a commit (branches, tags,
//!   remote-tracking), updated by compare-and-set
//!
//! # Example usage
//!
//! ```no_run
//! use std::path::Path;
//! use walgit::Repo;
//!
//! // initialize a repository
//! let repo = Repo::init(Path::new("/path/to/project"), "project").unwrap();
//!
//! // objects, refs and history are plain module functions
//! let hash = walgit::object::write_blob(&repo, b"hello\n").unwrap();
//! assert_eq!(hash.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
//! ```

mod config;
mod error;
mod repo;

pub mod cache;
pub mod codec;
pub mod crypto;
pub mod engine;
pub mod hash;
pub mod history;
pub mod ledger;
pub mod manifest;
pub mod object;
pub mod progress;
pub mod refs;
pub mod remote;
pub mod stash;
pub mod sync;
pub mod types;

pub use config::{Config, LedgerConfig, Network, NetworkConfig, Remote, RepositoryConfig, StorageConfig};
pub use engine::ObjectEngine;
pub use error::{
    AuthErrorKind, ConflictKind, CryptoError, Error, IoResultExt, LedgerErrorKind,
    NetworkErrorKind, Result,
};
pub use hash::{hash_blob, Hash, ObjectKind};
pub use repo::Repo;
pub use types::{Commit, EntryMode, Tree, TreeEntry};
