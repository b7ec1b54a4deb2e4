use std::path::PathBuf;
use std::time::Duration;

use crate::hash::Hash;

/// error type for walgit operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("repository not found at {0}")]
    NoRepo(PathBuf),

    #[error("repository already exists at {0}")]
    RepoExists(PathBuf),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("integrity failure ({algo}): expected {expected}, got {got}")]
    Integrity {
        expected: String,
        got: String,
        algo: &'static str,
    },

    #[error("malformed {0}")]
    Format(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("network error ({kind:?}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("authorization error ({kind:?}): {message}")]
    Auth {
        kind: AuthErrorKind,
        message: String,
    },

    #[error("ledger error ({kind:?}): {message}")]
    Ledger {
        kind: LedgerErrorKind,
        message: String,
    },

    #[error("ref update conflict: {0}")]
    Conflict(ConflictKind),

    #[error("compare-and-set failure on ref {name}: expected {expected}, found {actual}")]
    CasFailure {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("invalid ref name: {0}")]
    InvalidRef(String),

    #[error("invalid tree entry name: {0}")]
    InvalidEntryName(String),

    #[error("duplicate tree entry name: {0}")]
    DuplicateEntryName(String),

    #[error("invalid hash hex: {0}")]
    InvalidHashHex(String),

    #[error("circuit breaker open for {endpoint}, retry after {retry_after:?}")]
    CircuitOpen {
        endpoint: String,
        retry_after: Duration,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("lock contention on repository")]
    LockContention,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("push partially succeeded: {completed_batches} of {total_batches} batches, last digest {last_digest:?}")]
    PartialPush {
        completed_batches: usize,
        total_batches: usize,
        last_digest: Option<String>,
        #[source]
        source: Box<Error>,
    },
}

/// crypto failure classes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("authentication failed")]
    Auth,
    #[error("dek unwrap failed: {0}")]
    Unwrap(String),
    #[error("invalid or missing policy: {0}")]
    Policy(String),
}

/// retryable network failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Transient,
    RateLimited,
    Timeout,
    Connection,
    Server,
}

/// non-retryable credential failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    Permission,
    Signature,
    Funds,
}

/// ledger failure classes, derived from error text and effect status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerErrorKind {
    Gas,
    Budget,
    ObjectMissing,
    Validation,
    Abort,
    Version,
    TxTooLarge,
}

/// ref update refusal without force
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    NonFastForward,
    Diverged,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::NonFastForward => write!(f, "non-fast-forward"),
            ConflictKind::Diverged => write!(f, "histories diverged"),
        }
    }
}

impl Error {
    /// shorthand for a missing object
    pub fn object_not_found(hash: &Hash) -> Self {
        Error::NotFound {
            kind: "object",
            id: hash.to_hex(),
        }
    }

    /// shorthand for a missing ref
    pub fn ref_not_found(name: &str) -> Self {
        Error::NotFound {
            kind: "ref",
            id: name.to_string(),
        }
    }

    /// whether the retry strategies of the transport and transaction
    /// engine may re-attempt after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network { .. } => true,
            Error::Ledger { kind, .. } => {
                matches!(kind, LedgerErrorKind::Gas | LedgerErrorKind::Version)
            }
            Error::Timeout(_) => true,
            _ => false,
        }
    }

    /// short actionable hint rendered by the CLI collaborator
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Conflict(ConflictKind::NonFastForward) => {
                Some("fetch and reconcile the remote branch, or push with force")
            }
            Error::Conflict(ConflictKind::Diverged) => {
                Some("pull marked the divergent paths; reconcile them before retrying")
            }
            Error::Auth {
                kind: AuthErrorKind::Funds,
                ..
            } => Some("top up the gas balance of the signing account"),
            Error::Integrity { .. } => Some("run repair on the affected objects"),
            Error::CircuitOpen { .. } => Some("the endpoint is failing; wait and retry"),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
