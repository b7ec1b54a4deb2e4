//! ledger collaborator interface and transaction engine
//!
//! the ledger is the transactional object service holding repository
//! metadata and reference state. it is specified only by the capability
//! trait here; implementations are selected by configuration.

pub mod batch;
pub mod memory;
pub mod tx;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

pub use batch::{plan_batches, run_batches, BatchOptions};
pub use memory::MemoryLedger;
pub use tx::{SubmitOptions, TxBuilder, TxEngine};

use crate::error::{Error, LedgerErrorKind, NetworkErrorKind, Result};
use crate::hash::Hash;

/// digest identifying a submitted transaction
pub type TxDigest = String;

/// tree entry as recorded on the ledger
#[derive(Clone, Debug, Serialize)]
pub struct LedgerTreeEntry {
    pub name: String,
    pub kind: String,
    pub id: Hash,
    pub mode: u32,
}

/// one ledger mutation inside a transaction
#[derive(Clone, Debug, Serialize)]
pub enum Operation {
    CreateBlob {
        remote_id: String,
        size: u64,
        hash: Hash,
        encoding: String,
    },
    CreateTree {
        hash: Hash,
        entries: Vec<LedgerTreeEntry>,
    },
    CreateCommit {
        hash: Hash,
        tree: Hash,
        parents: Vec<Hash>,
        message: String,
        timestamp: String,
        manifest_cid: Option<String>,
        wrapped_dek_cid: Option<String>,
    },
    UpdateBranch {
        repo_id: String,
        branch: String,
        commit: Hash,
        /// compare-and-set: the update applies only if the branch
        /// currently points here (None = branch must not exist)
        expected: Option<Hash>,
    },
    ForceUpdateBranch {
        repo_id: String,
        branch: String,
        commit: Hash,
    },
}

impl Operation {
    /// complexity score for batching: move calls, nested vectors and
    /// shared-object touches weigh more than plain object creation
    pub fn complexity(&self) -> u64 {
        match self {
            Operation::CreateBlob { .. } => 1,
            Operation::CreateTree { entries, .. } => 2 + entries.len() as u64 / 8,
            Operation::CreateCommit { parents, .. } => 3 + parents.len() as u64,
            Operation::UpdateBranch { .. } => 4,
            Operation::ForceUpdateBranch { .. } => 4,
        }
    }

    pub fn serialized_size(&self) -> u64 {
        serde_json::to_vec(self).map(|v| v.len() as u64).unwrap_or(0)
    }

    /// merge-class operations get the larger gas safety factor
    pub fn is_merge_class(&self) -> bool {
        matches!(self, Operation::CreateCommit { parents, .. } if parents.len() > 1)
    }
}

/// an unsubmitted group of operations
#[derive(Clone, Debug, Default, Serialize)]
pub struct Transaction {
    pub operations: Vec<Operation>,
}

impl Transaction {
    pub fn serialized_size(&self) -> u64 {
        self.operations.iter().map(|op| op.serialized_size()).sum()
    }

    pub fn complexity(&self) -> u64 {
        self.operations.iter().map(|op| op.complexity()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn has_merge_class(&self) -> bool {
        self.operations.iter().any(|op| op.is_merge_class())
    }
}

/// dry-run effects used for gas estimation
#[derive(Clone, Copy, Debug)]
pub struct GasEffects {
    pub computation: u64,
    pub storage: u64,
    pub rebate: u64,
}

impl GasEffects {
    pub fn net(&self) -> u64 {
        (self.computation + self.storage).saturating_sub(self.rebate)
    }
}

/// terminal and non-terminal transaction states
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Success { gas_used: u64 },
    Failure { message: String },
}

/// outcome of a submitted and awaited transaction
#[derive(Clone, Debug)]
pub struct TxResult {
    pub digest: TxDigest,
    pub status: TxStatus,
    pub gas_used: u64,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// a blob object as recorded on the ledger
#[derive(Clone, Debug)]
pub struct BlobRecord {
    pub hash: Hash,
    pub remote_id: String,
    pub size: u64,
}

/// event emitted when a reference moves
#[derive(Clone, Debug)]
pub struct LedgerEvent {
    pub repo_id: String,
    pub branch: String,
    pub commit: Hash,
}

/// transaction signer provided by the wallet collaborator
pub trait Signer: Send + Sync {
    fn address(&self) -> &str;
    fn sign(&self, tx_bytes: &[u8]) -> Result<Vec<u8>>;
}

/// deterministic signer for tests and localnet
pub struct LocalSigner {
    address: String,
    key: [u8; 32],
}

impl LocalSigner {
    pub fn new(address: impl Into<String>, key: [u8; 32]) -> Self {
        Self {
            address: address.into(),
            key,
        }
    }
}

impl Signer for LocalSigner {
    fn address(&self) -> &str {
        &self.address
    }

    fn sign(&self, tx_bytes: &[u8]) -> Result<Vec<u8>> {
        let mut input = self.key.to_vec();
        input.extend_from_slice(tx_bytes);
        Ok(crate::hash::sha256_hex(&input).into_bytes())
    }
}

/// capability bundle of the ledger collaborator
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn dry_run(&self, tx: &Transaction, sender: &str) -> Result<GasEffects>;

    async fn sign_and_submit(
        &self,
        tx: &Transaction,
        signer: &dyn Signer,
        gas_budget: u64,
    ) -> Result<TxDigest>;

    async fn get_transaction(&self, digest: &str) -> Result<TxStatus>;

    async fn branch_exists(&self, repo_id: &str, branch: &str) -> Result<bool>;

    async fn get_branch(&self, repo_id: &str, branch: &str) -> Result<Option<Hash>>;

    /// whether an object with this hash exists on the ledger
    async fn has_object(&self, repo_id: &str, hash: &Hash) -> Result<bool>;

    async fn list_blobs(&self, repo_id: &str) -> Result<Vec<BlobRecord>>;

    async fn subscribe_events(&self, repo_id: &str) -> Result<mpsc::UnboundedReceiver<LedgerEvent>>;
}

/// retryable-error word list applied to ledger error text
pub const RETRYABLE_WORDS: &[&str] = &[
    "rate limit",
    "congestion",
    "quorum",
    "timeout",
    "temporarily",
    "try again",
];

/// classify ledger error text into an error kind
///
/// words from the retryable list map to network classes so the retry
/// strategy picks them up; everything else becomes a ledger kind.
pub fn classify_error_text(message: &str) -> Error {
    let lower = message.to_ascii_lowercase();

    if lower.contains("rate limit") {
        return Error::Network {
            kind: NetworkErrorKind::RateLimited,
            message: message.to_string(),
        };
    }
    if RETRYABLE_WORDS.iter().any(|w| lower.contains(w)) {
        return Error::Network {
            kind: NetworkErrorKind::Transient,
            message: message.to_string(),
        };
    }

    let kind = if lower.contains("gas") {
        LedgerErrorKind::Gas
    } else if lower.contains("budget") {
        LedgerErrorKind::Budget
    } else if lower.contains("not found") || lower.contains("missing") {
        LedgerErrorKind::ObjectMissing
    } else if lower.contains("abort") {
        LedgerErrorKind::Abort
    } else if lower.contains("version") || lower.contains("conflict") {
        LedgerErrorKind::Version
    } else if lower.contains("too large") {
        LedgerErrorKind::TxTooLarge
    } else {
        LedgerErrorKind::Validation
    };

    Error::Ledger {
        kind,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complexity_monotone_in_operations() {
        let blob = Operation::CreateBlob {
            remote_id: "cid".into(),
            size: 10,
            hash: Hash::ZERO,
            encoding: "zlib".into(),
        };
        let one = Transaction {
            operations: vec![blob.clone()],
        };
        let two = Transaction {
            operations: vec![blob.clone(), blob],
        };
        assert!(two.complexity() > one.complexity());
        assert!(two.serialized_size() > one.serialized_size());
    }

    #[test]
    fn test_merge_class_detection() {
        let merge = Operation::CreateCommit {
            hash: Hash::ZERO,
            tree: Hash::ZERO,
            parents: vec![Hash::ZERO, Hash::ZERO],
            message: "merge".into(),
            timestamp: "t".into(),
            manifest_cid: None,
            wrapped_dek_cid: None,
        };
        assert!(merge.is_merge_class());

        let linear = Operation::CreateCommit {
            hash: Hash::ZERO,
            tree: Hash::ZERO,
            parents: vec![Hash::ZERO],
            message: "linear".into(),
            timestamp: "t".into(),
            manifest_cid: None,
            wrapped_dek_cid: None,
        };
        assert!(!linear.is_merge_class());
    }

    #[test]
    fn test_classify_error_text() {
        assert!(matches!(
            classify_error_text("hit the rate limit, slow down"),
            Error::Network {
                kind: NetworkErrorKind::RateLimited,
                ..
            }
        ));
        assert!(matches!(
            classify_error_text("network congestion detected"),
            Error::Network {
                kind: NetworkErrorKind::Transient,
                ..
            }
        ));
        assert!(matches!(
            classify_error_text("insufficient gas for execution"),
            Error::Ledger {
                kind: LedgerErrorKind::Gas,
                ..
            }
        ));
        assert!(matches!(
            classify_error_text("transaction too large"),
            Error::Ledger {
                kind: LedgerErrorKind::TxTooLarge,
                ..
            }
        ));
        assert!(matches!(
            classify_error_text("move abort in module"),
            Error::Ledger {
                kind: LedgerErrorKind::Abort,
                ..
            }
        ));
    }

    #[test]
    fn test_gas_effects_net() {
        let effects = GasEffects {
            computation: 1000,
            storage: 500,
            rebate: 200,
        };
        assert_eq!(effects.net(), 1300);

        let over_rebated = GasEffects {
            computation: 10,
            storage: 10,
            rebate: 100,
        };
        assert_eq!(over_rebated.net(), 0);
    }

    #[test]
    fn test_local_signer() {
        let signer = LocalSigner::new("0xme", [7; 32]);
        assert_eq!(signer.address(), "0xme");
        let s1 = signer.sign(b"tx bytes").unwrap();
        let s2 = signer.sign(b"tx bytes").unwrap();
        assert_eq!(s1, s2);
        assert_ne!(s1, signer.sign(b"other").unwrap());
    }
}
