use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, LedgerErrorKind, Result};
use crate::hash::Hash;
use crate::ledger::{
    BlobRecord, GasEffects, LedgerClient, LedgerEvent, Operation, Signer, Transaction, TxDigest,
    TxStatus,
};

/// ledger backed by process memory, for tests and localnet
///
/// applies transactions atomically, enforces branch compare-and-set and
/// parent resolvability, and supports failure injection for the retry and
/// confirmation paths.
pub struct MemoryLedger {
    state: Mutex<State>,
    counter: AtomicU64,
    fail_submits: AtomicU32,
    skip_before_failing: AtomicU32,
    fail_dry_runs: AtomicU32,
    pending_polls: AtomicU32,
}

#[derive(Default)]
struct State {
    /// object hash -> kind
    objects: HashMap<String, &'static str>,
    blobs: HashMap<String, BlobRecord>,
    /// "repo\0branch" -> tip
    branches: HashMap<String, Hash>,
    txs: HashMap<String, TxStatus>,
    subscribers: Vec<(String, mpsc::UnboundedSender<LedgerEvent>)>,
}

fn branch_key(repo_id: &str, branch: &str) -> String {
    format!("{}\0{}", repo_id, branch)
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            counter: AtomicU64::new(0),
            fail_submits: AtomicU32::new(0),
            skip_before_failing: AtomicU32::new(0),
            fail_dry_runs: AtomicU32::new(0),
            pending_polls: AtomicU32::new(0),
        }
    }

    /// make the next `n` submits fail with retryable congestion text
    pub fn fail_next_submits(&self, n: u32) {
        self.fail_submits.store(n, Ordering::SeqCst);
    }

    /// let `successes` submits through, then fail the following `failures`
    pub fn fail_submits_after(&self, successes: u32, failures: u32) {
        self.skip_before_failing.store(successes, Ordering::SeqCst);
        self.fail_submits.store(failures, Ordering::SeqCst);
    }

    /// make the next `n` dry runs fail, forcing the heuristic fallback
    pub fn fail_next_dry_runs(&self, n: u32) {
        self.fail_dry_runs.store(n, Ordering::SeqCst);
    }

    /// report Pending for the next `n` confirmation polls
    pub fn delay_confirmations(&self, n: u32) {
        self.pending_polls.store(n, Ordering::SeqCst);
    }

    /// current branch tip (test introspection)
    pub fn branch_tip(&self, repo_id: &str, branch: &str) -> Option<Hash> {
        self.state
            .lock()
            .branches
            .get(&branch_key(repo_id, branch))
            .copied()
    }

    fn take_injected(&self, counter: &AtomicU32) -> bool {
        let remaining = counter.load(Ordering::SeqCst);
        if remaining > 0 {
            counter.store(remaining - 1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// validate every operation against current state plus the effects of
    /// earlier operations in the same transaction
    fn validate(&self, state: &State, tx: &Transaction) -> Result<()> {
        let mut created: Vec<String> = Vec::new();

        for op in &tx.operations {
            match op {
                Operation::CreateBlob { hash, .. } | Operation::CreateTree { hash, .. } => {
                    created.push(hash.to_hex());
                }
                Operation::CreateCommit { hash, parents, .. } => {
                    for parent in parents {
                        let hex = parent.to_hex();
                        if !state.objects.contains_key(&hex) && !created.contains(&hex) {
                            return Err(Error::Ledger {
                                kind: LedgerErrorKind::ObjectMissing,
                                message: format!("parent commit {} not found", hex),
                            });
                        }
                    }
                    created.push(hash.to_hex());
                }
                Operation::UpdateBranch {
                    repo_id,
                    branch,
                    expected,
                    ..
                } => {
                    let current = state.branches.get(&branch_key(repo_id, branch));
                    match (expected, current) {
                        (Some(e), Some(c)) if e == c => {}
                        (None, None) => {}
                        (Some(_), None) | (None, Some(_)) | (Some(_), Some(_)) => {
                            return Err(Error::Ledger {
                                kind: LedgerErrorKind::Version,
                                message: format!(
                                    "branch {} version conflict on update",
                                    branch
                                ),
                            });
                        }
                    }
                }
                Operation::ForceUpdateBranch { .. } => {}
            }
        }
        Ok(())
    }

    fn apply(&self, state: &mut State, tx: &Transaction) {
        for op in &tx.operations {
            match op {
                Operation::CreateBlob {
                    hash,
                    remote_id,
                    size,
                    ..
                } => {
                    state.objects.insert(hash.to_hex(), "blob");
                    state.blobs.insert(
                        hash.to_hex(),
                        BlobRecord {
                            hash: *hash,
                            remote_id: remote_id.clone(),
                            size: *size,
                        },
                    );
                }
                Operation::CreateTree { hash, .. } => {
                    state.objects.insert(hash.to_hex(), "tree");
                }
                Operation::CreateCommit { hash, .. } => {
                    state.objects.insert(hash.to_hex(), "commit");
                }
                Operation::UpdateBranch {
                    repo_id,
                    branch,
                    commit,
                    ..
                }
                | Operation::ForceUpdateBranch {
                    repo_id,
                    branch,
                    commit,
                } => {
                    state
                        .branches
                        .insert(branch_key(repo_id, branch), *commit);
                    state.subscribers.retain(|(filter, tx)| {
                        if filter == repo_id {
                            tx.send(LedgerEvent {
                                repo_id: repo_id.clone(),
                                branch: branch.clone(),
                                commit: *commit,
                            })
                            .is_ok()
                        } else {
                            true
                        }
                    });
                }
            }
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn dry_run(&self, tx: &Transaction, _sender: &str) -> Result<GasEffects> {
        if self.take_injected(&self.fail_dry_runs) {
            return Err(Error::Ledger {
                kind: LedgerErrorKind::Validation,
                message: "dry run unavailable".into(),
            });
        }
        // effects scale with complexity and payload, like the real thing
        Ok(GasEffects {
            computation: tx.complexity() * 1_000,
            storage: tx.serialized_size() * 10,
            rebate: tx.serialized_size(),
        })
    }

    async fn sign_and_submit(
        &self,
        tx: &Transaction,
        signer: &dyn Signer,
        gas_budget: u64,
    ) -> Result<TxDigest> {
        let skip = self.skip_before_failing.load(Ordering::SeqCst);
        if skip > 0 {
            self.skip_before_failing.store(skip - 1, Ordering::SeqCst);
        } else if self.take_injected(&self.fail_submits) {
            return Err(Error::Ledger {
                kind: LedgerErrorKind::Validation,
                message: "validator congestion, try again".into(),
            });
        }

        if gas_budget == 0 {
            return Err(Error::Ledger {
                kind: LedgerErrorKind::Budget,
                message: "gas budget is zero".into(),
            });
        }

        let serialized = serde_json::to_vec(tx)?;
        let signature = signer.sign(&serialized)?;
        if signature.is_empty() {
            return Err(Error::Auth {
                kind: crate::error::AuthErrorKind::Signature,
                message: "empty signature".into(),
            });
        }

        let mut state = self.state.lock();
        self.validate(&state, tx)?;
        self.apply(&mut state, tx);

        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let digest = format!("dgst{:08x}{}", seq, &crate::hash::sha256_hex(&serialized)[..16]);
        let gas_used = (tx.complexity() * 1_000 + tx.serialized_size() * 10).min(gas_budget);
        state
            .txs
            .insert(digest.clone(), TxStatus::Success { gas_used });

        Ok(digest)
    }

    async fn get_transaction(&self, digest: &str) -> Result<TxStatus> {
        if self.take_injected(&self.pending_polls) {
            return Ok(TxStatus::Pending);
        }
        self.state
            .lock()
            .txs
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "transaction",
                id: digest.to_string(),
            })
    }

    async fn branch_exists(&self, repo_id: &str, branch: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .branches
            .contains_key(&branch_key(repo_id, branch)))
    }

    async fn get_branch(&self, repo_id: &str, branch: &str) -> Result<Option<Hash>> {
        Ok(self.branch_tip(repo_id, branch))
    }

    async fn has_object(&self, _repo_id: &str, hash: &Hash) -> Result<bool> {
        Ok(self.state.lock().objects.contains_key(&hash.to_hex()))
    }

    async fn list_blobs(&self, _repo_id: &str) -> Result<Vec<BlobRecord>> {
        let state = self.state.lock();
        let mut records: Vec<_> = state.blobs.values().cloned().collect();
        records.sort_by(|a, b| a.hash.cmp(&b.hash));
        Ok(records)
    }

    async fn subscribe_events(
        &self,
        repo_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<LedgerEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .subscribers
            .push((repo_id.to_string(), tx));
        Ok(rx)
    }
}
