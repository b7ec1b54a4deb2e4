use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::LedgerConfig;
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::ledger::{
    classify_error_text, LedgerClient, LedgerTreeEntry, Operation, Signer, Transaction, TxDigest,
    TxResult, TxStatus,
};
use crate::progress::{ensure_active, Phase, Progress};
use crate::remote::retry::RetryPolicy;

/// heuristic gas per unit of operation complexity
const HEURISTIC_GAS_PER_COMPLEXITY: u64 = 50_000;
/// heuristic gas per serialized byte
const HEURISTIC_GAS_PER_BYTE: u64 = 20;

/// fluent builder for a ledger transaction
#[derive(Default)]
pub struct TxBuilder {
    operations: Vec<Operation>,
}

impl TxBuilder {
    pub fn create_blob(
        mut self,
        remote_id: impl Into<String>,
        size: u64,
        hash: Hash,
        encoding: impl Into<String>,
    ) -> Self {
        self.operations.push(Operation::CreateBlob {
            remote_id: remote_id.into(),
            size,
            hash,
            encoding: encoding.into(),
        });
        self
    }

    pub fn create_tree(mut self, hash: Hash, entries: Vec<LedgerTreeEntry>) -> Self {
        self.operations.push(Operation::CreateTree { hash, entries });
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_commit(
        mut self,
        hash: Hash,
        tree: Hash,
        parents: Vec<Hash>,
        message: impl Into<String>,
        timestamp: impl Into<String>,
        manifest_cid: Option<String>,
        wrapped_dek_cid: Option<String>,
    ) -> Self {
        self.operations.push(Operation::CreateCommit {
            hash,
            tree,
            parents,
            message: message.into(),
            timestamp: timestamp.into(),
            manifest_cid,
            wrapped_dek_cid,
        });
        self
    }

    pub fn update_branch(
        mut self,
        repo_id: impl Into<String>,
        branch: impl Into<String>,
        commit: Hash,
        expected: Option<Hash>,
    ) -> Self {
        self.operations.push(Operation::UpdateBranch {
            repo_id: repo_id.into(),
            branch: branch.into(),
            commit,
            expected,
        });
        self
    }

    pub fn force_update_branch(
        mut self,
        repo_id: impl Into<String>,
        branch: impl Into<String>,
        commit: Hash,
    ) -> Self {
        self.operations.push(Operation::ForceUpdateBranch {
            repo_id: repo_id.into(),
            branch: branch.into(),
            commit,
        });
        self
    }

    pub fn push(mut self, op: Operation) -> Self {
        self.operations.push(op);
        self
    }

    pub fn finish(self) -> Transaction {
        Transaction {
            operations: self.operations,
        }
    }
}

/// knobs for one submit-and-wait run
#[derive(Clone)]
pub struct SubmitOptions {
    /// explicit gas budget; estimated when absent
    pub gas_budget: Option<u64>,
    pub progress: Progress,
    pub cancel: CancellationToken,
    /// confirmation timeout; the engine default when absent
    pub timeout: Option<Duration>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            gas_budget: None,
            progress: Progress::disabled(),
            cancel: CancellationToken::new(),
            timeout: None,
        }
    }
}

/// builds, estimates, signs, submits and confirms ledger transactions
pub struct TxEngine {
    client: Arc<dyn LedgerClient>,
    config: LedgerConfig,
}

impl TxEngine {
    pub fn new(client: Arc<dyn LedgerClient>, config: LedgerConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &Arc<dyn LedgerClient> {
        &self.client
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn build(&self) -> TxBuilder {
        TxBuilder::default()
    }

    /// dry-run based gas estimate with safety factor and cap; falls back
    /// to a heuristic from operation count and serialized size when the
    /// dry run fails
    pub async fn estimate_gas(&self, tx: &Transaction, sender: &str) -> Result<u64> {
        let factor = if tx.has_merge_class() {
            self.config.merge_gas_safety_factor
        } else {
            self.config.gas_safety_factor
        };

        let net = match self.client.dry_run(tx, sender).await {
            Ok(effects) => effects.net(),
            Err(e) => {
                tracing::debug!(error = %e, "dry run failed, falling back to heuristic");
                self.heuristic_gas(tx)
            }
        };

        let padded = (net as f64 * factor) as u64;
        Ok(padded.min(self.config.max_gas))
    }

    /// bounded estimate, monotone in complexity and size
    fn heuristic_gas(&self, tx: &Transaction) -> u64 {
        tx.complexity() * HEURISTIC_GAS_PER_COMPLEXITY
            + tx.serialized_size() * HEURISTIC_GAS_PER_BYTE
    }

    /// sign and submit with retry on retryable classes; errors that only
    /// reveal themselves in text are classified through the word list
    pub async fn submit(
        &self,
        tx: &Transaction,
        signer: &dyn Signer,
        opts: &SubmitOptions,
    ) -> Result<(TxDigest, u32)> {
        self.check_size(tx)?;

        let gas_budget = match opts.gas_budget {
            Some(budget) => budget,
            None => self.estimate_gas(tx, signer.address()).await?,
        };

        let policy = RetryPolicy::writes().with_attempts(self.config.submit_attempts);
        let mut attempt = 0u32;

        loop {
            ensure_active(&opts.cancel)?;
            attempt += 1;

            match self.client.sign_and_submit(tx, signer, gas_budget).await {
                Ok(digest) => return Ok((digest, attempt)),
                Err(e) => {
                    let classified = reclassify(e);
                    if classified.is_retryable() && attempt < policy.max_attempts {
                        opts.progress.emit(
                            Phase::Retrying,
                            format!("attempt {} failed: {}", attempt, classified),
                        );
                        tokio::time::sleep(policy.delay_for(attempt - 1)).await;
                        continue;
                    }
                    return Err(classified);
                }
            }
        }
    }

    /// poll until the transaction is terminal, reporting progress each
    /// second; on timeout returns a pending terminal record
    pub async fn wait(
        &self,
        digest: &str,
        timeout: Option<Duration>,
        opts: &SubmitOptions,
    ) -> Result<TxStatus> {
        let timeout =
            timeout.unwrap_or_else(|| Duration::from_secs(self.config.wait_timeout_secs));
        let started = std::time::Instant::now();

        loop {
            ensure_active(&opts.cancel)?;

            match self.client.get_transaction(digest).await? {
                TxStatus::Pending => {
                    if started.elapsed() >= timeout {
                        tracing::warn!(digest, "confirmation timed out, reporting pending");
                        return Ok(TxStatus::Pending);
                    }
                    opts.progress
                        .emit(Phase::Confirming, format!("awaiting {}", digest));
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                terminal => return Ok(terminal),
            }
        }
    }

    /// the full phase sequence:
    /// preparing -> estimating_gas -> executing (-> retrying) ->
    /// confirming -> completed | failed
    pub async fn submit_and_wait(
        &self,
        tx: &Transaction,
        signer: &dyn Signer,
        opts: &SubmitOptions,
    ) -> Result<TxResult> {
        let started = std::time::Instant::now();
        opts.progress.emit(
            Phase::Preparing,
            format!("{} operations", tx.operations.len()),
        );
        self.check_size(tx)?;
        ensure_active(&opts.cancel)?;

        opts.progress.emit(Phase::EstimatingGas, "dry run");
        let gas_budget = match opts.gas_budget {
            Some(budget) => budget,
            None => self.estimate_gas(tx, signer.address()).await?,
        };

        opts.progress.emit(Phase::Executing, "submitting");
        let submit_opts = SubmitOptions {
            gas_budget: Some(gas_budget),
            ..opts.clone()
        };
        let (digest, attempts) = match self.submit(tx, signer, &submit_opts).await {
            Ok(r) => r,
            Err(e) => {
                opts.progress.emit(Phase::Failed, e.to_string());
                return Err(e);
            }
        };

        opts.progress.emit(Phase::Confirming, digest.clone());
        let status = self.wait(&digest, opts.timeout, opts).await?;

        let gas_used = match &status {
            TxStatus::Success { gas_used } => {
                opts.progress.emit(Phase::Completed, digest.clone());
                *gas_used
            }
            TxStatus::Failure { message } => {
                opts.progress.emit(Phase::Failed, message.clone());
                return Err(classify_error_text(message));
            }
            TxStatus::Pending => 0,
        };

        Ok(TxResult {
            digest,
            status,
            gas_used,
            attempts,
            elapsed: started.elapsed(),
        })
    }

    fn check_size(&self, tx: &Transaction) -> Result<()> {
        let limit =
            (self.config.block_size_cap as f64 * self.config.tx_size_fraction) as u64;
        if tx.serialized_size() > limit {
            return Err(Error::Ledger {
                kind: crate::error::LedgerErrorKind::TxTooLarge,
                message: format!(
                    "transaction of {} bytes exceeds the {} byte limit",
                    tx.serialized_size(),
                    limit
                ),
            });
        }
        Ok(())
    }
}

/// non-retryable errors whose text matches the retryable word list are
/// downgraded to transient network errors
fn reclassify(e: Error) -> Error {
    if e.is_retryable() {
        return e;
    }
    let text = e.to_string();
    let reclassified = classify_error_text(&text);
    if reclassified.is_retryable() {
        reclassified
    } else {
        e
    }
}
