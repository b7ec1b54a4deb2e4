use futures::stream::{self, StreamExt};

use crate::config::LedgerConfig;
use crate::error::Result;
use crate::ledger::{Operation, Signer, SubmitOptions, Transaction, TxEngine, TxResult};
use crate::progress::Phase;

/// limits applied when grouping operations into transactions
#[derive(Clone, Debug)]
pub struct BatchOptions {
    /// serialized-size budget per transaction
    pub max_tx_bytes: u64,
    /// complexity budget per transaction
    pub max_complexity: u64,
    /// concurrent submissions; defaults to min(3, batches/2)
    pub concurrency: Option<usize>,
}

impl BatchOptions {
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            max_tx_bytes: (config.block_size_cap as f64 * config.tx_size_fraction) as u64,
            max_complexity: 64,
            concurrency: None,
        }
    }
}

/// group operations into transactions respecting both the size and the
/// complexity budget; a single oversized operation occupies its own batch
pub fn plan_batches(operations: Vec<Operation>, opts: &BatchOptions) -> Vec<Transaction> {
    let mut batches = Vec::new();
    let mut current = Transaction::default();
    let mut current_bytes = 0u64;
    let mut current_complexity = 0u64;

    for op in operations {
        let op_bytes = op.serialized_size();
        let op_complexity = op.complexity();

        let oversized = op_bytes > opts.max_tx_bytes || op_complexity > opts.max_complexity;
        if oversized {
            if !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                current_bytes = 0;
                current_complexity = 0;
            }
            batches.push(Transaction {
                operations: vec![op],
            });
            continue;
        }

        let fits = current_bytes + op_bytes <= opts.max_tx_bytes
            && current_complexity + op_complexity <= opts.max_complexity;
        if !fits && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
            current_complexity = 0;
        }

        current_bytes += op_bytes;
        current_complexity += op_complexity;
        current.operations.push(op);
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

/// submit batches with bounded concurrency, preserving input order in the
/// results; queued batches report pending progress until admitted
pub async fn run_batches(
    engine: &TxEngine,
    batches: Vec<Transaction>,
    signer: &dyn Signer,
    batch_opts: &BatchOptions,
    opts: &SubmitOptions,
) -> Result<Vec<TxResult>> {
    if batches.is_empty() {
        return Ok(Vec::new());
    }

    let concurrency = batch_opts
        .concurrency
        .unwrap_or_else(|| std::cmp::min(3, std::cmp::max(1, batches.len() / 2)));
    let total = batches.len();

    let mut stream = stream::iter(batches.into_iter().enumerate().map(|(index, tx)| {
        opts.progress
            .emit(Phase::Pending, format!("batch {}/{} queued", index + 1, total));
        async move {
            let result = engine.submit_and_wait(&tx, signer, opts).await?;
            Ok::<_, crate::Error>((index, result))
        }
    }))
    .buffer_unordered(concurrency);

    let mut results: Vec<Option<TxResult>> = (0..total).map(|_| None).collect();
    while let Some(item) = stream.next().await {
        let (index, result) = item?;
        results[index] = Some(result);
    }
    drop(stream);

    Ok(results.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Hash;
    use crate::ledger::{LocalSigner, MemoryLedger, TxBuilder};
    use std::sync::Arc;

    fn blob_op(i: usize) -> Operation {
        Operation::CreateBlob {
            remote_id: format!("cid-{}", i),
            size: 64,
            hash: Hash::ZERO,
            encoding: "zlib".into(),
        }
    }

    #[test]
    fn test_plan_respects_complexity_budget() {
        let opts = BatchOptions {
            max_tx_bytes: 1024 * 1024,
            max_complexity: 3,
            concurrency: None,
        };
        let ops: Vec<_> = (0..7).map(blob_op).collect();
        let batches = plan_batches(ops, &opts);

        assert!(batches.len() >= 3);
        for batch in &batches {
            assert!(batch.complexity() <= 3);
        }
        let total: usize = batches.iter().map(|b| b.operations.len()).sum();
        assert_eq!(total, 7);
    }

    #[test]
    fn test_plan_respects_size_budget() {
        let one_size = blob_op(0).serialized_size();
        let opts = BatchOptions {
            max_tx_bytes: one_size * 2,
            max_complexity: 1000,
            concurrency: None,
        };
        let batches = plan_batches((0..5).map(blob_op).collect(), &opts);
        for batch in &batches {
            assert!(batch.operations.len() <= 2);
        }
    }

    #[test]
    fn test_oversized_operation_gets_own_batch() {
        let opts = BatchOptions {
            max_tx_bytes: 10, // every op is oversized
            max_complexity: 1000,
            concurrency: None,
        };
        let batches = plan_batches((0..3).map(blob_op).collect(), &opts);
        assert_eq!(batches.len(), 3);
        for batch in &batches {
            assert_eq!(batch.operations.len(), 1);
        }
    }

    #[test]
    fn test_empty_plan() {
        let opts = BatchOptions {
            max_tx_bytes: 100,
            max_complexity: 10,
            concurrency: None,
        };
        assert!(plan_batches(vec![], &opts).is_empty());
    }

    #[tokio::test]
    async fn test_run_batches_preserves_order() {
        let ledger = Arc::new(MemoryLedger::new());
        let engine = TxEngine::new(ledger, crate::config::LedgerConfig::default());
        let signer = LocalSigner::new("0xs", [1; 32]);

        let batches: Vec<_> = (0..4)
            .map(|i| {
                TxBuilder::default()
                    .create_blob(format!("cid-{}", i), 64, Hash::from_bytes([i as u8; 20]), "zlib")
                    .finish()
            })
            .collect();

        let batch_opts = BatchOptions::from_config(&crate::config::LedgerConfig::default());
        let results = run_batches(&engine, batches, &signer, &batch_opts, &SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 4);
        // digests are distinct per transaction
        let mut digests: Vec<_> = results.iter().map(|r| r.digest.clone()).collect();
        digests.dedup();
        assert_eq!(digests.len(), 4);
    }
}
