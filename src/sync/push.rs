//! push: walk unpushed commits, create their objects on the ledger in
//! batches, and advance the branch reference in the final transaction.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::{ConflictKind, Error, LedgerErrorKind, Result};
use crate::hash::Hash;
use crate::history;
use crate::ledger::{Operation, SubmitOptions, Transaction, TxDigest};
use crate::object;
use crate::progress::Phase;
use crate::refs;
use crate::sync::SyncContext;
use crate::types::EntryMode;

/// options for a push
#[derive(Clone, Debug, Default)]
pub struct PushOptions {
    /// overwrite a diverged remote branch via the dedicated force call
    pub force: bool,
    /// commits per ledger batch; the config default when absent
    pub batch_commits: Option<usize>,
}

/// one submitted batch
#[derive(Clone, Debug)]
pub struct BatchReport {
    pub digest: TxDigest,
    pub gas_used: u64,
    pub operations: usize,
    pub attempts: u32,
}

/// what a push did
#[derive(Debug)]
pub struct PushReport {
    pub branch: String,
    pub tip: Hash,
    pub commits_pushed: usize,
    pub batches: Vec<BatchReport>,
    pub bytes_pushed: u64,
    pub elapsed: Duration,
    pub up_to_date: bool,
    pub forced: bool,
}

/// push a branch to the ledger
pub async fn push(ctx: &SyncContext, branch: &str, opts: &PushOptions) -> Result<PushReport> {
    let started = std::time::Instant::now();
    let (tx_engine, signer) = ctx.require_ledger()?;

    let tip = refs::read_ref(&ctx.repo, &refs::branch_ref(branch))?
        .ok_or_else(|| Error::ref_not_found(branch))?;

    ctx.progress.emit(Phase::Preparing, format!("pushing {}", branch));
    let remote_tip = ctx.ledger()?.get_branch(&ctx.repo_id, branch).await?;

    if remote_tip == Some(tip) {
        return Ok(PushReport {
            branch: branch.to_string(),
            tip,
            commits_pushed: 0,
            batches: vec![],
            bytes_pushed: 0,
            elapsed: started.elapsed(),
            up_to_date: true,
            forced: false,
        });
    }

    // pre-push: refuse a non-fast-forward unless forced
    let mut forced = false;
    if let Some(remote_tip) = remote_tip {
        if !history::is_ancestor(&ctx.repo, &remote_tip, &tip)? {
            if !opts.force {
                return Err(Error::Conflict(ConflictKind::NonFastForward));
            }
            forced = true;
        }
    }

    // commits not yet on the ledger, parents before children
    let new_commits = collect_unpushed(ctx, &tip, remote_tip).await?;

    // every object of those commits, then its bytes onto the blob service
    let mut bytes_pushed = 0u64;
    let mut batches: Vec<BatchReport> = Vec::new();
    let batch_size = opts
        .batch_commits
        .unwrap_or(tx_engine.config().push_batch_commits)
        .max(1);

    let commit_batches: Vec<&[Hash]> = new_commits.chunks(batch_size).collect();
    let total_batches = commit_batches.len();
    let mut created: HashSet<Hash> = HashSet::new();

    for (batch_index, commit_batch) in commit_batches.iter().enumerate() {
        let is_final = batch_index + 1 == total_batches;
        ctx.progress.emit(
            Phase::Executing,
            format!("batch {}/{}", batch_index + 1, total_batches),
        );

        let mut operations = Vec::new();
        for commit_hash in commit_batch.iter() {
            let (ops, bytes) = commit_operations(ctx, commit_hash, &mut created).await?;
            bytes_pushed += bytes;
            operations.extend(ops);
        }

        if is_final {
            operations.push(branch_update(ctx, branch, tip, remote_tip, forced));
        }

        let submit_opts = SubmitOptions {
            progress: ctx.progress.clone(),
            cancel: ctx.cancel.clone(),
            ..Default::default()
        };
        let tx = Transaction { operations };
        let op_count = tx.operations.len();

        let result = match tx_engine.submit_and_wait(&tx, signer.as_ref(), &submit_opts).await {
            Ok(result) => result,
            Err(Error::Ledger {
                kind: LedgerErrorKind::TxTooLarge,
                ..
            }) if is_final && op_count > 1 => {
                // re-enter with the objects alone, then a ref-only update
                let mut object_ops = tx.operations;
                let ref_op = match object_ops.pop() {
                    Some(op) => op,
                    None => return Err(partial(&batches, total_batches, Error::Format(
                        "empty final batch".to_string(),
                    ))),
                };
                let objects_tx = Transaction {
                    operations: object_ops,
                };
                let first = tx_engine
                    .submit_and_wait(&objects_tx, signer.as_ref(), &submit_opts)
                    .await
                    .map_err(|e| partial(&batches, total_batches, e))?;
                batches.push(BatchReport {
                    digest: first.digest,
                    gas_used: first.gas_used,
                    operations: objects_tx.operations.len(),
                    attempts: first.attempts,
                });
                let ref_tx = Transaction {
                    operations: vec![ref_op],
                };
                tx_engine
                    .submit_and_wait(&ref_tx, signer.as_ref(), &submit_opts)
                    .await
                    .map_err(|e| partial(&batches, total_batches, e))?
            }
            Err(e) => return Err(partial(&batches, total_batches, e)),
        };

        batches.push(BatchReport {
            digest: result.digest,
            gas_used: result.gas_used,
            operations: op_count,
            attempts: result.attempts,
        });
    }

    // track what the remote now points at
    refs::write_ref(
        &ctx.repo,
        &refs::remote_ref(&ctx.remote_name, branch),
        &tip,
        None,
    )?;

    ctx.progress.emit(Phase::Completed, format!("pushed {}", branch));
    tracing::info!(
        branch,
        commits = new_commits.len(),
        batches = batches.len(),
        bytes = bytes_pushed,
        "push complete"
    );

    Ok(PushReport {
        branch: branch.to_string(),
        tip,
        commits_pushed: new_commits.len(),
        batches,
        bytes_pushed,
        elapsed: started.elapsed(),
        up_to_date: false,
        forced,
    })
}

/// commits reachable from `tip` but absent from the ledger, ordered
/// parents-first
async fn collect_unpushed(
    ctx: &SyncContext,
    tip: &Hash,
    remote_tip: Option<Hash>,
) -> Result<Vec<Hash>> {
    let mut order = Vec::new();
    let mut visited: HashSet<Hash> = HashSet::new();
    let mut stack: Vec<(Hash, bool)> = vec![(*tip, false)];

    while let Some((hash, expanded)) = stack.pop() {
        if expanded {
            order.push(hash);
            continue;
        }
        if !visited.insert(hash) {
            continue;
        }
        if remote_tip == Some(hash) || ctx.ledger()?.has_object(&ctx.repo_id, &hash).await? {
            continue;
        }

        let commit = ctx.engine.get_commit(&hash, &ctx.cancel).await?;
        stack.push((hash, true));
        for parent in commit.parents {
            if !visited.contains(&parent) {
                stack.push((parent, false));
            }
        }
    }

    Ok(order)
}

/// ledger operations creating one commit's objects; uploads any object
/// bytes the blob service is missing and returns the bytes transferred
async fn commit_operations(
    ctx: &SyncContext,
    commit_hash: &Hash,
    created: &mut HashSet<Hash>,
) -> Result<(Vec<Operation>, u64)> {
    let mut operations = Vec::new();
    let mut bytes = 0u64;

    let commit = ctx.engine.get_commit(commit_hash, &ctx.cancel).await?;

    // tree closure first so objects exist before the commit referencing them
    let mut tree_stack = vec![commit.tree];
    let mut blobs = Vec::new();
    let mut trees = Vec::new();
    while let Some(tree_hash) = tree_stack.pop() {
        if !created.insert(tree_hash) {
            continue;
        }
        let tree = ctx.engine.get_tree(&tree_hash, &ctx.cancel).await?;
        for entry in tree.entries() {
            match entry.mode {
                EntryMode::Tree => tree_stack.push(entry.id),
                _ => {
                    if created.insert(entry.id) {
                        blobs.push(entry.id);
                    }
                }
            }
        }
        trees.push((tree_hash, tree));
    }

    for blob_hash in blobs {
        if ctx.ledger()?.has_object(&ctx.repo_id, &blob_hash).await? {
            continue;
        }
        bytes += upload_object(ctx, &blob_hash).await?;
        let size = object::get(&ctx.repo, &blob_hash)
            .map(|b| b.len() as u64)
            .unwrap_or(0);
        operations.push(Operation::CreateBlob {
            remote_id: blob_hash.to_hex(),
            size,
            hash: blob_hash,
            encoding: "zlib".to_string(),
        });
    }

    for (tree_hash, tree) in trees {
        if ctx.ledger()?.has_object(&ctx.repo_id, &tree_hash).await? {
            continue;
        }
        bytes += upload_object(ctx, &tree_hash).await?;
        operations.push(Operation::CreateTree {
            hash: tree_hash,
            entries: tree
                .entries()
                .iter()
                .map(|e| crate::ledger::LedgerTreeEntry {
                    name: e.name.clone(),
                    kind: if e.mode.is_tree() { "tree" } else { "blob" }.to_string(),
                    id: e.id,
                    mode: e.mode.octal(),
                })
                .collect(),
        });
    }

    bytes += upload_object(ctx, commit_hash).await?;
    operations.push(Operation::CreateCommit {
        hash: *commit_hash,
        tree: commit.tree,
        parents: commit.parents.clone(),
        message: commit.message.clone(),
        timestamp: commit.timestamp.to_rfc3339(),
        manifest_cid: commit.manifest_cid.clone(),
        wrapped_dek_cid: commit.wrapped_dek_cid.clone(),
    });

    Ok((operations, bytes))
}

/// ship one object's compressed bytes to the blob service if absent
async fn upload_object(ctx: &SyncContext, hash: &Hash) -> Result<u64> {
    let remote = match ctx.engine.remote() {
        Some(remote) => remote,
        None => return Ok(0),
    };
    let key = hash.to_hex();
    if remote.exists(&key, &ctx.cancel).await? {
        return Ok(0);
    }
    let compressed = object::get(&ctx.repo, hash)?;
    remote.upload(&key, &compressed, None, &ctx.cancel).await?;
    Ok(compressed.len() as u64)
}

fn branch_update(
    ctx: &SyncContext,
    branch: &str,
    tip: Hash,
    remote_tip: Option<Hash>,
    forced: bool,
) -> Operation {
    if forced {
        Operation::ForceUpdateBranch {
            repo_id: ctx.repo_id.clone(),
            branch: branch.to_string(),
            commit: tip,
        }
    } else {
        Operation::UpdateBranch {
            repo_id: ctx.repo_id.clone(),
            branch: branch.to_string(),
            commit: tip,
            expected: remote_tip,
        }
    }
}

/// a failure with completed batches becomes a partial-success error that
/// names what already landed; nothing is silently dropped
fn partial(batches: &[BatchReport], total: usize, source: Error) -> Error {
    if batches.is_empty() {
        return source;
    }
    Error::PartialPush {
        completed_batches: batches.len(),
        total_batches: total,
        last_digest: batches.last().map(|b| b.digest.clone()),
        source: Box::new(source),
    }
}
