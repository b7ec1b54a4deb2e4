//! fetch: mirror the remote commit chain locally without touching the
//! working directory; blob content stays deferred until checkout or pull.

use std::collections::HashSet;

use crate::error::Result;
use crate::hash::Hash;
use crate::object;
use crate::progress::Phase;
use crate::refs;
use crate::sync::SyncContext;
use crate::types::EntryMode;

/// options for a fetch
#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    /// bound on the commit-chain walk; unbounded when absent
    pub depth: Option<usize>,
    /// drop remote-tracking refs whose branch no longer exists
    pub prune: bool,
}

/// what a fetch brought in
#[derive(Debug)]
pub struct FetchReport {
    pub branch: String,
    pub remote_tip: Option<Hash>,
    pub commits_fetched: usize,
    pub trees_fetched: usize,
    pub pruned_refs: Vec<String>,
}

/// fetch a branch from the ledger and blob service
pub async fn fetch(
    ctx: &SyncContext,
    branch: Option<&str>,
    opts: &FetchOptions,
) -> Result<FetchReport> {
    let branch = branch
        .map(str::to_string)
        .unwrap_or_else(|| ctx.repo.config().repository.default_branch.clone());

    ctx.progress.emit(Phase::Preparing, format!("fetching {}", branch));
    let remote_tip = ctx.ledger()?.get_branch(&ctx.repo_id, &branch).await?;

    let mut commits_fetched = 0usize;
    let mut trees_fetched = 0usize;

    if let Some(tip) = remote_tip {
        // walk the remote chain, downloading commit and tree objects;
        // commits already local terminate their branch of the walk
        let mut queue = vec![(tip, 0usize)];
        let mut visited: HashSet<Hash> = HashSet::new();

        while let Some((hash, depth)) = queue.pop() {
            if !visited.insert(hash) {
                continue;
            }
            if let Some(max) = opts.depth {
                if depth >= max {
                    continue;
                }
            }

            let was_local = object::exists(&ctx.repo, &hash);
            let commit = ctx.engine.get_commit(&hash, &ctx.cancel).await?;
            if !was_local {
                commits_fetched += 1;
                trees_fetched += fetch_trees(ctx, &commit.tree).await?;
                for parent in commit.parents {
                    queue.push((parent, depth + 1));
                }
            }
        }

        refs::write_ref(
            &ctx.repo,
            &refs::remote_ref(&ctx.remote_name, &branch),
            &tip,
            None,
        )?;
    }

    let mut pruned_refs = Vec::new();
    if opts.prune {
        pruned_refs = prune_remote_refs(ctx).await?;
    }

    ctx.progress.emit(
        Phase::Completed,
        format!("fetched {} commits", commits_fetched),
    );
    tracing::info!(
        %branch,
        commits = commits_fetched,
        trees = trees_fetched,
        "fetch complete"
    );

    Ok(FetchReport {
        branch,
        remote_tip,
        commits_fetched,
        trees_fetched,
        pruned_refs,
    })
}

/// download the root tree and every subtree; blob entries only surface
/// their metadata (hash, mode) here
async fn fetch_trees(ctx: &SyncContext, root: &Hash) -> Result<usize> {
    let mut fetched = 0usize;
    let mut stack = vec![*root];
    let mut visited: HashSet<Hash> = HashSet::new();

    while let Some(tree_hash) = stack.pop() {
        if !visited.insert(tree_hash) {
            continue;
        }
        let was_local = object::exists(&ctx.repo, &tree_hash);
        let tree = ctx.engine.get_tree(&tree_hash, &ctx.cancel).await?;
        if !was_local {
            fetched += 1;
        }
        for entry in tree.entries() {
            if entry.mode == EntryMode::Tree {
                stack.push(entry.id);
            }
        }
    }

    Ok(fetched)
}

/// remove remote-tracking refs whose remote branch disappeared
async fn prune_remote_refs(ctx: &SyncContext) -> Result<Vec<String>> {
    let prefix = format!("refs/remotes/{}", ctx.remote_name);
    let mut pruned = Vec::new();

    for (name, _) in refs::list_refs(&ctx.repo, &prefix)? {
        let branch = match name.strip_prefix(&format!("{}/", prefix)) {
            Some(b) => b.to_string(),
            None => continue,
        };
        if !ctx.ledger()?.branch_exists(&ctx.repo_id, &branch).await? {
            refs::delete_ref(&ctx.repo, &name)?;
            tracing::debug!(%name, "pruned stale remote-tracking ref");
            pruned.push(name);
        }
    }

    Ok(pruned)
}
