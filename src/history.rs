use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::Result;
use crate::hash::Hash;
use crate::object::read_commit;
use crate::repo::Repo;
use crate::types::Commit;

/// default bound on ancestry walks
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// commits reachable from `from`, depth-first over parents, bounded
///
/// includes `from` itself. commits missing from the local store terminate
/// their branch of the walk.
pub fn ancestors(repo: &Repo, from: &Hash, max_depth: Option<usize>) -> Result<Vec<Hash>> {
    let max_depth = max_depth.unwrap_or(DEFAULT_MAX_DEPTH);
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(*from, 0usize)];

    while let Some((hash, depth)) = stack.pop() {
        if depth > max_depth || !visited.insert(hash) {
            continue;
        }
        out.push(hash);

        if let Ok(commit) = read_commit(repo, &hash) {
            for parent in commit.parents.iter().rev() {
                stack.push((*parent, depth + 1));
            }
        }
    }

    Ok(out)
}

/// check whether `ancestor` is reachable from `descendant`
pub fn is_ancestor(repo: &Repo, ancestor: &Hash, descendant: &Hash) -> Result<bool> {
    if ancestor == descendant {
        return Ok(true);
    }
    Ok(ancestors(repo, descendant, None)?.contains(ancestor))
}

/// relationship between two commit tips
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Comparison {
    pub common_ancestor: Option<Hash>,
    /// commits on the local side past the merge base
    pub local_ahead: usize,
    /// commits on the remote side past the merge base
    pub remote_ahead: usize,
    pub diverged: bool,
    pub fast_forwardable: bool,
}

/// compare two tips: merge base, ahead/behind counts, divergence
///
/// enumerates hashes reachable from both tips, picks the common hash
/// closest to the tips as the merge base, and derives the counts as path
/// lengths to that base. fast-forward means one side's count is zero.
pub fn compare(repo: &Repo, local: &Hash, remote: &Hash) -> Result<Comparison> {
    let local_depths = reachable_depths(repo, local);
    let remote_depths = reachable_depths(repo, remote);

    let base = local_depths
        .iter()
        .filter_map(|(hash, ld)| remote_depths.get(hash).map(|rd| (*hash, ld + rd)))
        .min_by_key(|(hash, combined)| (*combined, *hash))
        .map(|(hash, _)| hash);

    let (local_ahead, remote_ahead) = match base {
        Some(base) => (local_depths[&base], remote_depths[&base]),
        None => (local_depths.len(), remote_depths.len()),
    };

    Ok(Comparison {
        common_ancestor: base,
        local_ahead,
        remote_ahead,
        diverged: local_ahead > 0 && remote_ahead > 0,
        fast_forwardable: local_ahead == 0 || remote_ahead == 0,
    })
}

/// minimum parent-path length from the tip to every reachable commit
fn reachable_depths(repo: &Repo, tip: &Hash) -> HashMap<Hash, usize> {
    let mut depths = HashMap::new();
    let mut queue = VecDeque::new();
    queue.push_back((*tip, 0usize));

    while let Some((hash, depth)) = queue.pop_front() {
        if depth > DEFAULT_MAX_DEPTH {
            continue;
        }
        match depths.get(&hash) {
            Some(&existing) if existing <= depth => continue,
            _ => {}
        }
        depths.insert(hash, depth);

        if let Ok(commit) = read_commit(repo, &hash) {
            for parent in &commit.parents {
                queue.push_back((*parent, depth + 1));
            }
        }
    }

    depths
}

/// a commit with its hash, as yielded by the log walk
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub hash: Hash,
    pub commit: Commit,
}

/// linear history from a tip, following first parents
pub fn log(repo: &Repo, from: &Hash, limit: Option<usize>) -> Result<Vec<LogEntry>> {
    let limit = limit.unwrap_or(DEFAULT_MAX_DEPTH);
    let mut out = Vec::new();
    let mut cursor = Some(*from);

    while let Some(hash) = cursor {
        if out.len() >= limit {
            break;
        }
        let commit = match read_commit(repo, &hash) {
            Ok(c) => c,
            Err(_) => break,
        };
        cursor = commit.parents.first().copied();
        out.push(LogEntry { hash, commit });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::write_commit;
    use tempfile::tempdir;

    fn test_repo() -> (tempfile::TempDir, Repo) {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path(), "test").unwrap();
        (dir, repo)
    }

    fn commit_on(repo: &Repo, parents: Vec<Hash>, msg: &str) -> Hash {
        write_commit(repo, &Commit::new(Hash::ZERO, parents, "0xauthor", msg)).unwrap()
    }

    #[test]
    fn test_linear_ancestry() {
        let (_dir, repo) = test_repo();

        let a = commit_on(&repo, vec![], "a");
        let b = commit_on(&repo, vec![a], "b");
        let c = commit_on(&repo, vec![b], "c");

        let walked = ancestors(&repo, &c, None).unwrap();
        assert_eq!(walked, vec![c, b, a]);

        assert!(is_ancestor(&repo, &a, &c).unwrap());
        assert!(is_ancestor(&repo, &b, &c).unwrap());
        assert!(!is_ancestor(&repo, &c, &a).unwrap());
        assert!(is_ancestor(&repo, &b, &b).unwrap());
    }

    #[test]
    fn test_ancestry_depth_bound() {
        let (_dir, repo) = test_repo();

        let mut tip = commit_on(&repo, vec![], "root");
        for i in 0..10 {
            tip = commit_on(&repo, vec![tip], &format!("c{}", i));
        }

        let walked = ancestors(&repo, &tip, Some(3)).unwrap();
        assert_eq!(walked.len(), 4); // tip plus three ancestors
    }

    #[test]
    fn test_compare_fast_forward() {
        let (_dir, repo) = test_repo();

        let a = commit_on(&repo, vec![], "a");
        let b = commit_on(&repo, vec![a], "b");
        let c = commit_on(&repo, vec![b], "c");

        // local ahead of remote
        let cmp = compare(&repo, &c, &a).unwrap();
        assert_eq!(cmp.common_ancestor, Some(a));
        assert_eq!(cmp.local_ahead, 2);
        assert_eq!(cmp.remote_ahead, 0);
        assert!(!cmp.diverged);
        assert!(cmp.fast_forwardable);

        // identical tips
        let cmp = compare(&repo, &c, &c).unwrap();
        assert_eq!(cmp.local_ahead, 0);
        assert_eq!(cmp.remote_ahead, 0);
        assert!(cmp.fast_forwardable);
    }

    #[test]
    fn test_compare_diverged() {
        let (_dir, repo) = test_repo();

        let base = commit_on(&repo, vec![], "base");
        let local = commit_on(&repo, vec![base], "local work");
        let remote = commit_on(&repo, vec![base], "remote work");

        let cmp = compare(&repo, &local, &remote).unwrap();
        assert_eq!(cmp.common_ancestor, Some(base));
        assert_eq!(cmp.local_ahead, 1);
        assert_eq!(cmp.remote_ahead, 1);
        assert!(cmp.diverged);
        assert!(!cmp.fast_forwardable);
    }

    #[test]
    fn test_compare_unrelated_histories() {
        let (_dir, repo) = test_repo();

        let a = commit_on(&repo, vec![], "island a");
        let b = commit_on(&repo, vec![], "island b");

        let cmp = compare(&repo, &a, &b).unwrap();
        assert_eq!(cmp.common_ancestor, None);
        assert!(cmp.diverged);
    }

    #[test]
    fn test_merge_base_prefers_nearest() {
        let (_dir, repo) = test_repo();

        let old = commit_on(&repo, vec![], "old");
        let base = commit_on(&repo, vec![old], "base");
        let local = commit_on(&repo, vec![base], "local");
        let remote = commit_on(&repo, vec![base], "remote");

        let cmp = compare(&repo, &local, &remote).unwrap();
        assert_eq!(cmp.common_ancestor, Some(base));
    }

    #[test]
    fn test_log_linear() {
        let (_dir, repo) = test_repo();

        let a = commit_on(&repo, vec![], "a");
        let b = commit_on(&repo, vec![a], "b");
        let c = commit_on(&repo, vec![b], "c");

        let entries = log(&repo, &c, None).unwrap();
        let messages: Vec<_> = entries.iter().map(|e| e.commit.message.as_str()).collect();
        assert_eq!(messages, ["c", "b", "a"]);

        let limited = log(&repo, &c, Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
    }
}
