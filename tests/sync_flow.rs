//! end-to-end flows across two workspaces sharing one ledger and one
//! blob service: commit, push, fetch, pull, clone.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use walgit::cache::MultiCache;
use walgit::crypto::{KeyWrapClient, MemoryKeyWrapClient};
use walgit::engine::ObjectEngine;
use walgit::hash::sha256_hex;
use walgit::ledger::{LedgerClient, LocalSigner, MemoryLedger, Signer, TxEngine};
use walgit::progress::Progress;
use walgit::refs;
use walgit::remote::{MemoryBlobService, RemoteStore};
use walgit::sync::{
    self, CloneContext, CloneOptions, CommitOptions, FetchOptions, PullOptions, PushOptions,
    SyncContext, WorkingSetStatus, WorkspaceScanner,
};
use walgit::{Error, LedgerConfig, Repo, StorageConfig};

const REPO_ID: &str = "0xrepo";
const POLICY: &str = "policy-main";

struct World {
    service: Arc<MemoryBlobService>,
    ledger: Arc<MemoryLedger>,
    keys: Arc<MemoryKeyWrapClient>,
}

impl World {
    fn new() -> Self {
        let keys = Arc::new(MemoryKeyWrapClient::new());
        keys.register_policy(POLICY);
        Self {
            service: Arc::new(MemoryBlobService::new()),
            ledger: Arc::new(MemoryLedger::new()),
            keys,
        }
    }

    fn remote_store(&self) -> Arc<RemoteStore> {
        Arc::new(RemoteStore::new(
            self.service.clone(),
            &StorageConfig::default(),
            "blob.test",
        ))
    }
}

struct StubScanner {
    index: Mutex<BTreeMap<String, String>>,
}

impl StubScanner {
    fn new() -> Self {
        Self {
            index: Mutex::new(BTreeMap::new()),
        }
    }

    fn record(&self, path: &str, sha256: String) {
        self.index.lock().insert(path.to_string(), sha256);
    }
}

impl WorkspaceScanner for StubScanner {
    fn status(&self) -> walgit::Result<WorkingSetStatus> {
        Ok(WorkingSetStatus {
            index: self.index.lock().clone(),
            ..Default::default()
        })
    }
}

struct Workspace {
    _dir: Option<tempfile::TempDir>,
    repo: Arc<Repo>,
    engine: Arc<ObjectEngine>,
    scanner: Arc<StubScanner>,
}

impl Workspace {
    fn init(world: &World) -> Self {
        let dir = tempdir().unwrap();
        let mut repo = Repo::init(dir.path(), "workspace").unwrap();
        repo.config_mut().repository.id = Some(REPO_ID.to_string());
        repo.config_mut().repository.policy_id = Some(POLICY.to_string());
        repo.save_config().unwrap();
        Self::around(world, repo, Some(dir))
    }

    fn open(world: &World, path: &Path) -> Self {
        let repo = Repo::open(path).unwrap();
        Self::around(world, repo, None)
    }

    fn around(world: &World, repo: Repo, dir: Option<tempfile::TempDir>) -> Self {
        let repo = Arc::new(repo);
        let storage = StorageConfig::default();
        let cache = Arc::new(
            MultiCache::open(&repo.walgit_path().join("cache"), &storage).unwrap(),
        );
        let engine = Arc::new(ObjectEngine::new(
            repo.clone(),
            cache,
            Some(world.remote_store()),
        ));
        Self {
            _dir: dir,
            repo,
            engine,
            scanner: Arc::new(StubScanner::new()),
        }
    }

    fn ctx(&self, world: &World, with_ledger: bool) -> SyncContext {
        let signer: Arc<dyn Signer> = Arc::new(LocalSigner::new("0xauthor", [1; 32]));
        SyncContext {
            repo: self.repo.clone(),
            engine: self.engine.clone(),
            tx: with_ledger.then(|| {
                Arc::new(TxEngine::new(world.ledger.clone(), LedgerConfig::default()))
            }),
            signer: Some(signer),
            key_client: Some(world.keys.clone() as Arc<dyn KeyWrapClient>),
            session: Some(MemoryKeyWrapClient::approved_session(POLICY)),
            scanner: Some(self.scanner.clone()),
            repo_id: REPO_ID.to_string(),
            remote_name: "origin".to_string(),
            progress: Progress::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.repo.work_dir().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.repo.work_dir().join(rel)).unwrap()
    }

    fn branch_tip(&self, branch: &str) -> Option<walgit::Hash> {
        refs::read_ref(&self.repo, &refs::branch_ref(branch)).unwrap()
    }
}

#[tokio::test]
async fn test_commit_lands_on_ledger() {
    let world = World::new();
    let ws = Workspace::init(&world);
    ws.write("README.md", "hello v1\n");

    let ctx = ws.ctx(&world, true);
    let report = sync::commit(&ctx, &CommitOptions::new("initial")).await.unwrap();

    assert_eq!(report.files, 1);
    assert!(report.manifest_cid.is_some());
    assert!(report.wrapped_dek_cid.is_some());
    assert!(report.digest.is_some());

    assert_eq!(world.ledger.branch_tip(REPO_ID, "main"), Some(report.commit));
    assert_eq!(ws.branch_tip("main"), Some(report.commit));
    assert!(world
        .ledger
        .has_object(REPO_ID, &report.commit)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_push_fast_forward() {
    let world = World::new();
    let ws = Workspace::init(&world);

    // commit a online so the remote already has it
    ws.write("a.txt", "a");
    let a = sync::commit(&ws.ctx(&world, true), &CommitOptions::new("a"))
        .await
        .unwrap()
        .commit;

    // b and c are created offline
    ws.write("b.txt", "b");
    let b = sync::commit(&ws.ctx(&world, false), &CommitOptions::new("b"))
        .await
        .unwrap()
        .commit;
    ws.write("c.txt", "c");
    let c = sync::commit(&ws.ctx(&world, false), &CommitOptions::new("c"))
        .await
        .unwrap()
        .commit;

    assert_eq!(world.ledger.branch_tip(REPO_ID, "main"), Some(a));

    let ctx = ws.ctx(&world, true);
    let report = sync::push(&ctx, "main", &PushOptions::default()).await.unwrap();

    assert_eq!(report.commits_pushed, 2);
    assert_eq!(report.batches.len(), 1);
    assert!(!report.forced);

    // push safety: the branch equals the local tip and every ancestor
    // object exists remotely
    assert_eq!(world.ledger.branch_tip(REPO_ID, "main"), Some(c));
    assert!(world.ledger.branch_exists(REPO_ID, "main").await.unwrap());
    for commit in [a, b, c] {
        assert!(world.ledger.has_object(REPO_ID, &commit).await.unwrap());
    }

    // remote-tracking ref follows
    assert_eq!(
        refs::read_ref(&ws.repo, &refs::remote_ref("origin", "main")).unwrap(),
        Some(c)
    );

    // a second push is a no-op
    let again = sync::push(&ctx, "main", &PushOptions::default()).await.unwrap();
    assert!(again.up_to_date);
}

#[tokio::test]
async fn test_push_non_fast_forward_and_force() {
    let world = World::new();
    let ws1 = Workspace::init(&world);

    // shared ancestor p
    ws1.write("shared.txt", "base");
    sync::commit(&ws1.ctx(&world, true), &CommitOptions::new("p"))
        .await
        .unwrap();

    // a second client advances the remote to r
    let clone_dir = tempdir().unwrap();
    let clone_ctx = CloneContext {
        ledger: world.ledger.clone(),
        remote: world.remote_store(),
        key_client: world.keys.clone(),
        session: MemoryKeyWrapClient::approved_session(POLICY),
        storage: StorageConfig::default(),
        cancel: CancellationToken::new(),
    };
    let opts = CloneOptions {
        policy_id: Some(POLICY.to_string()),
        ..Default::default()
    };
    sync::clone(&clone_ctx, REPO_ID, clone_dir.path(), &opts)
        .await
        .unwrap();

    let ws2 = Workspace::open(&world, clone_dir.path());
    ws2.write("remote-work.txt", "their work");
    let r = sync::commit(&ws2.ctx(&world, true), &CommitOptions::new("r"))
        .await
        .unwrap()
        .commit;
    assert_eq!(world.ledger.branch_tip(REPO_ID, "main"), Some(r));

    // meanwhile ws1 commits l locally
    ws1.write("local-work.txt", "our work");
    let l = sync::commit(&ws1.ctx(&world, false), &CommitOptions::new("l"))
        .await
        .unwrap()
        .commit;

    // non-fast-forward without force: refused, no ref update
    let ctx = ws1.ctx(&world, true);
    let result = sync::push(&ctx, "main", &PushOptions::default()).await;
    assert!(matches!(
        result,
        Err(Error::Conflict(walgit::ConflictKind::NonFastForward))
    ));
    assert_eq!(world.ledger.branch_tip(REPO_ID, "main"), Some(r));

    // force path goes through the dedicated force update
    let report = sync::push(
        &ctx,
        "main",
        &PushOptions {
            force: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(report.forced);
    assert_eq!(world.ledger.branch_tip(REPO_ID, "main"), Some(l));
}

#[tokio::test]
async fn test_partial_push_reports_completed_batches() {
    let world = World::new();
    let ws = Workspace::init(&world);

    ws.write("seed.txt", "seed");
    sync::commit(&ws.ctx(&world, true), &CommitOptions::new("seed"))
        .await
        .unwrap();

    for i in 0..7 {
        ws.write(&format!("file-{}.txt", i), &format!("content {}", i));
        sync::commit(&ws.ctx(&world, false), &CommitOptions::new(format!("c{}", i)))
            .await
            .unwrap();
    }

    // first batch lands, every retry of the second fails
    world.ledger.fail_submits_after(1, 20);

    let result = sync::push(&ws.ctx(&world, true), "main", &PushOptions::default()).await;
    match result {
        Err(Error::PartialPush {
            completed_batches,
            total_batches,
            last_digest,
            ..
        }) => {
            assert_eq!(completed_batches, 1);
            assert_eq!(total_batches, 2);
            assert!(last_digest.is_some());
        }
        other => panic!("expected partial push, got {:?}", other.map(|r| r.batches.len())),
    }
}

#[tokio::test]
async fn test_clone_materializes_working_tree() {
    let world = World::new();
    let ws1 = Workspace::init(&world);
    ws1.write("README.md", "hello v1\n");
    ws1.write("src/lib.rs", "pub fn answer() -> u32 { 42 }\n");
    let tip = sync::commit(&ws1.ctx(&world, true), &CommitOptions::new("initial"))
        .await
        .unwrap()
        .commit;

    let clone_dir = tempdir().unwrap();
    let clone_ctx = CloneContext {
        ledger: world.ledger.clone(),
        remote: world.remote_store(),
        key_client: world.keys.clone(),
        session: MemoryKeyWrapClient::approved_session(POLICY),
        storage: StorageConfig::default(),
        cancel: CancellationToken::new(),
    };
    let opts = CloneOptions {
        name: Some("cloned".to_string()),
        policy_id: Some(POLICY.to_string()),
        ..Default::default()
    };
    let (repo, report) = sync::clone(&clone_ctx, REPO_ID, clone_dir.path(), &opts)
        .await
        .unwrap();

    assert_eq!(report.tip, tip);
    assert_eq!(report.files_written, 2);
    assert_eq!(
        fs::read_to_string(clone_dir.path().join("README.md")).unwrap(),
        "hello v1\n"
    );
    assert_eq!(
        fs::read_to_string(clone_dir.path().join("src/lib.rs")).unwrap(),
        "pub fn answer() -> u32 { 42 }\n"
    );
    assert_eq!(
        refs::read_ref(&repo, &refs::branch_ref("main")).unwrap(),
        Some(tip)
    );
    assert_eq!(refs::resolve_head(&repo).unwrap(), Some(tip));
}

#[tokio::test]
async fn test_pull_into_dirty_working_tree() {
    let world = World::new();
    let ws1 = Workspace::init(&world);
    ws1.write("README.md", "hello v1\n");
    sync::commit(&ws1.ctx(&world, true), &CommitOptions::new("v1"))
        .await
        .unwrap();

    // second client clones v1
    let clone_dir = tempdir().unwrap();
    let clone_ctx = CloneContext {
        ledger: world.ledger.clone(),
        remote: world.remote_store(),
        key_client: world.keys.clone(),
        session: MemoryKeyWrapClient::approved_session(POLICY),
        storage: StorageConfig::default(),
        cancel: CancellationToken::new(),
    };
    let opts = CloneOptions {
        policy_id: Some(POLICY.to_string()),
        ..Default::default()
    };
    sync::clone(&clone_ctx, REPO_ID, clone_dir.path(), &opts)
        .await
        .unwrap();
    let ws2 = Workspace::open(&world, clone_dir.path());
    ws2.scanner
        .record("README.md", sha256_hex(b"hello v1\n"));

    // upstream publishes v2
    ws1.write("README.md", "hello v2\n");
    sync::commit(&ws1.ctx(&world, true), &CommitOptions::new("v2"))
        .await
        .unwrap();

    // local edit disagrees with the index
    ws2.write("README.md", "my local edit\n");

    let report = sync::pull(&ws2.ctx(&world, true), Some("main"), &PullOptions::default())
        .await
        .unwrap();

    assert!(!report.diverged);
    assert_eq!(report.updated_files, 1);
    assert_eq!(report.conflicts, vec!["README.md".to_string()]);

    // the edit was backed up, the remote content applied
    assert_eq!(ws2.read("README.md"), "hello v2\n");
    assert_eq!(ws2.read("README.md.local"), "my local edit\n");

    // pull safety: working bytes match the manifest's recorded hash
    assert_eq!(
        sha256_hex(ws2.read("README.md").as_bytes()),
        sha256_hex(b"hello v2\n")
    );
    assert_eq!(ws2.branch_tip("main"), report.new_tip);
}

#[tokio::test]
async fn test_pull_diverged_marks_conflicts() {
    let world = World::new();
    let ws1 = Workspace::init(&world);
    ws1.write("shared.txt", "base");
    sync::commit(&ws1.ctx(&world, true), &CommitOptions::new("base"))
        .await
        .unwrap();

    let clone_dir = tempdir().unwrap();
    let clone_ctx = CloneContext {
        ledger: world.ledger.clone(),
        remote: world.remote_store(),
        key_client: world.keys.clone(),
        session: MemoryKeyWrapClient::approved_session(POLICY),
        storage: StorageConfig::default(),
        cancel: CancellationToken::new(),
    };
    let opts = CloneOptions {
        policy_id: Some(POLICY.to_string()),
        ..Default::default()
    };
    sync::clone(&clone_ctx, REPO_ID, clone_dir.path(), &opts)
        .await
        .unwrap();
    let ws2 = Workspace::open(&world, clone_dir.path());

    // both sides move independently
    ws1.write("upstream.txt", "their line");
    sync::commit(&ws1.ctx(&world, true), &CommitOptions::new("upstream"))
        .await
        .unwrap();

    ws2.write("local.txt", "our line");
    let local_tip = sync::commit(&ws2.ctx(&world, false), &CommitOptions::new("local"))
        .await
        .unwrap()
        .commit;

    let report = sync::pull(&ws2.ctx(&world, true), Some("main"), &PullOptions::default())
        .await
        .unwrap();

    assert!(report.diverged);
    assert!(report.conflicts.contains(&"upstream.txt".to_string()));
    assert!(report.conflicts.contains(&"local.txt".to_string()));
    assert_eq!(report.updated_files, 0);
    // nothing moved: the local branch still points at the local commit
    assert_eq!(ws2.branch_tip("main"), Some(local_tip));
    assert!(!clone_dir.path().join("upstream.txt").exists());
}

#[tokio::test]
async fn test_fetch_mirrors_history_without_files() {
    let world = World::new();
    let ws1 = Workspace::init(&world);
    ws1.write("data.txt", "payload");
    let tip = sync::commit(&ws1.ctx(&world, true), &CommitOptions::new("data"))
        .await
        .unwrap()
        .commit;

    // a bare second workspace fetches the history
    let ws2 = Workspace::init(&world);
    let report = sync::fetch(&ws2.ctx(&world, true), Some("main"), &FetchOptions::default())
        .await
        .unwrap();

    assert_eq!(report.remote_tip, Some(tip));
    assert_eq!(report.commits_fetched, 1);
    assert!(report.trees_fetched >= 1);

    // commit objects are local now, working files are not
    assert!(walgit::object::exists(&ws2.repo, &tip));
    assert!(!ws2.repo.work_dir().join("data.txt").exists());
    assert_eq!(
        refs::read_ref(&ws2.repo, &refs::remote_ref("origin", "main")).unwrap(),
        Some(tip)
    );
}
