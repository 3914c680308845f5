mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{commit, init_repo, url_of, T};
use git2::Repository;
use git2consul_core::config::GitConfig;
use git2consul_core::lock::{DistributedLock, MemoryLockService};
use git2consul_core::memory::{MemoryConnector, MemoryKv};
use git2consul_core::metrics::SyncCounters;
use git2consul_core::repository::GitRepository;
use git2consul_core::synchronise::{CycleOutcome, SyncLoop, SyncOptions, SyncState};
use tempfile::{tempdir, TempDir};

struct Fleet {
    upstream_dir: TempDir,
    upstream: Repository,
    _clone_dir: TempDir,
    connector: MemoryConnector,
    counters: Arc<SyncCounters>,
    sync: SyncLoop,
}

/// Upstream with `a.txt` committed before T, cloned and wired to an in-memory store.
fn fleet(options: SyncOptions) -> Fleet {
    let upstream_dir = tempdir().unwrap();
    let upstream = init_repo(upstream_dir.path());
    commit(&upstream, &[("a.txt", Some("hello"))], "initial", T - 10);

    let clone_dir = tempdir().unwrap();
    let config = GitConfig {
        url: url_of(upstream_dir.path()),
        pull_dir: clone_dir.path().join("data"),
        ..GitConfig::default()
    };
    config.validate().unwrap();
    let repo = GitRepository::clone_or_open(&config).unwrap();

    let connector = MemoryConnector::new(MemoryKv::new());
    let counters = Arc::new(SyncCounters::new());
    let sync = SyncLoop::new(repo, options, Arc::new(connector.clone()), counters.clone());
    Fleet {
        upstream_dir,
        upstream,
        _clone_dir: clone_dir,
        connector,
        counters,
        sync,
    }
}

fn app_options() -> SyncOptions {
    SyncOptions {
        prefix: "app".into(),
        ..SyncOptions::default()
    }
}

#[tokio::test]
async fn cursor_starts_at_checked_out_commit() {
    let f = fleet(app_options());
    let head = f.upstream.head().unwrap().target().unwrap();
    assert_eq!(f.sync.cursor().map(|c| c.commit), Some(head));
}

#[tokio::test]
async fn first_cycle_syncs_commits_pushed_after_clone() {
    let mut f = fleet(app_options());
    let tip = commit(&f.upstream, &[("b.txt", Some("world\n"))], "add b", T + 5);

    let report = f.sync.run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::Reconciled);
    assert_eq!(report.window_len, 2);
    assert_eq!((report.deltas, report.synced, report.failed), (1, 1, 0));
    assert_eq!(report.cursor, Some(tip));
    assert_eq!(f.connector.kv().value("app/b.txt").as_deref(), Some("world"));
    // a.txt was already checked out when the loop was built.
    assert_eq!(f.connector.kv().value("app/a.txt"), None);
    assert_eq!(f.sync.state(), SyncState::Idle);
    assert_eq!(f.counters.snapshot().git_reads, 1);
}

#[tokio::test]
async fn backdated_commit_pushed_after_clone_is_synced() {
    let mut f = fleet(app_options());
    let tip = commit(&f.upstream, &[("b.txt", Some("world"))], "authored earlier", T - 5);

    let report = f.sync.run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::Reconciled);
    assert_eq!((report.window_len, report.deltas, report.synced), (2, 1, 1));
    assert_eq!(report.cursor, Some(tip));
    assert_eq!(f.connector.kv().value("app/b.txt").as_deref(), Some("world"));
}

#[tokio::test]
async fn later_cycles_start_from_the_cursor() {
    let mut f = fleet(app_options());
    commit(&f.upstream, &[("b.txt", Some("world"))], "add b", T + 5);
    f.sync.run_cycle().await;

    let idle = f.sync.run_cycle().await;
    assert_eq!(idle.outcome, CycleOutcome::NoChanges);
    assert_eq!(idle.window_len, 1);

    f.connector.kv().seed("app/a.txt", "hello");
    let tip = commit(
        &f.upstream,
        &[("a.txt", None), ("b.txt", Some("  world 2 \n"))],
        "rework",
        T + 20,
    );
    let report = f.sync.run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::Reconciled);
    assert_eq!(report.deltas, 2);
    assert_eq!(report.cursor, Some(tip));
    let snapshot = f.connector.kv().snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(f.connector.kv().value("app/b.txt").as_deref(), Some("world 2"));
}

#[tokio::test]
async fn unreachable_store_keeps_cursor_for_retry() {
    let mut f = fleet(app_options());
    commit(&f.upstream, &[("b.txt", Some("world"))], "add b", T + 5);
    let synced = f.sync.run_cycle().await;

    commit(&f.upstream, &[("c.txt", Some("later"))], "add c", T + 30);
    f.connector.set_offline(true);
    let offline = f.sync.run_cycle().await;
    assert!(offline.connection_failed);
    assert_eq!(offline.cursor, synced.cursor);
    assert_eq!(f.counters.snapshot().kv_connection_failed, 1);

    f.connector.set_offline(false);
    let retried = f.sync.run_cycle().await;
    assert_eq!(retried.synced, 1);
    assert_eq!(f.connector.kv().value("app/c.txt").as_deref(), Some("later"));
}

#[tokio::test]
async fn fetch_failure_is_recoverable() {
    let mut f = fleet(app_options());
    let moved = f.upstream_dir.path().with_extension("moved");
    std::fs::rename(f.upstream_dir.path(), &moved).unwrap();

    let failed = f.sync.run_cycle().await;
    assert_eq!(failed.outcome, CycleOutcome::FetchFailed);
    assert_eq!(f.sync.state(), SyncState::Idle);
    assert_eq!(f.counters.snapshot().git_reads, 0);

    std::fs::rename(&moved, f.upstream_dir.path()).unwrap();
    commit(&f.upstream, &[("b.txt", Some("world"))], "add b", T + 5);
    let recovered = f.sync.run_cycle().await;
    assert_eq!(recovered.outcome, CycleOutcome::Reconciled);
    assert_eq!(f.connector.kv().value("app/b.txt").as_deref(), Some("world"));
}

#[tokio::test]
async fn rewritten_history_diffs_cursor_against_new_tip() {
    let mut f = fleet(app_options());
    commit(&f.upstream, &[("b.txt", Some("world"))], "add b", T + 5);
    f.sync.run_cycle().await;

    // Force-push: reset upstream to its first commit and grow a different branch.
    let first = f.upstream.revparse_single("HEAD~1").unwrap();
    f.upstream
        .reset(&first, git2::ResetType::Hard, None)
        .unwrap();
    commit(&f.upstream, &[("c.txt", Some("rewritten"))], "replace b", T + 40);

    let report = f.sync.run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::Reconciled);
    assert_eq!(f.connector.kv().value("app/c.txt").as_deref(), Some("rewritten"));
    assert_eq!(f.connector.kv().value("app/b.txt"), None);
}

#[tokio::test]
async fn resync_reconciles_the_whole_tree() {
    let mut f = fleet(SyncOptions {
        prefix: "/full/".into(),
        ..SyncOptions::default()
    });
    commit(&f.upstream, &[("nested/b.yml", Some("x: 1"))], "add b", T + 5);

    let report = f.sync.resync().await.unwrap();

    assert_eq!(report.synced, 2);
    let keys: Vec<_> = f.connector.kv().snapshot().into_keys().collect();
    assert_eq!(keys, vec!["full/a.txt", "full/nested/b.yml"]);
    assert!(f.sync.cursor().is_some());
}

#[tokio::test]
async fn cycle_lock_is_taken_and_released() {
    let service = Arc::new(MemoryLockService::new());
    let options = SyncOptions {
        lock_key: Some("git2consul/sync".into()),
        ..app_options()
    };
    let f = fleet(options);
    let mut sync = f.sync.with_lock(DistributedLock::new(service.clone()));
    commit(&f.upstream, &[("b.txt", Some("world"))], "add b", T + 5);

    let report = sync.run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::Reconciled);
    assert!(!service.is_held("git2consul/sync"));

    service.set_unreachable(true);
    let skipped = sync.run_cycle().await;
    assert_eq!(skipped.outcome, CycleOutcome::LockUnavailable);
}

#[tokio::test]
async fn held_service_lock_pauses_cycles_until_released() {
    const KEY: &str = "git2consul";
    let lock = DistributedLock::new(Arc::new(MemoryLockService::new()));
    let f = fleet(SyncOptions {
        lock_key: Some(KEY.into()),
        ..app_options()
    });
    let mut sync = f.sync.with_lock(lock.clone());
    commit(&f.upstream, &[("b.txt", Some("world"))], "add b", T + 5);
    let _operator = lock.force_acquire(KEY).await.unwrap();

    let kv = f.connector.kv();
    let cycle = sync.run_cycle();
    let unlock = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(kv.value("app/b.txt"), None, "cycle ran while the lock was held");
        lock.force_release(KEY).await.unwrap();
    };
    let (report, ()) = tokio::join!(cycle, unlock);

    assert_eq!(report.outcome, CycleOutcome::Reconciled);
    assert_eq!(f.connector.kv().value("app/b.txt").as_deref(), Some("world"));
}

#[tokio::test(start_paused = true)]
async fn run_ticks_until_shutdown() {
    let mut f = fleet(SyncOptions {
        interval: Duration::from_secs(60),
        ..app_options()
    });
    commit(&f.upstream, &[("b.txt", Some("world"))], "add b", T + 5);

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let shutdown = async move {
        let _ = stopped.await;
    };
    let driver = async move {
        tokio::time::sleep(Duration::from_secs(90)).await;
        let _ = stop.send(());
    };
    tokio::join!(f.sync.run(shutdown), driver);

    assert_eq!(f.connector.kv().value("app/b.txt").as_deref(), Some("world"));
    assert_eq!(f.counters.snapshot().git_reads, 1);
}
