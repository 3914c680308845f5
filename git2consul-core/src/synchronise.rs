//! Sync Loop: the timer-driven control loop behind `git2consul sync`.
//!
//! Each tick runs one cycle to completion:
//!   - **Fetching**: pull the tracked branch. Failure is logged and the loop waits for the
//!     next tick.
//!   - **Filtering**: build the commit window from the [`SyncCursor`] to the branch tip.
//!     The cursor starts at the commit checked out when the loop was built; a working
//!     copy with no commit yet gets every file of the tip on its first cycle.
//!   - **Diffing**: turn the window into a [`ChangeSet`].
//!   - **Reconciling**: apply the change set to the KV store.
//!
//! The cursor lives in memory only. It advances to the newest observed commit after
//! every cycle that reached the store (or had nothing to apply), and stays put when the
//! store was unreachable or the cycle lock was lost, so those changes are retried.
//!
//! A started cycle is never cancelled; shutdown is only observed between ticks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use git2::Oid;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::changeset::{ChangeSet, WorkdirResolver};
use crate::contract::{KvConnector, MetricsSink};
use crate::error::{GitError, LockError};
use crate::filter::{Collection, Filter};
use crate::lock::{DistributedLock, LockHandle};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::repository::GitRepository;

const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Fetching,
    Filtering,
    Diffing,
    Reconciling,
}

/// The last commit whose changes reached the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCursor {
    pub commit: Oid,
    pub advanced_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub remote: String,
    pub branch: String,
    /// KV key prefix every file path is placed under.
    pub prefix: String,
    pub interval: Duration,
    /// Lock key taken around every cycle, when fleet-wide exclusion is wanted.
    pub lock_key: Option<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            remote: "origin".into(),
            branch: "master".into(),
            prefix: String::new(),
            interval: Duration::from_secs(5 * 60),
            lock_key: None,
        }
    }
}

/// How far a cycle got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    FetchFailed,
    LockUnavailable,
    DiffFailed,
    NoChanges,
    Reconciled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub window_len: usize,
    pub deltas: usize,
    pub synced: usize,
    pub failed: usize,
    pub skipped: usize,
    pub connection_failed: bool,
    /// Cursor after the cycle.
    pub cursor: Option<Oid>,
}

impl CycleReport {
    fn new(outcome: CycleOutcome, cursor: Option<Oid>) -> Self {
        Self {
            outcome,
            window_len: 0,
            deltas: 0,
            synced: 0,
            failed: 0,
            skipped: 0,
            connection_failed: false,
            cursor,
        }
    }

    fn with_reconcile(mut self, report: ReconcileReport) -> Self {
        self.synced = report.synced;
        self.failed = report.failed;
        self.skipped = report.skipped;
        self.connection_failed = report.connection_failed;
        self
    }
}

pub struct SyncLoop {
    repo: GitRepository,
    options: SyncOptions,
    connector: Arc<dyn KvConnector>,
    metrics: Arc<dyn MetricsSink>,
    lock: Option<DistributedLock>,
    cursor: Option<SyncCursor>,
    state: SyncState,
}

impl SyncLoop {
    pub fn new(
        repo: GitRepository,
        options: SyncOptions,
        connector: Arc<dyn KvConnector>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let cursor = match repo.head_commit() {
            Ok(commit) => {
                info!(commit = %commit, "[SYNC] Starting from checked out commit");
                Some(SyncCursor {
                    commit,
                    advanced_at: Utc::now(),
                })
            }
            Err(e) => {
                info!(error = %e, "[SYNC] No commit checked out yet, first cycle syncs the whole tree");
                None
            }
        };
        Self {
            repo,
            options,
            connector,
            metrics,
            lock: None,
            cursor,
            state: SyncState::Idle,
        }
    }

    /// Takes `options.lock_key` through `lock` around every cycle. Without a lock key
    /// this has no effect.
    pub fn with_lock(mut self, lock: DistributedLock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn cursor(&self) -> Option<SyncCursor> {
        self.cursor
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn repository(&self) -> &GitRepository {
        &self.repo
    }

    /// Filters for the next cycle's window.
    pub fn pipeline(&self) -> Vec<Filter> {
        let branch = Filter::ByBranch(self.options.branch.clone());
        match self.cursor {
            None => vec![branch],
            Some(cursor) => vec![
                branch,
                Filter::ByCommitId(cursor.commit.to_string()),
                Filter::ByTopo,
            ],
        }
    }

    /// Ticks every `options.interval` until `shutdown` resolves. The first cycle runs
    /// one interval after start.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let period = self.options.interval.max(MIN_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        info!(interval_secs = period.as_secs(), branch = %self.options.branch, "[SYNC] Sync loop started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("[SYNC] Shutdown requested, stopping sync loop");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    info!(
                        outcome = ?report.outcome,
                        window = report.window_len,
                        deltas = report.deltas,
                        synced = report.synced,
                        failed = report.failed,
                        cursor = ?report.cursor.map(|c| c.to_string()),
                        "[SYNC] Cycle finished"
                    );
                }
            }
        }
    }

    /// Runs one full fetch, filter, diff, reconcile cycle and returns to `Idle`.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let guard = match self.acquire_cycle_lock().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(error = %e, "[SYNC] Could not take cycle lock, skipping cycle");
                return CycleReport::new(CycleOutcome::LockUnavailable, self.cursor_id());
            }
        };
        let report = self.cycle(guard.as_ref()).await;
        self.release_cycle_lock(guard).await;
        self.transition(SyncState::Idle);
        report
    }

    /// Reconciles every file in the checked out HEAD, regardless of the cursor.
    pub async fn resync(&mut self) -> Result<CycleReport, GitError> {
        self.transition(SyncState::Fetching);
        let pulled = self.repo.pull(&self.options.remote, &self.options.branch);
        if let Err(e) = pulled {
            self.transition(SyncState::Idle);
            return Err(e);
        }
        self.metrics.git_read();

        self.transition(SyncState::Diffing);
        let (head, changes) = match self.head_tree() {
            Ok(found) => found,
            Err(e) => {
                self.transition(SyncState::Idle);
                return Err(e);
            }
        };
        info!(head = %head, files = changes.len(), "[SYNC] Full resync");

        let guard = match self.acquire_cycle_lock().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(error = %e, "[SYNC] Could not take cycle lock, skipping resync");
                self.transition(SyncState::Idle);
                return Ok(CycleReport::new(CycleOutcome::LockUnavailable, self.cursor_id()));
            }
        };
        self.transition(SyncState::Reconciling);
        let reconciled = self.reconcile(&changes, guard.as_ref()).await;
        self.release_cycle_lock(guard).await;
        if reconciled.completed() {
            self.advance(head);
        }
        self.transition(SyncState::Idle);

        let mut report = CycleReport::new(CycleOutcome::Reconciled, self.cursor_id())
            .with_reconcile(reconciled);
        report.window_len = 1;
        report.deltas = changes.len();
        Ok(report)
    }

    async fn cycle(&mut self, guard: Option<&LockHandle>) -> CycleReport {
        self.transition(SyncState::Fetching);
        match self.repo.pull(&self.options.remote, &self.options.branch) {
            Ok(outcome) => {
                self.metrics.git_read();
                debug!(?outcome, "[SYNC] Pulled tracked branch");
            }
            Err(e) => {
                warn!(error = %e, branch = %self.options.branch, "[SYNC] Fetch failed, retrying next tick");
                return CycleReport::new(CycleOutcome::FetchFailed, self.cursor_id());
            }
        }

        self.transition(SyncState::Filtering);
        let window = self.window();
        let observed = window
            .reference
            .as_ref()
            .map(|r| r.target)
            .or_else(|| window.newest());

        self.transition(SyncState::Diffing);
        let computed = match (self.cursor, observed) {
            (None, Some(tip)) => ChangeSet::full_tree(&self.repo, tip),
            (None, None) => Ok(ChangeSet::new()),
            (Some(_), _) => ChangeSet::compute(&self.repo, &window),
        };
        let changes = match computed {
            Ok(changes) => changes,
            Err(e) => {
                error!(error = %e, "[SYNC][ERROR] Failed to compute change set");
                let mut report = CycleReport::new(CycleOutcome::DiffFailed, self.cursor_id());
                report.window_len = window.commits.len();
                return report;
            }
        };

        if changes.is_empty() {
            debug!(window = window.commits.len(), "[SYNC] No changes in window");
            if let Some(observed) = observed {
                self.advance(observed);
            }
            let mut report = CycleReport::new(CycleOutcome::NoChanges, self.cursor_id());
            report.window_len = window.commits.len();
            return report;
        }

        self.transition(SyncState::Reconciling);
        info!(summary = ?changes.summary(), "[SYNC] Reconciling change set");
        let reconciled = self.reconcile(&changes, guard).await;
        if reconciled.completed() {
            if let Some(observed) = observed {
                self.advance(observed);
            }
        } else {
            warn!(
                connection_failed = reconciled.connection_failed,
                skipped = reconciled.skipped,
                "[SYNC] Change set not fully applied, cursor kept"
            );
        }

        let mut report =
            CycleReport::new(CycleOutcome::Reconciled, self.cursor_id()).with_reconcile(reconciled);
        report.window_len = window.commits.len();
        report.deltas = changes.len();
        report
    }

    fn window(&self) -> Collection {
        let filters = self.pipeline();
        let mut window = Collection::default().filter_all(&self.repo, &filters);

        // A rewritten branch leaves the cursor unreachable from the tip; diff straight
        // from the cursor to the tip instead.
        if let (Some(newest), Some(reference)) = (window.newest(), window.reference.as_ref()) {
            if newest != reference.target {
                warn!(
                    newest = %newest,
                    tip = %reference.target,
                    "[SYNC] Window does not end at the branch tip, history was rewritten"
                );
                window.commits.push(reference.target);
            }
        }
        if window.commits.is_empty() && self.cursor.is_some() {
            warn!("[SYNC] Cursor commit no longer resolvable, window is empty");
        }
        debug!(window = window.commits.len(), "[SYNC] Selected commit window");
        window
    }

    async fn reconcile(&self, changes: &ChangeSet, guard: Option<&LockHandle>) -> ReconcileReport {
        let resolver = WorkdirResolver::new(self.repo.workdir());
        let reconciler = Reconciler::new(self.options.prefix.clone(), &resolver, self.metrics.as_ref());
        reconciler
            .reconcile(self.connector.as_ref(), changes, guard)
            .await
    }

    fn head_tree(&self) -> Result<(Oid, ChangeSet), GitError> {
        let head = self.repo.head_commit()?;
        Ok((head, ChangeSet::full_tree(&self.repo, head)?))
    }

    async fn acquire_cycle_lock(&self) -> Result<Option<LockHandle>, LockError> {
        let (Some(lock), Some(key)) = (&self.lock, &self.options.lock_key) else {
            return Ok(None);
        };
        lock.acquire(key).await.map(Some)
    }

    async fn release_cycle_lock(&self, guard: Option<LockHandle>) {
        let (Some(lock), Some(handle)) = (&self.lock, guard) else {
            return;
        };
        if handle.is_lost() {
            debug!(key = handle.key(), "[SYNC] Cycle lock already lost, nothing to release");
            return;
        }
        if let Err(e) = lock.release(handle.key()).await {
            error!(key = handle.key(), error = %e, "[SYNC][ERROR] Failed to release cycle lock");
        }
    }

    fn advance(&mut self, commit: Oid) {
        if self.cursor.map(|c| c.commit) != Some(commit) {
            info!(commit = %commit, "[SYNC] Cursor advanced");
        }
        self.cursor = Some(SyncCursor {
            commit,
            advanced_at: Utc::now(),
        });
    }

    fn cursor_id(&self) -> Option<Oid> {
        self.cursor.map(|c| c.commit)
    }

    fn transition(&mut self, next: SyncState) {
        debug!(from = ?self.state, to = ?next, "[SYNC] State transition");
        self.state = next;
    }
}
