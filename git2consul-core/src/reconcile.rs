//! KV Reconciler: applies one [`ChangeSet`] to the key-value store.
//!
//! Deltas are applied sequentially in change-set order. A failed key is counted and
//! skipped; only an unreachable store (connector failure) skips the whole change set.

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::changeset::{ChangeSet, DeltaStatus, DiffDelta};
use crate::contract::{ContentResolver, KvClient, KvConnector, MetricsSink};
use crate::error::KvError;
use crate::lock::LockHandle;

/// Outcome of reconciling one change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub synced: usize,
    pub failed: usize,
    /// Deltas not attempted because the lock was lost mid-run.
    pub skipped: usize,
    /// The store could not be reached; nothing was applied.
    pub connection_failed: bool,
}

impl ReconcileReport {
    /// True when every delta was attempted against a reachable store.
    pub fn completed(&self) -> bool {
        !self.connection_failed && self.skipped == 0
    }
}

/// Joins `prefix` and `path` into a KV key without leading or doubled separators.
///
/// ```
/// use git2consul_core::reconcile::destination_key;
/// assert_eq!(destination_key("/app/", "/config.yml"), "app/config.yml");
/// assert_eq!(destination_key("", "nested/a.json"), "nested/a.json");
/// ```
pub fn destination_key(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let path = path.trim_start_matches('/');
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{prefix}/{path}")
    }
}

#[derive(Debug, Error)]
enum KeyFailure {
    #[error("could not read {path}: {source}")]
    Content {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Kv(#[from] KvError),
}

pub struct Reconciler<'a> {
    prefix: String,
    resolver: &'a dyn ContentResolver,
    metrics: &'a dyn MetricsSink,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        prefix: impl Into<String>,
        resolver: &'a dyn ContentResolver,
        metrics: &'a dyn MetricsSink,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            resolver,
            metrics,
        }
    }

    pub fn key_for(&self, path: &str) -> String {
        destination_key(&self.prefix, path)
    }

    /// Connects to the store and applies `changes`. A connection failure is counted once
    /// and the change set is skipped.
    pub async fn reconcile(
        &self,
        connector: &dyn KvConnector,
        changes: &ChangeSet,
        stop: Option<&LockHandle>,
    ) -> ReconcileReport {
        let client = match connector.connect().await {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, deltas = changes.len(), "[RECONCILE] KV store unreachable, skipping change set");
                self.metrics.kv_connection_failed();
                return ReconcileReport {
                    connection_failed: true,
                    ..ReconcileReport::default()
                };
            }
        };
        self.apply(client.as_ref(), changes, stop).await
    }

    /// Applies `changes` with an already connected client. When `stop` is given, the
    /// remaining deltas are abandoned as soon as that lock is reported lost.
    pub async fn apply(
        &self,
        client: &dyn KvClient,
        changes: &ChangeSet,
        stop: Option<&LockHandle>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        info!(prefix = %self.prefix, deltas = changes.len(), "[RECONCILE] Applying change set");

        for (index, delta) in changes.iter().enumerate() {
            if let Some(handle) = stop {
                if handle.is_lost() {
                    report.skipped = changes.len() - index;
                    error!(
                        key = handle.key(),
                        skipped = report.skipped,
                        "[RECONCILE][ERROR] Lock lost, abandoning remaining deltas"
                    );
                    break;
                }
            }
            match delta.status {
                DeltaStatus::Deleted => {
                    let key = self.key_for(&delta.old_path);
                    self.record(&mut report, &key, self.delete(client, &key).await);
                }
                DeltaStatus::Renamed => {
                    let key = self.key_for(&delta.new_path);
                    self.record(&mut report, &key, self.put(client, delta, &key).await);
                    if !delta.old_path.is_empty() && delta.old_path != delta.new_path {
                        let old_key = self.key_for(&delta.old_path);
                        self.record(&mut report, &old_key, self.delete(client, &old_key).await);
                    }
                }
                DeltaStatus::Added | DeltaStatus::Modified | DeltaStatus::Unmodified => {
                    let key = self.key_for(&delta.new_path);
                    self.record(&mut report, &key, self.put(client, delta, &key).await);
                }
            }
        }

        info!(
            synced = report.synced,
            failed = report.failed,
            skipped = report.skipped,
            "[RECONCILE] Change set applied"
        );
        report
    }

    async fn put(&self, client: &dyn KvClient, delta: &DiffDelta, key: &str) -> Result<(), KeyFailure> {
        let bytes = self
            .resolver
            .read(&delta.new_path)
            .map_err(|source| KeyFailure::Content {
                path: delta.new_path.clone(),
                source,
            })?;
        let value = bytes.trim_ascii();
        debug!(key, path = %delta.new_path, bytes = value.len(), "[RECONCILE] Put");
        match client.put(key, value).await? {
            true => Ok(()),
            false => Err(KvError::Rejected(key.to_string()).into()),
        }
    }

    async fn delete(&self, client: &dyn KvClient, key: &str) -> Result<(), KeyFailure> {
        debug!(key, "[RECONCILE] Delete");
        match client.delete(key).await? {
            true => Ok(()),
            false => Err(KvError::Rejected(key.to_string()).into()),
        }
    }

    fn record(&self, report: &mut ReconcileReport, key: &str, outcome: Result<(), KeyFailure>) {
        match outcome {
            Ok(()) => {
                report.synced += 1;
                self.metrics.file_synced();
            }
            Err(e) => {
                warn!(key, error = %e, "[RECONCILE] Failed to sync key");
                report.failed += 1;
                self.metrics.file_sync_failed();
            }
        }
    }
}
