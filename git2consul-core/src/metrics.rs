//! Process counters shared between the sync loop and the metrics publisher.
//!
//! The loop increments, the publisher only reads snapshots, so plain relaxed atomics
//! are enough.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::contract::MetricsSink;

#[derive(Debug, Default)]
pub struct SyncCounters {
    files_synced: AtomicU64,
    files_sync_failed: AtomicU64,
    kv_connection_failed: AtomicU64,
    git_reads: AtomicU64,
}

/// Point-in-time copy of [`SyncCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub files_synced: u64,
    pub files_sync_failed: u64,
    pub kv_connection_failed: u64,
    pub git_reads: u64,
}

impl SyncCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            files_synced: self.files_synced.load(Ordering::Relaxed),
            files_sync_failed: self.files_sync_failed.load(Ordering::Relaxed),
            kv_connection_failed: self.kv_connection_failed.load(Ordering::Relaxed),
            git_reads: self.git_reads.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for SyncCounters {
    fn file_synced(&self) {
        self.files_synced.fetch_add(1, Ordering::Relaxed);
    }

    fn file_sync_failed(&self) {
        self.files_sync_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn kv_connection_failed(&self) {
        self.kv_connection_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn git_read(&self) {
        self.git_reads.fetch_add(1, Ordering::Relaxed);
    }
}
