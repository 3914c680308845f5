//! # contract: seams between the sync core and its collaborators
//!
//! The core never talks to a KV store, a coordination service or a metrics backend
//! directly. It goes through the traits below, which are implemented by the Consul
//! adapter in the CLI crate, by the in-memory implementations in [`crate::memory`] and
//! [`crate::lock`], and by `mockall` mocks in tests.
//!
//! ## Mocking
//! - Every trait is annotated for `mockall` so tests can script per-call outcomes
//!   (`MockKvClient`, `MockKvConnector`, `MockLockService`, `MockMetricsSink`,
//!   `MockContentResolver`).
//!
//! ## Error handling
//! - KV calls return [`KvError`]; a `put`/`delete` returning `Ok(false)` is an explicit
//!   refusal from the store and is counted the same way as an error.
//! - Lock calls return [`LockError`]; unreachability at acquire time is surfaced.

use async_trait::async_trait;

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::error::{KvError, LockError};
use crate::lock::LockHandle;

/// Operations the reconciler and operator commands need from the KV store.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Store `value` under `key`. `Ok(false)` means the store refused the write.
    async fn put(&self, key: &str, value: &[u8]) -> Result<bool, KvError>;

    /// Remove `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Read `key`, `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Register this process as a named service with the store's agent.
    async fn register_service(&self, name: &str, tags: &[String]) -> Result<(), KvError>;

    async fn deregister_service(&self, name: &str) -> Result<(), KvError>;
}

/// Builds a [`KvClient`] for one sync cycle.
///
/// A failure here is the cycle-level "store unreachable" condition: the whole change set
/// for that cycle is skipped.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait KvConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn KvClient>, KvError>;
}

/// Session-backed mutual exclusion provided by an external coordination service.
///
/// At most one live [`LockHandle`] exists per key across the fleet; that guarantee comes
/// from the service, not from this process.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait LockService: Send + Sync {
    /// Blocks until the lock on `key` is granted.
    async fn acquire_lock(&self, key: &str) -> Result<LockHandle, LockError>;

    /// Releases a lock previously granted to this process.
    async fn release_lock(&self, key: &str) -> Result<(), LockError>;

    /// Takes the lock regardless of the current holder. Operator use only.
    async fn force_acquire(&self, key: &str) -> Result<LockHandle, LockError>;

    /// Clears the lock regardless of who holds it. Operator use only.
    async fn force_release(&self, key: &str) -> Result<(), LockError>;
}

/// Monotonic counters incremented by the sync loop and reconciler.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait MetricsSink: Send + Sync {
    fn file_synced(&self);
    fn file_sync_failed(&self);
    fn kv_connection_failed(&self);
    fn git_read(&self);
}

/// Reads the bytes behind an `Added`/`Modified` delta path.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait ContentResolver: Send + Sync {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>>;
}
