//! Distributed lock used by administrative commands and, when enabled, by the sync cycle.
//!
//! [`DistributedLock`] wraps a [`LockService`] with the policies the rest of the program
//! relies on: acquiring surfaces coordination failures instead of retrying forever,
//! releasing retries because a stuck lock blocks the whole fleet, and the force
//! operations are logged loudly since they bypass cooperative checks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::contract::LockService;
use crate::error::LockError;

/// A held lock session.
///
/// The watch channel flips to `true` (or closes) when the lock is lost, either by
/// session expiry or explicit release. Dropping the handle stops any renewal task, which
/// lets a TTL-backed session expire on its own.
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    lost: watch::Receiver<bool>,
    renewal: Option<JoinHandle<()>>,
}

impl LockHandle {
    pub fn new(key: impl Into<String>, lost: watch::Receiver<bool>) -> Self {
        Self {
            key: key.into(),
            lost,
            renewal: None,
        }
    }

    /// Attaches the task keeping the session alive; it is aborted on drop.
    pub fn with_renewal(mut self, task: JoinHandle<()>) -> Self {
        self.renewal = Some(task);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow() || self.lost.has_changed().is_err()
    }

    /// Resolves once the lock is lost.
    pub async fn lost(&mut self) {
        loop {
            if *self.lost.borrow_and_update() {
                return;
            }
            if self.lost.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(task) = self.renewal.take() {
            task.abort();
        }
    }
}

/// How hard [`DistributedLock::release`] tries before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasePolicy {
    /// `None` retries until the release succeeds.
    pub max_attempts: Option<u32>,
    pub backoff: Duration,
}

impl Default for ReleasePolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    service: Arc<dyn LockService>,
    policy: ReleasePolicy,
}

impl DistributedLock {
    pub fn new(service: Arc<dyn LockService>) -> Self {
        Self {
            service,
            policy: ReleasePolicy::default(),
        }
    }

    pub fn with_release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Blocks until `key` is granted. Coordination failures are returned to the caller.
    pub async fn acquire(&self, key: &str) -> Result<LockHandle, LockError> {
        info!(key, "[LOCK] Acquiring lock");
        match self.service.acquire_lock(key).await {
            Ok(handle) => {
                info!(key, "[LOCK] Lock acquired");
                Ok(handle)
            }
            Err(e) => {
                error!(key, error = %e, "[LOCK][ERROR] Failed to acquire lock");
                Err(e)
            }
        }
    }

    /// Releases `key`, retrying per the configured policy.
    pub async fn release(&self, key: &str) -> Result<(), LockError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.service.release_lock(key).await {
                Ok(()) => {
                    info!(key, attempts, "[LOCK] Lock released");
                    return Ok(());
                }
                Err(e @ LockError::NotHeld(_)) => {
                    warn!(key, "[LOCK] Release requested for a lock this process does not hold");
                    return Err(e);
                }
                Err(e) => {
                    if self.policy.max_attempts.is_some_and(|max| attempts >= max) {
                        error!(key, attempts, error = %e, "[LOCK][ERROR] Giving up releasing lock");
                        return Err(LockError::ReleaseExhausted {
                            key: key.to_string(),
                            attempts,
                            last: e.to_string(),
                        });
                    }
                    warn!(key, attempts, error = %e, "[LOCK] Release failed, retrying");
                    tokio::time::sleep(self.policy.backoff).await;
                }
            }
        }
    }

    /// Takes `key` regardless of the current holder.
    pub async fn force_acquire(&self, key: &str) -> Result<LockHandle, LockError> {
        warn!(key, "[LOCK] Forcing lock acquisition, cooperative checks bypassed");
        self.service.force_acquire(key).await
    }

    /// Clears `key` regardless of the current holder.
    pub async fn force_release(&self, key: &str) -> Result<(), LockError> {
        warn!(key, "[LOCK] Forcing lock release, cooperative checks bypassed");
        self.service.force_release(key).await
    }
}

#[cfg(any(test, feature = "test-export-mocks"))]
pub use memory::MemoryLockService;

#[cfg(any(test, feature = "test-export-mocks"))]
mod memory {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::{watch, Notify};

    use super::LockHandle;
    use crate::contract::LockService;
    use crate::error::LockError;

    /// In-process lock service with the same blocking semantics as the real one.
    #[derive(Default)]
    pub struct MemoryLockService {
        held: Mutex<HashMap<String, watch::Sender<bool>>>,
        released: Notify,
        unreachable: AtomicBool,
        failing_releases: AtomicU32,
    }

    impl MemoryLockService {
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes every call fail as if the coordination service were down.
        pub fn set_unreachable(&self, unreachable: bool) {
            self.unreachable.store(unreachable, Ordering::SeqCst);
        }

        /// The next `n` releases fail with a transient error.
        pub fn fail_next_releases(&self, n: u32) {
            self.failing_releases.store(n, Ordering::SeqCst);
        }

        pub fn is_held(&self, key: &str) -> bool {
            self.held
                .lock()
                .map(|held| held.contains_key(key))
                .unwrap_or(false)
        }

        fn check_reachable(&self) -> Result<(), LockError> {
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(LockError::Unreachable("memory lock service offline".into()));
            }
            Ok(())
        }

        fn grant(&self, key: &str) -> Result<Option<LockHandle>, LockError> {
            let mut held = self
                .held
                .lock()
                .map_err(|_| LockError::Service("lock table poisoned".into()))?;
            if held.contains_key(key) {
                return Ok(None);
            }
            let (tx, rx) = watch::channel(false);
            held.insert(key.to_string(), tx);
            Ok(Some(LockHandle::new(key, rx)))
        }

        fn revoke(&self, key: &str) -> Result<bool, LockError> {
            let removed = self
                .held
                .lock()
                .map_err(|_| LockError::Service("lock table poisoned".into()))?
                .remove(key);
            let was_held = match removed {
                Some(tx) => {
                    let _ = tx.send(true);
                    true
                }
                None => false,
            };
            self.released.notify_waiters();
            Ok(was_held)
        }
    }

    #[async_trait]
    impl LockService for MemoryLockService {
        async fn acquire_lock(&self, key: &str) -> Result<LockHandle, LockError> {
            loop {
                self.check_reachable()?;
                // Registered before the check so a release in between is not missed.
                let notified = self.released.notified();
                if let Some(handle) = self.grant(key)? {
                    return Ok(handle);
                }
                notified.await;
            }
        }

        async fn release_lock(&self, key: &str) -> Result<(), LockError> {
            self.check_reachable()?;
            let pending = self.failing_releases.load(Ordering::SeqCst);
            if pending > 0 {
                self.failing_releases.store(pending - 1, Ordering::SeqCst);
                return Err(LockError::Service("transient release failure".into()));
            }
            if self.revoke(key)? {
                Ok(())
            } else {
                Err(LockError::NotHeld(key.to_string()))
            }
        }

        async fn force_acquire(&self, key: &str) -> Result<LockHandle, LockError> {
            self.check_reachable()?;
            self.revoke(key)?;
            self.grant(key)?
                .ok_or_else(|| LockError::Service(format!("lock {key} re-taken during force acquire")))
        }

        async fn force_release(&self, key: &str) -> Result<(), LockError> {
            self.check_reachable()?;
            self.revoke(key)?;
            Ok(())
        }
    }
}
