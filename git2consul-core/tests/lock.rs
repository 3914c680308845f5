use std::sync::Arc;
use std::time::Duration;

use git2consul_core::contract::MockLockService;
use git2consul_core::error::LockError;
use git2consul_core::lock::{DistributedLock, LockHandle, MemoryLockService, ReleasePolicy};
use tokio::sync::watch;
use tokio::time::timeout;

const KEY: &str = "git2consul/operator";

fn quick_policy(max_attempts: u32) -> ReleasePolicy {
    ReleasePolicy {
        max_attempts: Some(max_attempts),
        backoff: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn second_acquire_blocks_until_release() {
    let service = Arc::new(MemoryLockService::new());
    let lock = DistributedLock::new(service.clone());

    let first = lock.acquire(KEY).await.unwrap();
    let contender = lock.clone();
    let mut second = tokio::spawn(async move { contender.acquire(KEY).await });

    assert!(
        timeout(Duration::from_millis(50), &mut second).await.is_err(),
        "second caller must wait while the lock is held"
    );
    assert!(service.is_held(KEY));

    lock.release(KEY).await.unwrap();
    assert!(first.is_lost());

    let granted = timeout(Duration::from_secs(5), second)
        .await
        .expect("second caller granted after release")
        .unwrap()
        .unwrap();
    assert_eq!(granted.key(), KEY);
    assert!(!granted.is_lost());
}

#[tokio::test]
async fn unreachable_service_fails_acquire() {
    let service = Arc::new(MemoryLockService::new());
    service.set_unreachable(true);
    let lock = DistributedLock::new(service);

    let err = lock.acquire(KEY).await.unwrap_err();
    assert!(matches!(err, LockError::Unreachable(_)));
}

#[tokio::test]
async fn release_retries_transient_failures() {
    let service = Arc::new(MemoryLockService::new());
    let lock = DistributedLock::new(service.clone()).with_release_policy(quick_policy(5));
    let _handle = lock.acquire(KEY).await.unwrap();

    service.fail_next_releases(2);
    lock.release(KEY).await.unwrap();
    assert!(!service.is_held(KEY));
}

#[tokio::test]
async fn release_gives_up_after_policy_attempts() {
    let service = Arc::new(MemoryLockService::new());
    let lock = DistributedLock::new(service.clone()).with_release_policy(quick_policy(2));
    let _handle = lock.acquire(KEY).await.unwrap();

    service.fail_next_releases(10);
    let err = lock.release(KEY).await.unwrap_err();
    assert!(matches!(err, LockError::ReleaseExhausted { attempts: 2, .. }));
    assert!(service.is_held(KEY));
}

#[tokio::test]
async fn releasing_unheld_lock_is_reported() {
    let lock = DistributedLock::new(Arc::new(MemoryLockService::new()));
    let err = lock.release(KEY).await.unwrap_err();
    assert!(matches!(err, LockError::NotHeld(_)));
}

#[tokio::test]
async fn force_acquire_takes_over_from_holder() {
    let service = Arc::new(MemoryLockService::new());
    let lock = DistributedLock::new(service.clone());
    let mut original = lock.acquire(KEY).await.unwrap();

    let forced = lock.force_acquire(KEY).await.unwrap();
    timeout(Duration::from_secs(1), original.lost())
        .await
        .expect("previous holder observes the loss");
    assert!(!forced.is_lost());
    assert!(service.is_held(KEY));

    lock.force_release(KEY).await.unwrap();
    assert!(forced.is_lost());
    assert!(!service.is_held(KEY));
}

#[tokio::test]
async fn acquire_error_from_service_is_surfaced() {
    let mut service = MockLockService::new();
    service
        .expect_acquire_lock()
        .times(1)
        .returning(|_| Err(LockError::Service("no session".into())));
    let lock = DistributedLock::new(Arc::new(service));

    assert!(lock.acquire(KEY).await.is_err());
}

#[tokio::test]
async fn acquire_passes_through_service_handle() {
    let (tx, rx) = watch::channel(false);
    let rx = std::sync::Mutex::new(Some(rx));
    let mut service = MockLockService::new();
    service.expect_acquire_lock().times(1).returning(move |key| {
        let rx = rx.lock().unwrap().take().expect("single acquire");
        Ok(LockHandle::new(key, rx))
    });
    let lock = DistributedLock::new(Arc::new(service));

    let handle = lock.acquire(KEY).await.unwrap();
    assert!(!handle.is_lost());
    tx.send(true).unwrap();
    assert!(handle.is_lost());
}
