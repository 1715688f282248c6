//! Lock contention scenarios.

use std::sync::Arc;
use std::time::Duration;

use plandex_server::storage::locks::{LockRepoParams, LockScope, LockStore};
use plandex_server::storage::Database;
use tokio_util::sync::CancellationToken;

fn store() -> LockStore {
    LockStore::new(Database::new_in_memory().unwrap())
}

fn params(scope: LockScope) -> LockRepoParams {
    LockRepoParams {
        org_id: "org-1".into(),
        user_id: Some("user-1".into()),
        plan_id: "p1".into(),
        branch: Some("main".into()),
        scope,
        plan_build_id: None,
        reason: "integration".into(),
    }
}

#[tokio::test]
async fn test_two_reads_then_blocked_write() {
    let store = Arc::new(store());

    // two concurrent readers succeed immediately
    let read_a = store
        .acquire(params(LockScope::Read), CancellationToken::new())
        .await
        .unwrap();
    let read_b = store
        .acquire(params(LockScope::Read), CancellationToken::new())
        .await
        .unwrap();

    // a write can't get in while the readers hold the branch
    assert!(store.try_acquire(&params(LockScope::Write)).unwrap().is_none());

    // writer retries in the background; it succeeds once both readers release
    let writer = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            store
                .acquire(params(LockScope::Write), CancellationToken::new())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(150)).await;
    store.release(&read_a).unwrap();
    store.release(&read_b).unwrap();

    let write_id = tokio::time::timeout(Duration::from_secs(12), writer)
        .await
        .expect("writer should acquire within the retry budget")
        .unwrap()
        .unwrap();
    store.release(&write_id).unwrap();
}

#[tokio::test]
async fn test_heartbeat_keeps_lock_alive() {
    let store = store();
    let cancel = CancellationToken::new();
    let id = store
        .acquire(params(LockScope::Write), cancel.clone())
        .await
        .unwrap();

    // outlive the heartbeat timeout; renewals must keep the row live
    tokio::time::sleep(Duration::from_millis(4500)).await;
    assert!(store.try_acquire(&params(LockScope::Write)).unwrap().is_none());

    store.release(&id).unwrap();
    cancel.cancel();
    assert!(store.try_acquire(&params(LockScope::Write)).unwrap().is_some());
}

#[tokio::test]
async fn test_dead_holder_is_reaped_by_contender() {
    let store = store();

    // cancel the holder's token right away so its heartbeat loop stops
    let cancel = CancellationToken::new();
    let _abandoned = store
        .acquire(params(LockScope::Write), cancel.clone())
        .await
        .unwrap();
    cancel.cancel();

    // after the heartbeat timeout a contender succeeds within one retry cycle
    tokio::time::sleep(Duration::from_millis(4500)).await;
    let contender = store
        .acquire(params(LockScope::Write), CancellationToken::new())
        .await;
    assert!(contender.is_ok());
}
