#![allow(clippy::unwrap_used, clippy::expect_used)]

use conductor_core::{system_clock, ManualClock};
use conductor_locks::LockManager;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn lease_expiry_hands_resource_to_next_holder() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();
    let mgr = LockManager::new(tmp.path(), Arc::new(clock.clone()))
        .await
        .unwrap();

    let a = mgr
        .acquire_lock("file.txt", "A", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(a.granted);

    let b = mgr
        .acquire_lock("file.txt", "B", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(!b.granted);

    clock.advance(chrono::Duration::seconds(5));

    let b = mgr
        .acquire_lock("file.txt", "B", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(b.granted);
}

#[tokio::test]
async fn two_managers_share_one_table() {
    let tmp = tempfile::tempdir().unwrap();
    let first = LockManager::new(tmp.path(), system_clock()).await.unwrap();
    let second = LockManager::new(tmp.path(), system_clock()).await.unwrap();

    assert!(first
        .acquire_lock("deploy/prod", "deployment:1", Duration::from_secs(60))
        .await
        .unwrap()
        .granted);
    assert!(!second
        .acquire_lock("deploy/prod", "monitoring:2", Duration::from_secs(60))
        .await
        .unwrap()
        .granted);

    let all = second.get_all_locked_files().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all["deploy/prod"].holder_id, "deployment:1");
}

#[tokio::test]
async fn concurrent_acquires_grant_exactly_one() {
    let tmp = tempfile::tempdir().unwrap();
    let mut handles = Vec::new();
    for i in 0..8 {
        let dir = tmp.path().to_path_buf();
        handles.push(tokio::spawn(async move {
            let mgr = LockManager::new(dir, system_clock()).await.unwrap();
            mgr.acquire_lock("shared.db", &format!("holder-{i}"), Duration::from_secs(60))
                .await
                .unwrap()
                .granted
        }));
    }

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);
}
