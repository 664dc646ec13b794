use mds_session::{
    store::{MemoryRecordStore, StoreCall, StoreOp},
    time::{Clock, ManualClock, SystemClock},
    Error, Lease, LeaseStatus, SessionManager, SessionOptions, StatusCode,
};
use std::sync::Arc;

const LEASE_US: i64 = 100_000;

fn options() -> SessionOptions {
    SessionOptions {
        lease_time_us: LEASE_US,
        tolerance_time_us: 0,
        interval_time_us: 50_000,
        ..SessionOptions::default()
    }
}

fn row(path: &str, session_id: &str, create_time_us: i64) -> Lease {
    let mut lease = Lease::new(path, "127.0.0.1", 12_345, 0, create_time_us);
    lease.session_id = session_id.to_string();
    lease
}

#[tokio::test]
async fn test_each_setup_step_failure_aborts_init() {
    let steps = [
        StoreOp::Connect,
        StoreOp::CreateSchema,
        StoreOp::SelectSchema,
        StoreOp::CreateTables,
    ];

    for (i, step) in steps.iter().enumerate() {
        let store = Arc::new(MemoryRecordStore::with_rows(vec![row("/file1", "s1", 1)]));
        store.fail_next(*step, 1);
        let manager = SessionManager::new(store.clone());

        let err = manager.init(options()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)), "step {step:?}: {err:?}");

        // Setup stops at the failed step
        assert_eq!(store.calls().len(), i + 1, "step {step:?}");
        assert_eq!(manager.session_count().await, 0);

        manager.start();
        assert!(!manager.is_running());
        manager.stop().await;
    }
}

#[tokio::test]
async fn test_load_failure_aborts_init() {
    let store = Arc::new(MemoryRecordStore::with_rows(vec![row("/file1", "s1", 1)]));
    store.fail_next(StoreOp::LoadAll, 1);
    let manager = SessionManager::new(store.clone());

    let err = manager.init(options()).await.unwrap_err();
    assert!(matches!(err, Error::Store(_)));
    assert_eq!(manager.session_count().await, 0);

    let result = manager.insert_session("/file1", "127.0.0.1").await;
    assert!(matches!(result, Err(Error::NotInitialized)));

    manager.start();
    manager.stop().await;
}

#[tokio::test]
async fn test_latest_persisted_session_survives() {
    let store = Arc::new(MemoryRecordStore::with_rows(vec![
        row("/file1", "sessionID1", 123_456),
        row("/file1", "sessionID2", 1_234_567),
        row("/file1", "sessionID3", 12_345),
    ]));
    let manager = SessionManager::new(store.clone());

    manager.init(options()).await.unwrap();

    let held = manager.get_session("/file1").await.unwrap();
    assert_eq!(held.session_id, "sessionID2");
    assert_eq!(held.create_time_us, 1_234_567);

    let mut deleted: Vec<String> = store
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            StoreCall::Delete { path, session_id } => {
                assert_eq!(path, "/file1");
                Some(session_id)
            }
            _ => None,
        })
        .collect();
    deleted.sort();
    assert_eq!(deleted, vec!["sessionID1".to_string(), "sessionID3".to_string()]);
    assert_eq!(store.rows_for("/file1"), vec![held]);
}

#[tokio::test]
async fn test_ambiguous_duplicates_fail_init() {
    let store = Arc::new(MemoryRecordStore::with_rows(vec![
        row("/file1", "sessionID1", 123_456),
        row("/file1", "sessionID2", 123_456),
    ]));
    let manager = SessionManager::new(store.clone());

    let err = manager.init(options()).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateSession { count: 2, .. }));
    assert_eq!(store.count(StoreOp::Delete), 0);
    assert_eq!(store.rows_for("/file1").len(), 2);

    manager.start();
    manager.stop().await;
}

#[tokio::test]
async fn test_failed_duplicate_cleanup_fails_init() {
    let store = Arc::new(MemoryRecordStore::with_rows(vec![
        row("/file1", "sessionID1", 1),
        row("/file1", "sessionID2", 2),
    ]));
    store.fail_next(StoreOp::Delete, 1);
    let manager = SessionManager::new(store.clone());

    assert!(matches!(manager.init(options()).await, Err(Error::Store(_))));
    assert_eq!(manager.session_count().await, 0);
    assert!(!manager.is_running());
}

#[tokio::test]
async fn test_unexpired_persisted_session_blocks_open() {
    let now = SystemClock.now_us();
    let store = Arc::new(MemoryRecordStore::with_rows(vec![row("/file1", "sessionID1", now)]));
    let clock = Arc::new(ManualClock::new(now));
    let manager = SessionManager::with_clock(store.clone(), clock.clone());
    manager.init(options()).await.unwrap();

    let occupied = manager.insert_session("/file1", "127.0.0.1").await;
    assert_eq!(StatusCode::of(&occupied), StatusCode::FileOccupied);

    clock.advance_us(LEASE_US);
    let lease = manager.insert_session("/file1", "127.0.0.1").await.unwrap();
    assert_ne!(lease.session_id, "sessionID1");
    assert_eq!(store.count(StoreOp::Delete), 1);
    assert_eq!(store.count(StoreOp::Insert), 1);
}

#[tokio::test]
async fn test_stale_persisted_session_is_superseded_immediately() {
    let now = SystemClock.now_us();
    let mut stale = row("/file1", "sessionID1", now);
    stale.status = LeaseStatus::Stale;
    let store = Arc::new(MemoryRecordStore::with_rows(vec![stale]));
    let manager = SessionManager::new(store.clone());
    manager.init(options()).await.unwrap();

    let lease = manager.insert_session("/file1", "127.0.0.1").await.unwrap();
    assert_eq!(lease.status, LeaseStatus::Active);
    assert_eq!(store.count(StoreOp::Delete), 1);
    assert_eq!(store.rows_for("/file1"), vec![lease]);
}

#[tokio::test]
async fn test_restart_after_crash_restores_sessions() {
    let store = Arc::new(MemoryRecordStore::new());
    let clock = Arc::new(ManualClock::new(50_000_000));

    let first = SessionManager::with_clock(store.clone(), clock.clone());
    first.init(options()).await.unwrap();
    first.start();
    let lease = first.insert_session("/file1", "127.0.0.1").await.unwrap();
    // Dropped without stop, so nothing is marked stale
    drop(first);

    let second = SessionManager::with_clock(store.clone(), clock.clone());
    second.init(options()).await.unwrap();
    assert_eq!(second.get_session("/file1").await, Some(lease.clone()));

    let occupied = second.insert_session("/file1", "127.0.0.1").await;
    assert_eq!(StatusCode::of(&occupied), StatusCode::FileOccupied);

    // The restored session can still be renewed by its holder
    second
        .update_session("/file1", &lease.session_id, &lease.token, "127.0.0.1")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_restart_after_clean_stop_frees_paths() {
    let store = Arc::new(MemoryRecordStore::new());
    let clock = Arc::new(ManualClock::new(50_000_000));

    let first = SessionManager::with_clock(store.clone(), clock.clone());
    first.init(options()).await.unwrap();
    first.start();
    let old = first.insert_session("/file1", "127.0.0.1").await.unwrap();
    first.stop().await;
    drop(first);
    assert_eq!(store.rows_for("/file1")[0].status, LeaseStatus::Stale);

    // Well inside the old lease window
    clock.advance_us(10);
    let second = SessionManager::with_clock(store.clone(), clock.clone());
    second.init(options()).await.unwrap();
    store.clear_calls();

    let lease = second.insert_session("/file1", "127.0.0.1").await.unwrap();
    assert_ne!(lease.session_id, old.session_id);
    assert_eq!(
        store.calls(),
        vec![
            StoreCall::Delete {
                path: "/file1".to_string(),
                session_id: old.session_id.clone(),
            },
            StoreCall::Insert {
                path: "/file1".to_string(),
                session_id: lease.session_id.clone(),
            },
        ]
    );

    // The old holder cannot renew a superseded session
    let renewed = second
        .update_session("/file1", &old.session_id, &old.token, "127.0.0.1")
        .await;
    assert_eq!(StatusCode::of(&renewed), StatusCode::IdentityMismatch);
}
