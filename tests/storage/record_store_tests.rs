//! RecordStore interface tests.
//!
//! Stores must be opened and created with a quota of [`super::TEST_QUOTA`].
//! Each test uses its own collection.

use progress_store::model::ProgressSnapshot;
use progress_store::storage::{RecordStore, StorageError};

use super::TEST_QUOTA;

// =============================================================================
// append / read
// =============================================================================

pub async fn test_append_ids_increase<S: RecordStore>(store: &S) {
    let first = store
        .append("test_ids", b"one".to_vec())
        .await
        .expect("append should succeed");
    let second = store.append("test_ids", b"two".to_vec()).await.unwrap();
    let other = store.append("test_ids_other", b"x".to_vec()).await.unwrap();

    assert!(second > first, "ids must be monotonic");
    assert!(other > second, "ids are monotonic across collections");
}

pub async fn test_read_returns_bytes<S: RecordStore>(store: &S) {
    let data = vec![1, 2, 3, 4, 5, 100, 200, 255];
    let id = store.append("test_read", data.clone()).await.unwrap();

    let record = store
        .read("test_read", id)
        .await
        .expect("read should succeed")
        .expect("record should exist");
    assert_eq!(record.id, id);
    assert_eq!(record.bytes, data);
}

pub async fn test_read_missing<S: RecordStore>(store: &S) {
    let id = store.append("test_read_missing", b"x".to_vec()).await.unwrap();
    assert!(store
        .read("test_read_missing_elsewhere", id)
        .await
        .unwrap()
        .is_none());
}

pub async fn test_snapshot_round_trip<S: RecordStore>(store: &S) {
    let snapshot = ProgressSnapshot::new()
        .with_points(250)
        .with_achievement("streak_3");
    let id = store
        .append("test_snapshot", serde_json::to_vec(&snapshot).unwrap())
        .await
        .unwrap();

    let record = store.read("test_snapshot", id).await.unwrap().unwrap();
    let read: ProgressSnapshot = serde_json::from_slice(&record.bytes).unwrap();
    assert_eq!(read, snapshot);
}

// =============================================================================
// list / remove
// =============================================================================

pub async fn test_list_ascending<S: RecordStore>(store: &S) {
    let mut ids = Vec::new();
    for i in 0..3u8 {
        ids.push(store.append("test_list", vec![i]).await.unwrap());
    }
    store.append("test_list_other", vec![9]).await.unwrap();

    let listed: Vec<_> = store
        .list("test_list")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(listed, ids);
}

pub async fn test_list_empty_collection<S: RecordStore>(store: &S) {
    assert!(store.list("test_never_used").await.unwrap().is_empty());
}

pub async fn test_list_reports_size<S: RecordStore>(store: &S) {
    store.append("test_size", vec![0u8; 42]).await.unwrap();
    let metas = store.list("test_size").await.unwrap();
    assert_eq!(metas.len(), 1);
    assert_eq!(metas[0].size, 42);
}

pub async fn test_remove_record<S: RecordStore>(store: &S) {
    let keep = store.append("test_remove", b"keep".to_vec()).await.unwrap();
    let drop = store.append("test_remove", b"drop".to_vec()).await.unwrap();

    store.remove("test_remove", drop).await.expect("remove should succeed");
    store
        .remove("test_remove", drop)
        .await
        .expect("removing twice should succeed");

    assert!(store.read("test_remove", drop).await.unwrap().is_none());
    let ids: Vec<_> = store
        .list("test_remove")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec![keep]);
}

// =============================================================================
// shared medium
// =============================================================================

/// Two handles over the same backing storage, as two tabs would hold.
///
/// Appends from either handle get distinct, increasing ids and neither
/// replaces the other's record.
pub async fn test_shared_medium_appends<S: RecordStore>(a: &S, b: &S) {
    let id_a = a.append("test_shared", b"from-a".to_vec()).await.unwrap();
    let id_b = b.append("test_shared", b"from-b".to_vec()).await.unwrap();
    assert_ne!(id_a, id_b, "handles must not reuse a record id");
    assert!(id_b > id_a);

    assert_eq!(a.read("test_shared", id_a).await.unwrap().unwrap().bytes, b"from-a");
    assert_eq!(b.read("test_shared", id_b).await.unwrap().unwrap().bytes, b"from-b");
    assert_eq!(a.read("test_shared", id_b).await.unwrap().unwrap().bytes, b"from-b");

    let id_next = a.append("test_shared", b"again-a".to_vec()).await.unwrap();
    assert!(id_next > id_b, "ids stay above records written elsewhere");

    let ids: Vec<_> = b
        .list("test_shared")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec![id_a, id_b, id_next]);
}

// =============================================================================
// capacity
// =============================================================================

pub async fn test_usage_reports_quota<S: RecordStore>(store: &S) {
    let before = store.estimate_usage().await.unwrap();
    store.append("test_usage", vec![1u8; 100]).await.unwrap();
    let after = store.estimate_usage().await.unwrap();

    assert_eq!(after.quota_bytes, TEST_QUOTA);
    assert_eq!(after.used_bytes, before.used_bytes + 100);
}

pub async fn test_capacity_exceeded_is_distinct<S: RecordStore>(store: &S) {
    let before = store.list("test_capacity").await.unwrap().len();
    let err = store
        .append("test_capacity", vec![0u8; (TEST_QUOTA * 2) as usize])
        .await
        .expect_err("oversized append should fail");

    assert!(
        matches!(err, StorageError::CapacityExceeded { quota, .. } if quota == TEST_QUOTA),
        "expected CapacityExceeded, got {:?}",
        err
    );
    assert_eq!(store.list("test_capacity").await.unwrap().len(), before);
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all RecordStore interface tests against an opened store.
#[macro_export]
macro_rules! run_record_store_tests {
    ($store:expr) => {
        use $crate::storage::record_store_tests::*;

        test_append_ids_increase($store).await;
        println!("  test_append_ids_increase: PASSED");

        test_read_returns_bytes($store).await;
        println!("  test_read_returns_bytes: PASSED");

        test_read_missing($store).await;
        println!("  test_read_missing: PASSED");

        test_snapshot_round_trip($store).await;
        println!("  test_snapshot_round_trip: PASSED");

        test_list_ascending($store).await;
        println!("  test_list_ascending: PASSED");

        test_list_empty_collection($store).await;
        println!("  test_list_empty_collection: PASSED");

        test_list_reports_size($store).await;
        println!("  test_list_reports_size: PASSED");

        test_remove_record($store).await;
        println!("  test_remove_record: PASSED");

        test_usage_reports_quota($store).await;
        println!("  test_usage_reports_quota: PASSED");

        test_capacity_exceeded_is_distinct($store).await;
        println!("  test_capacity_exceeded_is_distinct: PASSED");
    };
}
