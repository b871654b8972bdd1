//! KeyValueStore interface tests.
//!
//! Stores must be created with a quota of [`super::TEST_QUOTA`].

use progress_store::model::ProgressSnapshot;
use progress_store::storage::{KeyValueStore, StorageError};

use super::TEST_QUOTA;

// =============================================================================
// read / write
// =============================================================================

pub fn test_read_missing<S: KeyValueStore>(store: &S) {
    let value = store.read("test:missing").expect("read should succeed");
    assert!(value.is_none(), "missing key should read as None");
}

pub fn test_write_then_read<S: KeyValueStore>(store: &S) {
    store
        .write("test:write", b"hello")
        .expect("write should succeed");
    let value = store
        .read("test:write")
        .expect("read should succeed")
        .expect("value should exist");
    assert_eq!(value, b"hello");
}

pub fn test_overwrite_replaces<S: KeyValueStore>(store: &S) {
    store.write("test:overwrite", b"first").unwrap();
    store.write("test:overwrite", b"second value").unwrap();
    assert_eq!(
        store.read("test:overwrite").unwrap().unwrap(),
        b"second value"
    );
}

pub fn test_keys_are_independent<S: KeyValueStore>(store: &S) {
    store.write("test:a", b"a").unwrap();
    store.write("test:b", b"b").unwrap();
    assert_eq!(store.read("test:a").unwrap().unwrap(), b"a");
    assert_eq!(store.read("test:b").unwrap().unwrap(), b"b");
}

pub fn test_snapshot_round_trip<S: KeyValueStore>(store: &S) {
    let snapshot = ProgressSnapshot::new()
        .with_points(100)
        .with_quizzes_taken(1)
        .with_achievement("first_quiz");
    let bytes = serde_json::to_vec(&snapshot).unwrap();

    store.write("test:snapshot", &bytes).unwrap();
    let read: ProgressSnapshot =
        serde_json::from_slice(&store.read("test:snapshot").unwrap().unwrap()).unwrap();
    assert_eq!(read, snapshot);
}

// =============================================================================
// remove
// =============================================================================

pub fn test_remove_existing<S: KeyValueStore>(store: &S) {
    store.write("test:remove", b"gone").unwrap();
    store.remove("test:remove").expect("remove should succeed");
    assert!(store.read("test:remove").unwrap().is_none());
}

pub fn test_remove_missing<S: KeyValueStore>(store: &S) {
    store
        .remove("test:never-written")
        .expect("removing a missing key should succeed");
}

// =============================================================================
// capacity
// =============================================================================

pub fn test_usage_reports_quota<S: KeyValueStore>(store: &S) {
    let before = store.estimate_usage().unwrap();
    store.write("test:usage", &[7u8; 64]).unwrap();
    let after = store.estimate_usage().unwrap();

    assert_eq!(after.quota_bytes, TEST_QUOTA);
    assert!(after.used_bytes >= before.used_bytes + 64);
}

pub fn test_capacity_exceeded_is_distinct<S: KeyValueStore>(store: &S) {
    let oversized = vec![0u8; (TEST_QUOTA * 2) as usize];
    let err = store
        .write("test:oversized", &oversized)
        .expect_err("oversized write should fail");

    assert!(
        matches!(err, StorageError::CapacityExceeded { quota, .. } if quota == TEST_QUOTA),
        "expected CapacityExceeded, got {:?}",
        err
    );
    assert!(store.read("test:oversized").unwrap().is_none());
}

pub fn test_rejected_write_keeps_old_value<S: KeyValueStore>(store: &S) {
    store.write("test:keep", b"old").unwrap();
    let oversized = vec![0u8; (TEST_QUOTA * 2) as usize];
    assert!(store.write("test:keep", &oversized).is_err());
    assert_eq!(store.read("test:keep").unwrap().unwrap(), b"old");
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all KeyValueStore interface tests against a store implementation.
#[macro_export]
macro_rules! run_key_value_tests {
    ($store:expr) => {
        use $crate::storage::key_value_tests::*;

        test_read_missing($store);
        println!("  test_read_missing: PASSED");

        test_write_then_read($store);
        println!("  test_write_then_read: PASSED");

        test_overwrite_replaces($store);
        println!("  test_overwrite_replaces: PASSED");

        test_keys_are_independent($store);
        println!("  test_keys_are_independent: PASSED");

        test_snapshot_round_trip($store);
        println!("  test_snapshot_round_trip: PASSED");

        test_remove_existing($store);
        println!("  test_remove_existing: PASSED");

        test_remove_missing($store);
        println!("  test_remove_missing: PASSED");

        test_usage_reports_quota($store);
        println!("  test_usage_reports_quota: PASSED");

        test_capacity_exceeded_is_distinct($store);
        println!("  test_capacity_exceeded_is_distinct: PASSED");

        test_rejected_write_keeps_old_value($store);
        println!("  test_rejected_write_keeps_old_value: PASSED");
    };
}
