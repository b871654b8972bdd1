//! In-memory adapter contract tests.
//!
//! Run with: cargo test --test storage_memory -- --nocapture

mod storage;

use progress_store::storage::memory::{MemoryKeyValueStore, MemoryRecordStore};
use progress_store::storage::{KeyValueStore, RecordStore, StorageError};

use storage::TEST_QUOTA;

#[test]
fn test_memory_key_value_store() {
    println!("=== MemoryKeyValueStore Tests ===");

    let store = MemoryKeyValueStore::with_quota(TEST_QUOTA);
    run_key_value_tests!(&store);

    println!("=== All MemoryKeyValueStore tests PASSED ===");
}

#[tokio::test]
async fn test_memory_record_store() {
    println!("=== MemoryRecordStore Tests ===");

    let store = MemoryRecordStore::with_quota(TEST_QUOTA);
    store.open().await.expect("open should succeed");
    run_record_store_tests!(&store);

    println!("=== All MemoryRecordStore tests PASSED ===");
}

#[tokio::test]
async fn test_memory_record_store_shared_handles() {
    let store = MemoryRecordStore::with_quota(TEST_QUOTA);
    store.open().await.unwrap();
    storage::record_store_tests::test_shared_medium_appends(&store, &store).await;
}

#[test]
fn test_memory_key_value_injected_failures() {
    let store = MemoryKeyValueStore::new();
    store.set_fail_key("progress:head", true);

    assert!(matches!(
        store.write("progress:head", b"x"),
        Err(StorageError::CapacityExceeded { .. })
    ));
    store.write("progress:other", b"x").unwrap();

    store.set_fail_on_write(true);
    assert!(store.write("progress:other", b"y").is_err());
    assert_eq!(store.read("progress:other").unwrap().unwrap(), b"x");
}

#[tokio::test]
async fn test_memory_record_store_denied_open() {
    let store = MemoryRecordStore::new();
    store.set_fail_on_open(true);
    assert!(matches!(
        store.open().await,
        Err(StorageError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_memory_record_store_failing_appends_recover() {
    let store = MemoryRecordStore::new();
    store.fail_next_appends(2);

    assert!(matches!(
        store.append("snapshots", b"a".to_vec()).await,
        Err(StorageError::Io(_))
    ));
    assert!(store.append("snapshots", b"b".to_vec()).await.is_err());
    assert!(store.append("snapshots", b"c".to_vec()).await.is_ok());
    assert_eq!(store.append_count(), 1);
}
