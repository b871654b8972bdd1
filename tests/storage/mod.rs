//! Shared storage contract tests.
//!
//! Tests the KeyValueStore and RecordStore interfaces against all adapters.
//! Each adapter's test binary imports these functions and runs them.

pub mod key_value_tests;
pub mod record_store_tests;

/// Quota used by every adapter under contract test.
pub const TEST_QUOTA: u64 = 4096;
