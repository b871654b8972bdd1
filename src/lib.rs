//! Progress Store - durable client-side quiz progress
//!
//! Persists user progress across a bounded synchronous key-value store and
//! a larger asynchronous record store, keeps the two consistent through a
//! checksummed head pointer, deduplicates and throttles writes, migrates
//! old schemas and invalidates other open tabs on commit.

pub mod checksum;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod migrate;
pub mod model;
pub mod notifier;
pub mod storage;
pub mod store;
pub mod utils;

pub use coordinator::{SaveOptions, SaveOutcome, SaveStatus, WriteCoordinator, WritePhase};
pub use error::StoreError;
pub use events::StoreEvent;
pub use model::ProgressSnapshot;
pub use notifier::{LocalTabChannel, TabChannel};
pub use store::{ProgressStore, SaveResult, StorageHealth};
