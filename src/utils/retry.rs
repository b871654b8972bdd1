//! Retry utilities: backoff builders for storage operations.
//!
//! Uses `backon` for exponential backoff with jitter. Builders are consumed
//! through `BackoffBuilder::build()` iterators; an exhausted iterator means
//! stop retrying.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for a failed durable write.
///
/// - Min delay: `delay`
/// - Max attempts: 1 (one retry, then surface the failure)
/// - Jitter enabled
pub fn durable_write_backoff(delay: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(delay)
        .with_max_delay(delay * 4)
        .with_max_times(1)
        .with_jitter()
}

/// Backoff for re-reading a head pointer that disagrees with its snapshot.
///
/// - Min delay: 5ms
/// - Max delay: 50ms
/// - Max attempts: `retries`
pub fn head_reread_backoff(retries: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(50))
        .with_max_times(retries)
}
