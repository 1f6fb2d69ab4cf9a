//! Bounded exponential retry for transient source errors.

use backoff::{ExponentialBackoff, future::retry};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry policy with the given total time budget.
pub fn retry_policy(max_elapsed: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: Some(max_elapsed),
        ..ExponentialBackoff::default()
    }
}

/// Run `operation`, retrying errors classified as transient until the budget is spent.
pub async fn with_retry<T, E, F, Fut>(
    max_elapsed: Duration,
    is_transient: fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry(retry_policy(max_elapsed), || {
        let attempt = operation();
        async move {
            attempt.await.map_err(|e| {
                if is_transient(&e) {
                    debug!("Transient error, retrying: {}", e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}
