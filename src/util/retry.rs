//! Bounded retry for fallible async operations.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::NarratorError;

/// How many times to try an operation and how long to pause in between.
///
/// Only errors whose [`NarratorError::is_retryable`] holds are retried; any
/// other error is returned on the spot.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub attempts: u32,
    /// Pause before the second attempt.
    pub pause: Duration,
    /// Upper bound on the pause as it doubles.
    pub max_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            pause: Duration::from_millis(500),
            max_pause: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Store flushes get exactly one more try after a short pause.
    pub fn single_retry() -> Self {
        Self {
            attempts: 2,
            pause: Duration::from_millis(50),
            max_pause: Duration::from_millis(50),
        }
    }

    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, NarratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, NarratorError>>,
    {
        let attempts = self.attempts.max(1);
        let mut pause = self.pause;
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && e.is_retryable() => {
                    warn!(attempt, attempts, error = %e, "operation failed, retrying");
                    tokio::time::sleep(pause).await;
                    pause = (pause * 2).min(self.max_pause);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_persistence_failures_once() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::single_retry()
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(NarratorError::persistence("/tmp/s.json", "disk full"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_last_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::single_retry()
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(NarratorError::persistence("/tmp/s.json", "disk full"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(NarratorError::Cancelled)
            })
            .await;
        assert!(matches!(result, Err(NarratorError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
