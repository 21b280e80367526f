//! Per-call timeouts with bounded retry.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

use crate::error::{SyncError, SyncResult};

/// Default timeout for a single network call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub timeout: Duration,
    /// Delay before the second attempt, doubled for each further one
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            timeout: REQUEST_TIMEOUT,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Policy that runs each call exactly once.
    pub fn no_retry(timeout: Duration) -> Self {
        RetryPolicy {
            attempts: 1,
            timeout,
            backoff: Duration::ZERO,
        }
    }

    /// Run `op` with a timeout, retrying transport-class failures.
    ///
    /// Authentication, integrity and conflict errors are returned immediately.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut delay = self.backoff;

        for attempt in 1..=attempts {
            let error = match timeout(self.timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_retryable() => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => SyncError::Timeout(self.timeout.as_secs()),
            };

            if attempt == attempts {
                return Err(error);
            }

            log::warn!(
                "{} failed (attempt {}/{}): {}; retrying",
                what,
                attempt,
                attempts,
                error
            );
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }

        Err(SyncError::Transport(format!("{} was never attempted", what)))
    }
}
