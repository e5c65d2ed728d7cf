//! Bounded retry with exponential backoff.

use crate::error::RelayError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry schedule for transient network failures.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Minimum 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to use after `current`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.backoff_multiplier.max(1.0))
            .min(self.max_backoff)
    }

    /// Run `operation` until it succeeds or attempts run out.
    /// The last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, RelayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(
                        event = "retrying",
                        operation = what,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        retry_in = ?backoff,
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = self.next_backoff(backoff);
                    attempt += 1;
                }
            }
        }
    }
}
