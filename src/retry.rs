//! Retry decisions for jobs and for store calls.
//!
//! Two separate budgets live here. A job's attempts are capped by
//! `max_retries` and spent by handler failures. Store calls get their own
//! exponential backoff and never touch the job's attempt counter.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::handler::JobError;
use crate::storage::StorageError;

/// Exponential backoff for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Total tries including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// Single try, no waiting.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before the retry that follows failed try `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run a store operation, retrying transient errors with backoff.
///
/// Non-transient errors and the last transient one are returned as is.
pub async fn with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Store operation failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// What happens to a job after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    DeadLetter,
}

/// `attempt` is the attempt that just failed. A retryable failure goes back
/// to ready while `attempt <= max_retries`, so a job runs at most
/// `max_retries + 1` times.
pub fn disposition(attempt: u32, max_retries: u32, error: &JobError) -> Disposition {
    if error.is_retryable() && attempt <= max_retries {
        Disposition::Retry
    } else {
        Disposition::DeadLetter
    }
}
