//! Exponential backoff for remote annotator calls
//!
//! Only errors classified as retryable by
//! [`AnnotatorError::is_retryable`](crate::annotator::AnnotatorError::is_retryable)
//! are retried; anything else is returned on the first failure.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::annotator::AnnotatorResult;

/// Backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_factor.powi(retry as i32);
        let delay = self.initial_delay.mul_f64(factor.max(0.0));
        delay.min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> AnnotatorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AnnotatorResult<T>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if retry >= policy.max_retries => {
                error!(label, retries = policy.max_retries, error = %e, "Giving up after retries");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(retry);
                warn!(
                    label,
                    attempt = retry + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
        }
    }
}
