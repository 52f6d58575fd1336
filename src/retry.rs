//! Retry Combinator
//!
//! Bounded retries with exponential backoff for peer calls.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Retry policy
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first call
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(10),
        }
    }

    /// Never retry
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(200))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted. `op` receives the zero-based attempt number.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    label,
                    attempt,
                    policy.max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
