//! Bounded exponential backoff for exchange fetches and store writes.

use crate::config::HistoricalConfig;
use crate::error::{AppError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, the first one included.
    pub attempts: u32,
    /// Delay after the first failure; doubles on each further failure.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    pub fn from_config(config: &HistoricalConfig) -> Self {
        Self::new(
            config.retry_attempts,
            Duration::from_millis(config.retry_delay_ms),
        )
    }

    /// Sleep after the `failed`-th failure (1-based): `base * 2^(failed-1)`.
    pub fn delay_after(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// No jitter. The last error is returned wrapped in
/// [`AppError::RetriesExhausted`].
pub async fn retry_with_backoff<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut failed = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                failed += 1;
                if failed >= policy.attempts {
                    return Err(AppError::RetriesExhausted {
                        attempts: failed,
                        source: Box::new(e),
                    });
                }

                let delay = policy.delay_after(failed);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    label, failed, policy.attempts, delay, e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
