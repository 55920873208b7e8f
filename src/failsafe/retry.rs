//! Retry logic with exponential backoff

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tokio::time::sleep;
use tracing::debug;

use crate::Error;
use crate::config::RetryConfig;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Initial backoff
    pub initial_backoff: Duration,
    /// Maximum backoff
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
        }
    }

    /// Single attempt, no retries
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delays to sleep between attempts; yields at most `max_attempts - 1` items
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        #[allow(clippy::cast_possible_truncation)]
        let factor = self.multiplier as f32;
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(factor)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .build()
    }

    /// Delay honouring a server `Retry-After`, capped at `max_backoff`
    #[must_use]
    pub fn delay_for(&self, computed: Duration, retry_after: Option<Duration>) -> Duration {
        retry_after.map_or(computed, |ra| ra.min(self.max_backoff))
    }
}

/// Execute a future with retry logic
///
/// # Errors
///
/// Returns the last error from `f` if all retry attempts are exhausted or
/// the error is not retryable.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, name: &str, mut f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut backoff = policy.backoff();
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }

                let Some(delay) = backoff.next() else {
                    debug!(operation = name, attempts, "Max retry attempts reached");
                    return Err(e);
                };

                let retry_after = match &e {
                    Error::RateLimited { retry_after, .. } => *retry_after,
                    _ => None,
                };
                let delay = policy.delay_for(delay, retry_after);
                debug!(
                    operation = name,
                    attempt = attempts,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Retrying after backoff"
                );
                sleep(delay).await;
            }
        }
    }
}
