use std::time::Duration;

use futures::Future;
use rand::Rng;

use crate::{config::EventConfig, error::RelayError};

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the current backoff added as random jitter (0-1)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&EventConfig::default())
    }
}

impl From<&EventConfig> for RetryPolicy {
    fn from(config: &EventConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            backoff_multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error,
/// or runs out of retries. Returns the last error in the latter cases.
pub async fn with_retry<F, Fut, T>(mut operation: F, policy: &RetryPolicy) -> Result<T, RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    let mut attempt = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= policy.max_retries || !error.is_retryable() {
                    return Err(error);
                }

                let jitter_range = (backoff.as_millis() as f64 * policy.jitter_factor) as u64;
                let jitter = if jitter_range > 0 {
                    rand::thread_rng().gen_range(0..jitter_range)
                } else {
                    0
                };
                tokio::time::sleep(backoff.saturating_add(Duration::from_millis(jitter))).await;

                attempt += 1;
                let next = backoff.as_millis() as f64 * policy.backoff_multiplier;
                backoff = Duration::from_millis(next.min(policy.max_backoff.as_millis() as f64) as u64);
            }
        }
    }
}
