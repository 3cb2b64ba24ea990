//! Connection retry with exponential backoff

use backoff::{backoff::Backoff, ExponentialBackoff};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::IsRetryable;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn from_provider_config(config: &ProviderConfig) -> Self {
        Self {
            max_attempts: config.connect_retry_attempts.max(1),
            initial_delay: Duration::from_millis(config.connect_initial_delay_ms),
            ..Self::default()
        }
    }

    fn to_exponential_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_delay,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Retry an async operation while it fails with a retryable error
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + IsRetryable,
{
    let mut backoff = config.to_exponential_backoff();
    let mut attempt = 1;

    loop {
        debug!("Attempt {} of {}", attempt, config.max_attempts);

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("Operation succeeded after {} attempts", attempt);
                }
                return Ok(result);
            }
            Err(error) => {
                if attempt >= config.max_attempts || !error.is_retryable() {
                    warn!("Operation failed after {} attempts: {}", attempt, error);
                    return Err(error);
                }

                let delay = backoff.next_backoff().unwrap_or(config.max_delay);
                warn!(
                    "Operation failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt, config.max_attempts, delay, error
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
