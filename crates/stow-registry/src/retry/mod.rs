//! Bounded exponential backoff around registry calls
//!
//! A plain loop: check cancellation, attempt, classify the error, sleep.
//! Cancellation is observed between attempts and during sleeps; an
//! attempt already in flight runs to completion.

use std::future::Future;
use std::time::Duration;

use stow_core::error::StowError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::RegistryResult;

/// Configuration for exponential backoff retry logic
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before the given retry (1-based): `initial * multiplier^(retry-1)`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

/// Run `operation` until it succeeds, fails terminally, runs out of
/// attempts, or `cancel` fires.
///
/// Makes at most `max_retries + 1` attempts. Exhaustion returns
/// [`StowError::RetriesExhausted`] wrapping the last error.
pub async fn retry<F, Fut, T>(
    cancel: &CancellationToken,
    config: &RetryConfig,
    mut operation: F,
) -> RegistryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RegistryResult<T>>,
{
    let attempts = config.max_retries.saturating_add(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(StowError::Cancelled);
        }

        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) if !error.is_retryable() => {
                debug!(attempt, error = %error, "Terminal error, not retrying");
                return Err(error);
            }
            Err(error) => {
                if attempt == attempts {
                    last_error = Some(error);
                    break;
                }

                let delay = config.delay_for(attempt);
                warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient error, retrying"
                );
                last_error = Some(error);

                tokio::select! {
                    _ = cancel.cancelled() => return Err(StowError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    Err(StowError::RetriesExhausted {
        attempts,
        source: Box::new(last_error.unwrap_or_else(|| StowError::Network {
            message: "Retry operation failed without error".to_string(),
            source: None,
        })),
    })
}
