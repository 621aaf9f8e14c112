//! Bounded retries with exponential backoff and jitter.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::freshness::InvalidPolicy;

/// Relative amount of jitter applied to every backoff delay.
const JITTER: f64 = 0.1;

/// How often and how patiently a failing operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRetryPolicy")]
pub struct RetryPolicy {
    max_attempts: u32,
    #[serde(with = "humantime_serde")]
    base_delay: Duration,
    #[serde(with = "humantime_serde")]
    max_delay: Duration,
}

#[derive(Deserialize)]
struct RawRetryPolicy {
    max_attempts: u32,
    #[serde(with = "humantime_serde")]
    base_delay: Duration,
    #[serde(with = "humantime_serde")]
    max_delay: Duration,
}

impl TryFrom<RawRetryPolicy> for RetryPolicy {
    type Error = InvalidPolicy;

    fn try_from(raw: RawRetryPolicy) -> Result<Self, Self::Error> {
        Self::new(raw.max_attempts, raw.base_delay, raw.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Result<Self, InvalidPolicy> {
        if max_attempts == 0 {
            return Err(InvalidPolicy::NoAttempts);
        }
        Ok(Self {
            max_attempts,
            base_delay,
            max_delay,
        })
    }

    /// A policy that performs exactly one attempt.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The delay after the failed `attempt`, for a jitter `factor` in `[-0.1, 0.1]`.
    ///
    /// This is `base * 2^(attempt - 1)`, moved by `factor` of itself, clamped to `[0, max_delay]`.
    fn backoff(&self, attempt: u32, factor: f64) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .as_secs_f64();
        let delay = exponential + exponential * factor;

        Duration::from_secs_f64(delay.clamp(0.0, self.max_delay.as_secs_f64()))
    }

    /// The jittered delay to wait after the failed `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = rand::rng().random_range(-JITTER..=JITTER);
        self.backoff(attempt, factor)
    }
}

/// The terminal outcome of [`run_with_retry`] when no attempt succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError<E> {
    /// The error was classified as permanent, further attempts were not made.
    #[error("non-retryable failure: {0}")]
    NonRetryable(E),
    /// Every permitted attempt failed, `cause` is the last error.
    #[error("failed after {attempts} attempts: {cause}")]
    ExhaustedRetries { attempts: u32, cause: E },
    /// The cancellation token fired before the operation finished.
    #[error("cancelled")]
    Cancelled,
}

/// Runs `producer` until it succeeds or the `policy` gives up.
///
/// `producer` is called with the 1-based attempt number. Between attempts, this sleeps for
/// [`RetryPolicy::delay_after`]. Both the sleep and a running attempt are aborted as soon as
/// `cancel` fires, which yields [`RetryError::Cancelled`].
///
/// The `operation` is used to tag metrics.
pub async fn run_with_retry<T, E, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    is_retryable: impl Fn(&E) -> bool,
    mut producer: F,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        metric!(counter("retry.attempt") += 1, "operation" => operation);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = producer(attempt) => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_retryable(&err) {
            return Err(RetryError::NonRetryable(err));
        }
        if attempt >= policy.max_attempts {
            metric!(counter("retry.exhausted") += 1, "operation" => operation);
            return Err(RetryError::ExhaustedRetries {
                attempts: attempt,
                cause: err,
            });
        }

        let delay = policy.delay_after(attempt);
        tracing::debug!(
            operation,
            attempt,
            ?delay,
            error = %err,
            "Attempt failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}
