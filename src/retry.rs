// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry with Exponential Backoff
//!
//! Retries a fallible async operation while its error is classified as
//! retryable, sleeping `base_delay * 2^attempt` plus a random jitter between
//! attempts.

use std::{fmt::Display, future::Future, time::Duration};
use tokio::time::sleep;
use tracing::{error, warn};

/// Bounds and pacing of [`retry_with_backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound of the uniform jitter added to every delay.
    pub max_jitter: Duration,
}

impl RetryPolicy {
    /// Creates a policy with one second of maximum jitter.
    ///
    /// # Parameters
    /// * `max_retries` - Attempts allowed after the first one
    /// * `base_delay` - Delay before the first retry, doubled for each next one
    pub fn new(max_retries: u32, base_delay: Duration) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay,
            max_jitter: Duration::from_secs(1),
        }
    }

    /// Delay before retry number `attempt` (zero-based), without jitter.
    pub fn backoff_floor(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    fn delay(&self, attempt: u32) -> Duration {
        let jitter = self.max_jitter.mul_f64(rand::random::<f64>());
        self.backoff_floor(attempt).saturating_add(jitter)
    }
}

/// Runs `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or `policy.max_retries` retries have been spent. The last error
/// is returned unchanged.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !is_retryable(&err) => return Err(err),
            Err(err) if attempt >= policy.max_retries => {
                error!(
                    error = err.to_string(),
                    retries = policy.max_retries,
                    "max retry reached, returning the last error"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay(attempt);
                warn!(
                    error = err.to_string(),
                    attempt = attempt + 1,
                    "operation failed, retrying in {:?}",
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
