// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential backoff for SoR chunks, webhook pushes and Redis calls.
//!
//! Two entry points:
//! - [`retry_when`]: asks the error ([`RetryHint`]) whether another attempt
//!   can help and folds a server `Retry-After` into the wait
//! - [`retry`]: treats every error as transient
//!
//! # Example
//!
//! ```
//! use batch_sync_engine::RetryConfig;
//! use std::time::Duration;
//!
//! let rl = RetryConfig::rate_limit();
//! assert_eq!(rl.max_retries, Some(4));
//! assert_eq!(rl.delay_for(0), Duration::from_millis(500));
//! assert_eq!(rl.delay_for(2), Duration::from_millis(2000));
//! assert_eq!(rl.delay_for(10), Duration::from_secs(8));
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// Backoff schedule. `max_retries` counts attempts, not retries: `Some(1)`
/// means a single try. `None` keeps going until success.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::rate_limit()
    }
}

impl RetryConfig {
    /// Connection setup: five tries over roughly three seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Single mirror command inside a request path.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
        }
    }

    /// SoR throttling: 4 attempts, 500ms doubling, capped at 8s.
    #[must_use]
    pub fn rate_limit() -> Self {
        Self {
            max_retries: Some(4),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Wait after failed attempt number `attempt` (0-based), capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }

    fn exhausted(&self, attempts: usize) -> bool {
        self.max_retries.is_some_and(|max| attempts >= max)
    }
}

/// Lets an error steer [`retry_when`].
pub trait RetryHint {
    fn is_retryable(&self) -> bool;

    /// Server-requested wait, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Retry retryable errors; return the first non-retryable one immediately.
///
/// Each wait is `max(backoff, retry_after)`, never above `max_delay`.
pub async fn retry_when<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display + RetryHint,
{
    let mut attempts = 0usize;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempts > 0 {
                    info!(operation = operation_name, retries = attempts, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => err,
        };

        let backoff = config.delay_for(attempts as u32);
        attempts += 1;
        if config.exhausted(attempts) {
            warn!(operation = operation_name, attempts, error = %err, "Retries exhausted");
            return Err(err);
        }

        let delay = err.retry_after().map_or(backoff, |hint| hint.max(backoff)).min(config.max_delay);
        warn!(
            operation = operation_name,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retryable failure, backing off"
        );
        sleep(delay).await;
    }
}

/// Every error counts as transient.
struct Transient<E>(E);

impl<E: fmt::Display> fmt::Display for Transient<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<E> RetryHint for Transient<E> {
    fn is_retryable(&self) -> bool {
        true
    }
}

/// [`retry_when`] for errors that carry no retry hint.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    retry_when(operation_name, config, || {
        let attempt = operation();
        async move { attempt.await.map_err(Transient) }
    })
    .await
    .map_err(|Transient(err)| err)
}
