//! Backoff for non-streaming calls
//!
//! `create`, `retrieve`, `cancel` and `delete` may be retried on transient
//! failures when [`ClientOptions::retry`](crate::ClientOptions) is set.
//! Streams are never retried: a stream that fails part-way has already
//! published snapshots.
//!
//! ```text
//! attempt 0 ──✗──► sleep(initial) ──► attempt 1 ──✗──► sleep(initial × m) ──► ...
//!            │                                   │
//!            └─ permanent error: returned as is  └─ success: returned
//! ```
//!
//! # Examples
//!
//! ```rust,no_run
//! use responses_stream::retry::{retry_with_backoff, RetryConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RetryConfig::default()
//!     .with_max_attempts(3)
//!     .with_initial_delay(Duration::from_millis(250));
//!
//! let id = retry_with_backoff(config, || async {
//!     Ok::<_, responses_stream::Error>("resp_1".to_string())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Service error codes that stay failed however often they are retried.
const PERMANENT_CODES: &[&str] = &["insufficient_quota", "invalid_api_key", "billing_hard_limit_reached"];

/// Backoff policy
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Growth factor applied per attempt
    pub backoff_multiplier: f64,

    /// Fraction of the delay randomised around its nominal value (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait after the failed attempt number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.min(32) as i32);
        let nominal = Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()));

        if self.jitter_factor == 0.0 {
            return nominal;
        }

        // Uniform in [1 - j/2, 1 + j/2]
        let spread = self.jitter_factor * (rand::random::<f64>() - 0.5);
        nominal.mul_f64((1.0 + spread).max(0.0))
    }
}

/// Whether retrying `error` may produce a different outcome.
///
/// Connection failures, idle timeouts and the statuses 408, 409, 429 and 5xx
/// are transient, unless the service error code marks the failure as
/// permanent (an exhausted quota also arrives as 429).
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Network(e) => e.status().is_none_or(|status| is_transient_status(status.as_u16())),
        Error::Timeout => true,
        Error::Http { status, .. } => is_transient_status(*status),
        Error::Api { status, error } => {
            let permanent = error
                .code
                .as_deref()
                .is_some_and(|code| PERMANENT_CODES.contains(&code));
            !permanent && is_transient_status(*status)
        }
        _ => false,
    }
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 429 | 500..=599)
}

/// Runs `operation` until it succeeds, `should_retry` rejects the error, or
/// the attempts run out. The last error is returned.
pub async fn retry_if<F, Fut, T, P>(config: RetryConfig, should_retry: P, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        attempt += 1;
        if attempt >= attempts || !should_retry(&err) {
            return Err(err);
        }

        let delay = config.delay_for(attempt - 1);
        log::debug!(
            "attempt {}/{} failed ({}); retrying in {:?}",
            attempt,
            attempts,
            err,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}

/// Retries every error.
pub async fn retry_with_backoff<F, Fut, T>(config: RetryConfig, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(config, |_| true, operation).await
}

/// Retries only errors accepted by [`is_retryable_error`].
pub async fn retry_with_backoff_conditional<F, Fut, T>(config: RetryConfig, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(config, is_retryable_error, operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig::default()
            .with_initial_delay(Duration::from_millis(2))
            .with_jitter_factor(0.0)
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let config = RetryConfig::default()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(3))
            .with_jitter_factor(0.0);

        assert_eq!(config.delay_for(0), Duration::from_secs(1));
        assert_eq!(config.delay_for(1), Duration::from_secs(2));
        assert_eq!(config.delay_for(2), Duration::from_secs(3));
        assert_eq!(config.delay_for(40), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::default()
            .with_initial_delay(Duration::from_secs(10))
            .with_jitter_factor(0.5);

        for _ in 0..100 {
            let delay = config.delay_for(0);
            assert!(delay >= Duration::from_millis(7500), "{:?}", delay);
            assert!(delay <= Duration::from_millis(12500), "{:?}", delay);
        }
    }

    #[test]
    fn test_builder_clamps() {
        let config = RetryConfig::default()
            .with_max_attempts(0)
            .with_backoff_multiplier(0.5)
            .with_jitter_factor(4.0);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.backoff_multiplier, 1.0);
        assert_eq!(config.jitter_factor, 1.0);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = retry_with_backoff_conditional(fast().with_max_attempts(3), move || {
            let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if count < 3 {
                    Err(Error::from_status(503, "unavailable"))
                } else {
                    Ok("resp_1")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "resp_1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = retry_with_backoff_conditional(fast().with_max_attempts(4), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::from_status(400, "bad request")) }
        })
        .await;

        assert!(matches!(result, Err(Error::Http { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted_returns_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = retry_with_backoff(fast().with_max_attempts(2), move || {
            let count = counter.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(Error::stream_decoding(format!("attempt {}", count))) }
        })
        .await;

        assert!(matches!(result, Err(Error::StreamDecoding(ref m)) if m == "attempt 1"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_is_retryable_error() {
        assert!(is_retryable_error(&Error::timeout()));
        assert!(is_retryable_error(&Error::from_status(500, "oops")));
        assert!(is_retryable_error(&Error::from_status(408, "timeout")));
        assert!(is_retryable_error(&Error::from_status(
            429,
            r#"{"error":{"message":"Rate limit reached","code":"rate_limit_exceeded"}}"#
        )));
        assert!(!is_retryable_error(&Error::from_status(
            429,
            r#"{"error":{"message":"You exceeded your current quota","code":"insufficient_quota"}}"#
        )));
        assert!(!is_retryable_error(&Error::from_status(401, "unauthorized")));
        assert!(!is_retryable_error(&Error::config("bad")));
        assert!(!is_retryable_error(&Error::stream_decoding("bad frame")));
        assert!(!is_retryable_error(&Error::SessionClosed));
    }
}
