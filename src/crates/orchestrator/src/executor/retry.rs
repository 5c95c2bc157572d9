//! Backoff policy and failure classification
//!
//! `RetryConfig` drives two things: local retries of transient cache
//! failures inside the persistence layer, and the delay before a step the
//! Observer chose to retry is run again. `classify_failure` turns a raw
//! executor error message into a [`FailureClass`] when the executor did not
//! provide one.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::model::FailureClass;

/// Retry strategy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,

    /// Multiplier for exponential backoff (typically 2.0)
    pub backoff_multiplier: f64,

    /// Whether to add random jitter to backoff delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with custom max retries
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_initial_backoff(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    pub fn with_max_backoff(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate backoff delay for a given attempt (0-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms =
            (self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent)) as u64;

        let delay_ms = delay_ms.min(self.max_backoff_ms);

        let delay_ms = if self.jitter {
            // Up to 25% extra
            let jitter_amount = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms + jitter_amount
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms)
    }
}

/// Classify a raw executor error message
///
/// Server-side and rate-limit errors are transient, deadline errors are
/// timeouts, missing executors or services are unavailability, and anything
/// else (including 4xx) is permanent.
pub fn classify_failure(message: &str) -> FailureClass {
    let msg = message.to_lowercase();

    if msg.contains("rate limit") || msg.contains("too many requests") || msg.contains("429") {
        return FailureClass::Transient;
    }

    if msg.contains("timeout") || msg.contains("timed out") || msg.contains("deadline exceeded") {
        return FailureClass::Timeout;
    }

    if msg.contains("503")
        || msg.contains("502")
        || msg.contains("bad gateway")
        || msg.contains("500")
        || msg.contains("internal server error")
    {
        return FailureClass::Transient;
    }

    if msg.contains("connection reset")
        || msg.contains("connection refused")
        || msg.contains("network")
        || msg.contains("dns")
    {
        return FailureClass::Transient;
    }

    if msg.contains("unavailable")
        || msg.contains("no executor")
        || msg.contains("not registered")
        || msg.contains("not found")
        || msg.contains("404")
    {
        return FailureClass::Unavailable;
    }

    FailureClass::Permanent
}

/// Run `f` until it succeeds, a non-transient error occurs, or retries run out
///
/// `is_transient` decides which errors are worth another attempt.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_transient: P,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                debug!(
                    operation = operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed"
                );

                if !is_transient(&e) {
                    return Err(e);
                }

                if attempt >= config.max_retries {
                    error!(
                        operation = operation_name,
                        max_retries = config.max_retries,
                        error = %e,
                        "All retry attempts exhausted"
                    );
                    return Err(e);
                }

                let delay = config.backoff_delay(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Transient error, will retry after delay"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_config_builder() {
        let config = RetryConfig::new(5)
            .with_initial_backoff(500)
            .with_max_backoff(30_000)
            .with_multiplier(1.5)
            .with_jitter(false);

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.initial_backoff_ms, 500);
        assert_eq!(config.max_backoff_ms, 30_000);
        assert_eq!(config.backoff_multiplier, 1.5);
        assert!(!config.jitter);
    }

    #[test]
    fn test_backoff_delay_exponential_and_capped() {
        let config = RetryConfig::new(10)
            .with_initial_backoff(1000)
            .with_max_backoff(5000)
            .with_jitter(false);

        assert_eq!(config.backoff_delay(0).as_millis(), 1000);
        assert_eq!(config.backoff_delay(1).as_millis(), 2000);
        assert_eq!(config.backoff_delay(2).as_millis(), 4000);
        assert_eq!(config.backoff_delay(5).as_millis(), 5000);
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let config = RetryConfig::new(1).with_initial_backoff(1000);
        for _ in 0..20 {
            let ms = config.backoff_delay(0).as_millis();
            assert!((1000..=1250).contains(&ms));
        }
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(classify_failure("Rate limit exceeded (429)"), FailureClass::Transient);
        assert_eq!(classify_failure("503 Service Unavailable"), FailureClass::Transient);
        assert_eq!(classify_failure("Connection refused"), FailureClass::Transient);
        assert_eq!(classify_failure("request timed out"), FailureClass::Timeout);
        assert_eq!(classify_failure("CRM integration unavailable"), FailureClass::Unavailable);
        assert_eq!(
            classify_failure("no executor registered for agent type 'crm'"),
            FailureClass::Unavailable
        );
        assert_eq!(classify_failure("401 Unauthorized"), FailureClass::Permanent);
        assert_eq!(classify_failure("malformed input"), FailureClass::Permanent);
    }

    #[tokio::test]
    async fn test_retry_success_after_transient_errors() {
        let config = RetryConfig::new(3).with_initial_backoff(1).with_jitter(false);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&attempts);
        let result: Result<u32, String> = retry_with_backoff(
            &config,
            "test_operation",
            |_| true,
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err("unavailable".to_string())
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_transient_error() {
        let config = RetryConfig::new(3).with_initial_backoff(1);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&attempts);
        let result: Result<(), String> = retry_with_backoff(
            &config,
            "test_operation",
            |e: &String| e.contains("transient"),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("permanent".to_string())
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_all_attempts() {
        let config = RetryConfig::new(2).with_initial_backoff(1).with_jitter(false);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&attempts);
        let result: Result<(), String> = retry_with_backoff(
            &config,
            "test_operation",
            |_| true,
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("still down".to_string())
                }
            },
        )
        .await;

        assert!(result.is_err());
        // Initial attempt plus two retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
