//! Backoff for remote metadata calls.
//!
//! Retries happen only inside a single pass. Between passes the cycle
//! interval is the only backoff, so delays here stay short.

use crate::config::NetworkDefaults;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How often and how patiently a remote call is repeated.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first one. Never less than 1.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: NetworkDefaults::MAX_ATTEMPTS,
            base_delay: NetworkDefaults::RETRY_BASE_DELAY,
            max_delay: NetworkDefaults::RETRY_MAX_DELAY,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after failed attempt number `failed` (0 for the first failure).
    pub fn delay_after(&self, failed: u32) -> Duration {
        let doubled = self
            .base_delay
            .checked_mul(1u32.checked_shl(failed).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay);
        let capped = doubled.min(self.max_delay);
        if !self.jitter {
            return capped;
        }
        let factor: f64 = rand::rng().random_range(0.5..1.5);
        capped.mul_f64(factor).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or `max_attempts` is used up. The last error is returned.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut waited = Duration::ZERO;
    let mut failed = 0;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if failed > 0 {
                    debug!(
                        operation = operation_name,
                        attempts = failed + 1,
                        waited_ms = waited.as_millis() as u64,
                        "Remote call recovered"
                    );
                }
                return Ok(value);
            }
            Err(e) => e,
        };
        failed += 1;

        if !should_retry(&error) {
            debug!(operation = operation_name, error = %error, "Remote call failed; not retrying");
            return Err(error);
        }
        if failed >= max_attempts {
            warn!(
                operation = operation_name,
                attempts = failed,
                waited_ms = waited.as_millis() as u64,
                error = %error,
                "Remote call failed; attempts exhausted"
            );
            return Err(error);
        }

        let delay = config.delay_after(failed - 1);
        warn!(
            operation = operation_name,
            attempt = failed,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Remote call failed; retrying"
        );
        tokio::time::sleep(delay).await;
        waited += delay;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(attempts)
            .with_base_delay(Duration::from_millis(5))
            .with_jitter(false)
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(false);

        assert_eq!(config.delay_after(0), Duration::from_secs(1));
        assert_eq!(config.delay_after(1), Duration::from_secs(2));
        assert_eq!(config.delay_after(2), Duration::from_secs(4));
        assert_eq!(config.delay_after(3), Duration::from_secs(5));
        assert_eq!(config.delay_after(40), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(2))
            .with_max_delay(Duration::from_secs(60));

        for _ in 0..20 {
            let delay = config.delay_after(0);
            assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3));
        }
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_async(
            &fast(3),
            "LISTSTATUS /models",
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("connection reset".to_string())
                } else {
                    Ok(42)
                }
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_async(
            &fast(2),
            "LISTSTATUS /models",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>("namenode down".to_string())
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(result.unwrap_err(), "namenode down");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_async(
            &fast(3),
            "GETFILESTATUS /models",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>("not found".to_string())
            },
            |e: &String| !e.contains("not found"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
