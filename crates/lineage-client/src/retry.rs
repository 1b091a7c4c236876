//! Bounded retry with exponential backoff

use crate::config::RetryConfig;
use crate::error::ClientResult;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        RetryPolicy {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Policy for idempotent read queries.
    pub fn reads(config: &RetryConfig) -> Self {
        Self::with_retries(config.read_retries, config)
    }

    /// Policy for mutations: at most one automatic retry.
    pub fn mutations(config: &RetryConfig) -> Self {
        Self::with_retries(config.mutation_retries.min(1), config)
    }

    fn with_retries(max_retries: u32, config: &RetryConfig) -> Self {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op`, retrying transient failures. Auth failures are returned immediately.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries && err.is_transient() && !err.is_auth() => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "{} failed ({}); retry {}/{} in {:?}",
                        label,
                        err,
                        attempt + 1,
                        self.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = fast(5);
        assert_eq!(policy.delay_for(0), Duration::from_millis(1));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2));
        assert_eq!(policy.delay_for(10), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = fast(3)
            .run("fetch", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ClientError::Network("reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: ClientResult<()> = fast(3)
            .run("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::Http { status: 401, code: None })
            })
            .await;
        assert!(result.unwrap_err().is_auth());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mutation_policy_caps_at_one_retry() {
        let config = RetryConfig {
            mutation_retries: 4,
            ..RetryConfig::default()
        };
        assert_eq!(RetryPolicy::mutations(&config).max_retries, 1);
    }
}
