//! Bounded retry with exponential backoff.
//!
//! Every attempt runs under a timeout; a timed-out attempt counts as a
//! retryable failure. A wait requested by the provider (rate limiting) is
//! honoured up to `max_delay`.

use crate::error::{ProviderError, ProviderResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Limit for a single attempt.
    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// No retries, only the timeout.
    pub fn once(timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            timeout,
            ..Self::default()
        }
    }

    /// Wait before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error or the
    /// attempts are used up. `what` names the call in log messages.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.timeout)),
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !err.is_retryable() || attempt >= max_attempts {
                if attempt > 1 {
                    tracing::error!("{} failed after {} attempts: {}", what, attempt, err);
                }
                return Err(err);
            }
            let delay = match err.retry_hint() {
                Some(hint) => hint.min(self.max_delay),
                None => self.backoff(attempt),
            };
            tracing::warn!(
                "{} failed, retrying in {}ms (attempt {}/{}): {}",
                what,
                delay.as_millis(),
                attempt,
                max_attempts,
                err
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Serializes a `Duration` as integer milliseconds
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    /// Paused timers may round up to the next millisecond.
    fn assert_elapsed(start: Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(10),
            "{elapsed:?} vs {expected:?}"
        );
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(5), Duration::from_secs(1));
        assert_eq!(p.backoff(40), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();
        let c = Arc::clone(&calls);
        let result = policy()
            .run("pull", || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProviderError::Network("connection reset".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_elapsed(start, Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: ProviderResult<()> = policy()
            .run("push", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Network("offline".into())) }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: ProviderResult<()> = policy()
            .run("pull", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Auth("token expired".into())) }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hint_is_honoured_and_capped() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result = policy()
            .run("pull", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 => Err(ProviderError::RateLimited {
                            retry_after: Some(Duration::from_millis(700)),
                        }),
                        1 => Err(ProviderError::RateLimited {
                            retry_after: Some(Duration::from_secs(3600)),
                        }),
                        _ => Ok(()),
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        assert_elapsed(start, Duration::from_millis(1700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_retryable() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy {
            max_attempts: 2,
            timeout: Duration::from_secs(1),
            ..policy()
        };
        let result = p
            .run("pull", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                    Ok::<_, ProviderError>(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
    }
}
