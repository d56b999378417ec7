//! Retry with exponential backoff for remote embedding calls.
//!
//! Page fetches are not retried here — the crawl's own retry budget covers
//! them. This layer exists for embedding providers, whose transient
//! failures (rate limits, flaky connections) would otherwise error whole
//! pages.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;

/// Backoff parameters: `base · 2^attempt + random·base`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts beyond the first.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// A failed attempt, annotated with whether it is worth retrying and an
/// optional server-provided `Retry-After` hint.
#[derive(Debug)]
pub struct AttemptError {
    pub error: anyhow::Error,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
}

impl AttemptError {
    pub fn fatal(error: anyhow::Error) -> Self {
        Self {
            error,
            retryable: false,
            retry_after: None,
        }
    }

    pub fn transient(error: anyhow::Error) -> Self {
        Self {
            error,
            retryable: true,
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

/// Error messages that indicate a transient network condition.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["timeout", "timed out", "connection reset", "connection refused", "socket hang up", "fetch failed"]
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// Statuses worth retrying: rate limiting and server-side failures.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Run `op` until it succeeds, fails fatally, or exhausts the retry budget.
pub async fn retry<T, Fut>(policy: &RetryPolicy, mut op: impl FnMut() -> Fut) -> Result<T>
where
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(failed) => {
                if !failed.retryable || attempt >= policy.max_retries {
                    return Err(failed.error);
                }
                let delay = backoff_delay(policy, attempt, failed.retry_after);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn backoff_delay(policy: &RetryPolicy, attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(hint) = retry_after {
        if hint < policy.max_delay {
            return hint;
        }
    }
    let exp = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt));
    let jitter = policy.base_delay.mul_f64(rand::random::<f64>());
    (exp + jitter).min(policy.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn transient_patterns() {
        assert!(is_transient_message("request timed out after 30s"));
        assert!(is_transient_message("Connection reset by peer"));
        assert!(is_transient_message("connect ECONNREFUSED: connection refused"));
        assert!(!is_transient_message("invalid api key"));
    }

    #[test]
    fn retryable_statuses() {
        for status in [429u16, 500, 502, 503, 504] {
            assert!(is_retryable_status(status));
        }
        for status in [400u16, 401, 403, 404, 418] {
            assert!(!is_retryable_status(status));
        }
    }

    #[test]
    fn backoff_respects_retry_after_and_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
        };
        let hinted = backoff_delay(&policy, 0, Some(Duration::from_millis(250)));
        assert_eq!(hinted, Duration::from_millis(250));

        // A hint at or above the cap falls back to exponential backoff.
        let capped = backoff_delay(&policy, 10, Some(Duration::from_secs(60)));
        assert!(capped <= Duration::from_millis(800));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let calls = AtomicU32::new(0);
        let result: Result<u32> = retry(&policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AttemptError::transient(anyhow::anyhow!("timeout")))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AttemptError::fatal(anyhow::anyhow!("bad auth"))) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_last_error() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AttemptError::transient(anyhow::anyhow!("connection reset"))) }
        })
        .await;
        assert!(result.unwrap_err().to_string().contains("connection reset"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
