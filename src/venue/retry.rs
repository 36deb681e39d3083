use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::VenueError;

/// Bounded retry policy for venue calls issued on behalf of dependent
/// orders (submit after a fill, cancel of an OCO sibling).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 250,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: base * 2^attempt, capped.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        self.base_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_backoff_ms)
    }
}

/// Run a venue call with bounded exponential backoff. Only retryable
/// errors are retried; the last error is returned after exhaustion.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, VenueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VenueError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.backoff_ms(attempt);
                debug!(
                    "{} attempt {}/{} failed: {}, retrying in {}ms",
                    what,
                    attempt + 1,
                    policy.max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };

        assert_eq!(policy.backoff_ms(0), 100);
        assert_eq!(policy.backoff_ms(1), 200);
        assert_eq!(policy.backoff_ms(2), 400);
        assert_eq!(policy.backoff_ms(3), 800);
        assert_eq!(policy.backoff_ms(4), 1_000);
        assert_eq!(policy.backoff_ms(30), 1_000);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        let calls = AtomicU32::new(0);

        let result = with_retry(&policy, "submit", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(VenueError::Transient("timeout".into()))
                } else {
                    Ok("pv-1".to_string())
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "pv-1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: Result<String, VenueError> = with_retry(&policy, "submit", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(VenueError::Rejected("market closed".into())) }
        })
        .await;

        assert!(matches!(result, Err(VenueError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        let calls = AtomicU32::new(0);

        let result: Result<String, VenueError> = with_retry(&policy, "cancel", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(VenueError::Transient("timeout".into())) }
        })
        .await;

        assert!(matches!(result, Err(VenueError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
