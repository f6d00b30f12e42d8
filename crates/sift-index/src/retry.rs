//! Bounded retry with exponential backoff and a per-attempt timeout.

use std::fmt;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Applied to each attempt separately.
    pub timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum RetryError<E> {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Failed(E),
}

/// Run `op` until it succeeds or `policy.max_attempts` attempts are used up. The delay
/// doubles after every failed attempt. Returns the last failure.
pub(crate) async fn with_retry<T, E, F, Fut>(
    what: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let failure = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => RetryError::Failed(e),
            Err(_) => RetryError::Timeout(policy.timeout),
        };
        if attempt >= attempts {
            return Err(failure);
        }
        let delay = policy.base_delay.saturating_mul(2u32.saturating_pow(attempt - 1));
        tracing::warn!(what, attempt, error = %failure, ?delay, "retrying");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, RetryError<String>> = with_retry("op", policy(3), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Err(format!("fail {n}")) } else { Ok(n) }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_last_error_when_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<String>> = with_retry("op", policy(2), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("fail {n}"))
        })
        .await;
        assert!(matches!(result, Err(RetryError::Failed(ref e)) if e == "fail 2"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_attempts_time_out() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(10),
        };
        let result: Result<(), RetryError<String>> = with_retry("op", policy, || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(RetryError::Timeout(_))));
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let _: Result<(), RetryError<String>> = with_retry("op", policy(0), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("no".to_owned())
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
