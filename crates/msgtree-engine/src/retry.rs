//! Bounded retry with exponential backoff for remote calls.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::{EngineError, RemoteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Used by tests.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_max_times((self.attempts() - 1) as usize)
    }
}

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// attempts run out. Exhaustion becomes [`EngineError::RemoteUnavailable`].
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: &'static str, call: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let result = call
        .retry(policy.backoff())
        .when(RemoteError::is_retryable)
        .notify(|e: &RemoteError, delay: Duration| {
            tracing::warn!(op, error = %e, delay_ms = delay.as_millis() as u64, "remote call failed, retrying");
        })
        .await;

    match result {
        Ok(value) => Ok(value),
        Err(e) if e.is_retryable() => {
            let attempts = policy.attempts();
            tracing::error!(op, attempts, error = %e, "remote call failed, giving up");
            Err(EngineError::RemoteUnavailable { attempts, source: e })
        }
        Err(e) => Err(EngineError::Remote(e)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = with_retry(&RetryPolicy::immediate(3), "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RemoteError::Timeout("slow".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_is_surfaced() {
        let err = with_retry(&RetryPolicy::immediate(2), "test", || async {
            Err::<(), _>(RemoteError::Unavailable("down".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::RemoteUnavailable { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = with_retry(&RetryPolicy::immediate(5), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(RemoteError::Rejected("nope".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Remote(RemoteError::Rejected(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        use backon::BackoffBuilder;

        let policy = RetryPolicy {
            attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        let delays: Vec<Duration> = policy.backoff().build().collect();
        assert_eq!(delays.len(), 9);
        assert_eq!(
            delays[..4],
            [
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
            ]
        );
    }
}
