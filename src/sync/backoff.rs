//! Retry with capped exponential backoff for transient upstream errors

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(250),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// `min(2^n * base, cap)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out. Cancellation interrupts the backoff sleep.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> LedgerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(LedgerError::Cancelled);
            }
            match op().await {
                Ok(v) => return Ok(v),
                Err(LedgerError::UpstreamTransient(msg)) if attempt + 1 < self.max_attempts => {
                    let delay = self.delay(attempt);
                    tracing::debug!(call = label, attempt, delay_ms = delay.as_millis() as u64, error = %msg, "Upstream busy, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LedgerError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay(0), Duration::from_millis(250));
        assert_eq!(p.delay(3), Duration::from_secs(2));
        assert_eq!(p.delay(7), Duration::from_secs(30));
        assert_eq!(p.delay(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = fast(5)
            .run("list_orders", &CancellationToken::new(), || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LedgerError::UpstreamTransient("error_busy".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_and_skips_terminal() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = fast(3)
            .run("escrow", &CancellationToken::new(), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LedgerError::UpstreamTransient("-1".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UpstreamTransient(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        calls.store(0, Ordering::SeqCst);
        let err = fast(3)
            .run("refresh", &CancellationToken::new(), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LedgerError::UpstreamTerminal("invalid_refresh_token".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UpstreamTerminal(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fast(3)
            .run("orders", &cancel, || async { Ok::<_, LedgerError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Cancelled));
    }
}
