//! Retry and timeout helpers shared by the client and the server.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Runs `operation` until it succeeds, fails with a non-retryable error or
/// exhausts `config.max_attempts`.
///
/// Waits [`RetryConfig::delay_for_attempt`] between attempts. Cancellation
/// is observed before every attempt and while waiting.
pub async fn retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    label: &str,
    mut operation: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < config.max_attempts => {
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                warn!(operation = label, attempt, ?delay, error = %e, "retrying after transient failure");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Fails with [`SyncError::Timeout`] if `future` does not complete within
/// `timeout`.
pub async fn with_timeout<T, Fut>(timeout: Duration, future: Fut) -> SyncResult<T>
where
    Fut: Future<Output = SyncResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig::new(attempts)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let calls = &AtomicU32::new(0);
        let result = retry(&fast(3), &CancellationToken::new(), "test", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SyncError::transport_retryable("reset"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: SyncResult<()> = retry(&fast(2), &CancellationToken::new(), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Timeout)
        })
        .await;
        assert!(matches!(result, Err(SyncError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: SyncResult<()> = retry(&fast(5), &CancellationToken::new(), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::transport_fatal("bad request"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: SyncResult<()> = retry(&fast(3), &cancel, "test", || async { Ok(()) }).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn timeout_maps_to_sync_error() {
        let result: SyncResult<()> = with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(SyncError::Timeout)));
    }
}
