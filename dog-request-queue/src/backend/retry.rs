use std::future::Future;

use tracing::warn;

use crate::{config::RetryPolicy, QueueResult};

/// Re-run `op` on retryable errors with bounded exponential backoff.
///
/// Only `StoreUnavailable` and `LockAcquisitionFailed` are retried; any other
/// error, and the last retryable one, is returned to the caller.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, what: &str, mut op: F) -> QueueResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = QueueResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                warn!("{} failed ({}), retry {}/{} in {:?}", what, e, attempt, max_attempts, delay);
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueueError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = with_retry(&policy(5), "op", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(QueueError::StoreUnavailable("connection reset".to_string()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: QueueResult<()> = with_retry(&policy(3), "op", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(QueueError::StoreUnavailable("down".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(QueueError::StoreUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: QueueResult<()> = with_retry(&policy(5), "op", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(QueueError::RequestNotFound("r1".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(QueueError::RequestNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
