//! Call-site retries for transient store failures.

use std::future::Future;

use narrate_core::BackoffPolicy;
use tracing::warn;

use crate::store::StoreError;

/// Run `op`, retrying `StoreError::Unavailable` per `policy`.
///
/// Any other error returns immediately. When the budget runs out the last
/// `Unavailable` is returned, which converts to `PipelineError::StorageUnavailable`.
pub async fn with_store_retry<T, F, Fut>(
    policy: &BackoffPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_transient() && policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient store error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy::fixed(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn recovers_from_transient_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = with_store_retry(&fast(3), "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Unavailable("down".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), _> = with_store_retry(&fast(2), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("down".into()))
        })
        .await;
        assert!(matches!(out, Err(StoreError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), _> = with_store_retry(&fast(5), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Storage("corrupt".into()))
        })
        .await;
        assert!(matches!(out, Err(StoreError::Storage(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
