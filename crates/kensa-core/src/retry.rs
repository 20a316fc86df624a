use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::error::ModelError;

/// Outcome of a retried operation together with how many retries it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, ModelError>,
    pub retries: u32,
    /// Retrying stopped because the token was cancelled.
    pub interrupted: bool,
}

/// Execute a model call under `policy`.
///
/// Transient errors are retried with exponential backoff until
/// `max_attempts` calls have been made; anything else is returned at once.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, f: F) -> Attempted<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
{
    with_retry_until(policy, &CancellationToken::new(), f).await
}

/// Like [`with_retry`], but no further attempt starts once `cancel` fires.
///
/// The attempt in flight is left to finish; a pending backoff is cut short
/// and the last error is returned with `interrupted` set.
pub async fn with_retry_until<F, Fut, T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    f: F,
) -> Attempted<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut retries = 0;
    loop {
        let err = match f().await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    retries,
                    interrupted: false,
                };
            }
            Err(e) => e,
        };
        if !err.is_transient() || retries + 1 >= max_attempts {
            return Attempted {
                result: Err(err),
                retries,
                interrupted: false,
            };
        }
        if cancel.is_cancelled() {
            tracing::debug!(retries, "cancelled, not retrying: {err}");
            return Attempted {
                result: Err(err),
                retries,
                interrupted: true,
            };
        }

        let delay = policy.delay_for(retries + 1, err.retry_after_secs());
        tracing::warn!(
            retry = retries + 1,
            delay_ms = delay.as_millis() as u64,
            "transient model error, retrying: {err}"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return Attempted {
                    result: Err(err),
                    retries,
                    interrupted: true,
                };
            }
        }
        retries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_first_try() {
        let out = with_retry(&RetryPolicy::default(), || async { Ok(42) }).await;
        assert_eq!(out.result.unwrap(), 42);
        assert_eq!(out.retries, 0);
        assert!(!out.interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_failures() {
        let attempts = AtomicU32::new(0);
        let out = with_retry(&RetryPolicy::new(3), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ModelError::RateLimited {
                        retry_after_secs: None,
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(out.result.unwrap(), 42);
        assert_eq!(out.retries, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhausts_attempts() {
        let attempts = AtomicU32::new(0);
        let out: Attempted<i32> = with_retry(&RetryPolicy::new(3), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ModelError::Timeout("slow".into())) }
        })
        .await;

        assert!(matches!(out.result, Err(ModelError::Timeout(_))));
        assert_eq!(out.retries, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_error_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let out: Attempted<i32> = with_retry(&RetryPolicy::new(5), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ModelError::Auth("invalid key".into())) }
        })
        .await;

        assert!(matches!(out.result, Err(ModelError::Auth(_))));
        assert_eq!(out.retries, 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_policy_tries_once() {
        let attempts = AtomicU32::new(0);
        let out: Attempted<i32> = with_retry(&RetryPolicy::no_retry(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ModelError::ApiRequest("reset".into())) }
        })
        .await;

        assert!(out.result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_retry_after_cancellation() {
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let out: Attempted<i32> = with_retry_until(&RetryPolicy::new(3), &cancel, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            cancel.cancel();
            async {
                Err(ModelError::RateLimited {
                    retry_after_secs: None,
                })
            }
        })
        .await;

        assert!(matches!(out.result, Err(ModelError::RateLimited { .. })));
        assert!(out.interrupted);
        assert_eq!(out.retries, 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_backoff_short() {
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let policy = RetryPolicy::new(5).with_base_delay_ms(60_000);
        let out: Attempted<i32> = with_retry_until(&policy, &cancel, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ModelError::Timeout("slow".into())) }
        })
        .await;

        assert!(out.interrupted);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
