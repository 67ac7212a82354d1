use crate::config::types::RetryPolicy;
use std::future::Future;
use std::time::Duration;

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// A non-transient error; returned on the attempt that produced it.
    Fatal(E),
    /// Every attempt in the budget failed transiently. Carries the last error.
    Exhausted { attempts: usize, last: E },
}

/// Errors produced by retried operations, so a timed-out attempt can be
/// expressed in the operation's own error type.
pub trait Retryable: std::fmt::Display {
    fn is_transient(&self) -> bool;
    fn timed_out(after: Duration) -> Self;
}

/// Run `operation` until it succeeds, fails fatally, or the policy's attempt
/// budget is spent. Each attempt is bounded by `policy.timeout`; the backoff
/// between attempts doubles up to `policy.max_backoff`.
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    component: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        attempts += 1;
        let result = match tokio::time::timeout(policy.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(policy.timeout)),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(RetryError::Fatal(e)),
            Err(e) => e,
        };

        if attempts >= max_attempts {
            tracing::error!(
                component,
                attempts,
                error = %err,
                "Retry budget exhausted"
            );
            return Err(RetryError::Exhausted { attempts, last: err });
        }

        tracing::warn!(
            component,
            attempt = attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Operation failed, retrying"
        );

        tokio::time::sleep(backoff).await;
        backoff = std::cmp::min(backoff * 2, policy.max_backoff);
    }
}
