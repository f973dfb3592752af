//! Client-side retries of whole operations.
//!
//! The pipeline already retries individual publishes and reconnects on its
//! own. [`retry_with_backoff`] covers what lies outside it: an application
//! that wants, say, a registration retried end to end.

use std::{future::Future, time::Duration};

use tokio::time::Instant;
use tracing::{debug, info};

use crate::{backoff::BackoffPolicy, error::ErrorClass};

/// Errors that know whether they are worth retrying.
///
/// Implementations defer to [`crate::PipelineError::class`] so there is one
/// table deciding what is transient.
pub trait Classify {
    /// Transient or fatal.
    fn class(&self) -> ErrorClass;
}

impl Classify for crate::error::PipelineError {
    fn class(&self) -> ErrorClass { Self::class(self) }
}

/// Run `operation` until it succeeds, fails fatally or the policy's
/// `failure_timeout` has passed since the first attempt.
///
/// Retry `n` waits `policy.jittered_delay(n)`, so with the default policy the
/// first retry is immediate. The last error is returned when retrying stops.
///
/// # Errors
///
/// Returns the first fatal error, or the last transient one once the budget is
/// spent.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// use hubwire::{PipelineError, backoff::BackoffPolicy, retry::retry_with_backoff};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let calls = AtomicU32::new(0);
/// let result = retry_with_backoff(&BackoffPolicy::default(), || async {
///     if calls.fetch_add(1, Ordering::SeqCst) == 0 {
///         Err(PipelineError::ConnectionDropped("reset".into()))
///     } else {
///         Ok("done")
///     }
/// })
/// .await;
/// assert_eq!(result.expect("second attempt succeeds"), "done");
/// assert_eq!(calls.load(Ordering::SeqCst), 2);
/// # }
/// ```
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &BackoffPolicy, mut operation: F) -> Result<T, E>
where
    E: Classify + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if err.class() == ErrorClass::Fatal {
            debug!(error = %err, "fatal error; not retrying");
            return Err(err);
        }
        let delay = policy.jittered_delay(attempt);
        if !policy.within_budget(started.elapsed() + delay) {
            info!(error = %err, attempts = attempt + 1, "retry budget exhausted");
            return Err(err);
        }
        attempt += 1;
        crate::metrics::inc_retries();
        info!(error = %err, attempt, delay_ms = delay.as_millis(), "retrying");
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::PipelineError;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            failure_timeout: Duration::from_secs(10),
            jitter_up: 0.0,
            jitter_down: 0.0,
            ..BackoffPolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&policy(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::Unauthorized("bad token".into()))
        })
        .await;
        assert!(matches!(result, Err(PipelineError::Unauthorized(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_until_the_budget_runs_out() {
        let started = Instant::now();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&policy(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::ConnectionDropped("reset".into()))
        })
        .await;
        assert!(matches!(result, Err(PipelineError::ConnectionDropped(_))));
        // Immediate retry, then 1 s, 2 s and 4 s; another 4 s would pass 10 s.
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn first_retry_is_immediate() {
        let started = Instant::now();
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&policy(), || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(PipelineError::OperationTimeout("slow".into())),
                _ => Ok(7),
            }
        })
        .await;
        assert_eq!(result.expect("retry succeeds"), 7);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
