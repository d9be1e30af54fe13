//! Bounded retry with exponential backoff.
//!
//! One typed outcome for every caller: `Ok(value)` or a `RetryError` that
//! says whether the operation was abandoned immediately (fatal) or after the
//! attempt budget ran out. Sleeps go through the `Sleeper` trait so tests
//! never block on the wall clock.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// How an error should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Propagate immediately, consuming no further attempts and no sleep.
    Fatal,
    /// Retry after the standard backoff delay.
    Retryable,
    /// Retry with one extra backoff multiplier step. Used for rate-limited
    /// remote results, which need a slower recovery than plain server errors.
    RetryableSlow,
}

/// Is this HTTP status transient enough to retry even though the call
/// itself returned a response?
pub fn retryable_status(status: u16) -> bool {
    matches!(status, 500..=599 | 408 | 429)
}

/// Classify a transient HTTP status; `None` means the status is not a
/// retry trigger at all.
pub fn classify_status(status: u16) -> Option<ErrorClass> {
    match status {
        429 => Some(ErrorClass::RetryableSlow),
        500..=599 | 408 => Some(ErrorClass::Retryable),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("non-retryable: {0}")]
    Fatal(E),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// The underlying error, whichever way the loop ended.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    /// Budget for whole browser-automation attempts.
    pub const AUTOMATION: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_secs(2),
        backoff_factor: 2.0,
    };

    /// Budget for remote calls (spreadsheet sink).
    pub const REMOTE: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_secs(2),
        backoff_factor: 2.0,
    };

    /// Delay before the retry that follows `attempt` (1-based).
    fn delay(&self, attempt: u32, class: ErrorClass) -> Duration {
        let exp = match class {
            // One extra multiplier step for throttled remote results.
            ErrorClass::RetryableSlow => attempt,
            _ => attempt - 1,
        };
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp as i32);
        Duration::from_secs_f64(secs)
    }
}

/// Injectable sleep, so the backoff schedule is observable in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Run `op` up to `policy.max_attempts` times.
///
/// `classify` decides per error whether another attempt is worth it. Success
/// returns immediately with no extra delay; a fatal error propagates at once.
pub async fn retry<T, E, C, F, Fut>(
    policy: RetryPolicy,
    sleeper: &dyn Sleeper,
    classify: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    C: Fn(&E) -> ErrorClass,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                let class = classify(&e);
                if class == ErrorClass::Fatal {
                    return Err(RetryError::Fatal(e));
                }
                if attempt >= policy.max_attempts {
                    tracing::warn!(attempts = policy.max_attempts, error = %e, "retry budget exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: policy.max_attempts,
                        last: e,
                    });
                }
                let delay = policy.delay(attempt, class);
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, backing off"
                );
                sleeper.sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        fn new() -> Self {
            Self { slept: Mutex::new(Vec::new()) }
        }

        fn slept(&self) -> Vec<Duration> {
            self.slept.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt_with_backoff() {
        let sleeper = RecordingSleeper::new();
        let result = retry(policy(), &sleeper, |_: &String| ErrorClass::Retryable, |attempt| async move {
            if attempt < 3 {
                Err(format!("boom {attempt}"))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        // Exactly two sleeps: 2s then 4s
        assert_eq!(
            sleeper.slept(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[tokio::test]
    async fn test_fatal_propagates_without_sleeping() {
        let sleeper = RecordingSleeper::new();
        let result: Result<(), _> =
            retry(policy(), &sleeper, |_: &String| ErrorClass::Fatal, |_| async {
                Err("bad config".to_string())
            })
            .await;

        assert!(matches!(result, Err(RetryError::Fatal(_))));
        assert!(sleeper.slept().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_after_max_attempts() {
        let sleeper = RecordingSleeper::new();
        let result: Result<(), _> =
            retry(policy(), &sleeper, |_: &String| ErrorClass::Retryable, |a| async move {
                Err(format!("fail {a}"))
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "fail 3");
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        // No sleep after the final attempt
        assert_eq!(sleeper.slept().len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_uses_extra_backoff_step() {
        let sleeper = RecordingSleeper::new();
        let _result: Result<(), _> =
            retry(policy(), &sleeper, |_: &String| ErrorClass::RetryableSlow, |a| async move {
                Err(format!("throttled {a}"))
            })
            .await;

        // factor^attempt instead of factor^(attempt-1): 4s then 8s
        assert_eq!(
            sleeper.slept(),
            vec![Duration::from_secs(4), Duration::from_secs(8)]
        );
    }

    #[tokio::test]
    async fn test_success_on_first_attempt_sleeps_never() {
        let sleeper = RecordingSleeper::new();
        let result = retry(policy(), &sleeper, |_: &String| ErrorClass::Retryable, |_| async {
            Ok(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert!(sleeper.slept().is_empty());
    }

    #[test]
    fn test_status_classification() {
        assert!(retryable_status(500));
        assert!(retryable_status(503));
        assert!(retryable_status(429));
        assert!(retryable_status(408));
        assert!(!retryable_status(200));
        assert!(!retryable_status(401));
        assert!(!retryable_status(404));

        assert_eq!(classify_status(429), Some(ErrorClass::RetryableSlow));
        assert_eq!(classify_status(502), Some(ErrorClass::Retryable));
        assert_eq!(classify_status(404), None);
    }
}
