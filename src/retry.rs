//! Retry with exponential backoff and cancellation-aware waits.

use std::future::Future;
use std::time::Duration;

use rand::Rng as _;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Transient failure, worth another attempt.
    Retry,
    /// Permanent failure, give up immediately.
    Abort,
}

/// Error types that drive the retry loop.
pub trait RetryableError {
    fn retry_action(&self) -> RetryAction;

    /// Server-suggested wait that overrides the computed backoff
    /// (e.g. a Retry-After header).
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// The error reported when the caller's cancellation fires.
    fn cancelled() -> Self;
}

/// Retry policy knobs.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Random extra delay added to each backoff, against thundering herds.
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_jitter: Duration::from_millis(500),
        }
    }
}

/// Backoff before the retry that follows attempt `attempt` (1-based):
/// `2^(attempt-1)` seconds plus jitter, exponent capped to keep waits sane.
pub fn delay_for_attempt(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6);
    let base = Duration::from_secs(1u64 << exponent);
    let jitter_ms = config.max_jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

/// Run `operation` until it succeeds, aborts, exhausts `max_attempts`, or
/// the token is cancelled. Cancellation is honored before each attempt and
/// immediately mid-wait.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let mut attempt = 1u32;
    loop {
        if cancel.is_cancelled() {
            return Err(E::cancelled());
        }

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if attempt >= config.max_attempts {
            return Err(err);
        }
        if let RetryAction::Abort = err.retry_action() {
            return Err(err);
        }

        let delay = err
            .retry_after()
            .unwrap_or_else(|| delay_for_attempt(config, attempt));
        warn!(
            attempt,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, backing off"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(E::cancelled()),
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transient,
        Permanent,
        Cancelled,
        Throttled(Duration),
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl RetryableError for TestError {
        fn retry_action(&self) -> RetryAction {
            match self {
                Self::Transient | Self::Throttled(_) => RetryAction::Retry,
                Self::Permanent | Self::Cancelled => RetryAction::Abort,
            }
        }

        fn retry_after(&self) -> Option<Duration> {
            match self {
                Self::Throttled(d) => Some(*d),
                _ => None,
            }
        }

        fn cancelled() -> Self {
            Self::Cancelled
        }
    }

    fn config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            max_jitter: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<u32, TestError> =
            retry_with_backoff(&config(), &CancellationToken::new(), move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_to_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<u32, TestError> =
            retry_with_backoff(&config(), &CancellationToken::new(), move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Transient)
                }
            })
            .await;
        assert_eq!(result.unwrap_err(), TestError::Transient);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<u32, TestError> =
            retry_with_backoff(&config(), &CancellationToken::new(), move || {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError::Transient)
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_aborts_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<u32, TestError> =
            retry_with_backoff(&config(), &CancellationToken::new(), move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Permanent)
                }
            })
            .await;
        assert_eq!(result.unwrap_err(), TestError::Permanent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let cfg = config();
        assert_eq!(delay_for_attempt(&cfg, 1), Duration::from_secs(1));
        assert_eq!(delay_for_attempt(&cfg, 2), Duration::from_secs(2));
        assert_eq!(delay_for_attempt(&cfg, 3), Duration::from_secs(4));
        // Exponent is capped.
        assert_eq!(delay_for_attempt(&cfg, 40), Duration::from_secs(64));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let cfg = RetryConfig {
            max_attempts: 3,
            max_jitter: Duration::from_millis(500),
        };
        for _ in 0..50 {
            let d = delay_for_attempt(&cfg, 1);
            assert!(d >= Duration::from_secs(1));
            assert!(d <= Duration::from_millis(1500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_backoff() {
        let start = tokio::time::Instant::now();
        let result: Result<u32, TestError> = retry_with_backoff(
            &RetryConfig {
                max_attempts: 2,
                max_jitter: Duration::ZERO,
            },
            &CancellationToken::new(),
            || async { Err(TestError::Throttled(Duration::from_secs(30))) },
        )
        .await;
        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<u32, TestError> = retry_with_backoff(&config(), &token, move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            }
        })
        .await;
        assert_eq!(result.unwrap_err(), TestError::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff_wait() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result: Result<u32, TestError> =
            retry_with_backoff(&config(), &token, || async { Err(TestError::Transient) }).await;
        assert_eq!(result.unwrap_err(), TestError::Cancelled);
    }
}
