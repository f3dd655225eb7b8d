//! Bounded retry with exponential backoff and full jitter.
//!
//! Used for every remote call that the reconciler and the backup engine make.
//! Only errors classified as [`ErrorClass::Transient`] are retried; conflicts
//! and fatal errors return on the first attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Classify, ErrorClass};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one (default: 3).
    pub max_attempts: u32,
    /// Base backoff duration (default: 500ms).
    #[serde(with = "millis")]
    pub base_backoff: Duration,
    /// Maximum backoff duration (default: 30 seconds).
    #[serde(with = "millis")]
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Full jitter: sleep a uniform random duration in `[0, backoff]` (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A configuration that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// Operation succeeded.
    Success(T),
    /// Operation failed and will not be retried any further.
    Exhausted {
        /// The last error that occurred.
        last_error: E,
        /// Total number of attempts made.
        attempts: u32,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Convert into a plain `Result`, dropping the attempt count.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryOutcome::Success(v) => Ok(v),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

/// Executor for retried operations.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new RetryExecutor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The configuration this executor runs with.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, fails with a non-transient error,
    /// or the attempt budget is spent.
    ///
    /// `what` names the operation in log lines.
    pub async fn execute<F, Fut, T, E>(&self, what: &str, mut operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(what, attempt, "operation succeeded after retry");
                    }
                    return RetryOutcome::Success(value);
                }
                Err(e) => {
                    if e.class() != ErrorClass::Transient || attempt >= max_attempts {
                        return RetryOutcome::Exhausted {
                            last_error: e,
                            attempts: attempt,
                        };
                    }
                    let backoff = self.compute_backoff(attempt - 1);
                    warn!(
                        what,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Upper bound of the backoff before the given retry (0-based).
    ///
    /// `base_backoff * backoff_multiplier^retry`, capped at `max_backoff`.
    pub fn backoff_ceiling(&self, retry: u32) -> Duration {
        let base_ms = self.config.base_backoff.as_millis() as f64;
        let max_ms = self.config.max_backoff.as_millis() as f64;
        let computed = base_ms * self.config.backoff_multiplier.powi(retry as i32);
        Duration::from_millis(computed.min(max_ms) as u64)
    }

    fn compute_backoff(&self, retry: u32) -> Duration {
        let ceiling = self.backoff_ceiling(retry);
        if self.config.jitter {
            let ms = ceiling.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
        } else {
            ceiling
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(ErrorClass);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error ({})", self.0)
        }
    }

    impl Classify for TestError {
        fn class(&self) -> ErrorClass {
            self.0
        }
    }

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_backoff, Duration::from_millis(500));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
        assert_eq!(config.backoff_multiplier, 2.0);
        assert!(config.jitter);
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let executor = RetryExecutor::new(fast_config(3));
        let counter = Arc::new(AtomicU32::new(0));

        let outcome = executor
            .execute("op", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok::<_, TestError>("success")
                }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Success("success")));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_retry_success_after_transient_failures() {
        let executor = RetryExecutor::new(fast_config(3));
        let counter = Arc::new(AtomicU32::new(0));

        let outcome = executor
            .execute("op", || {
                let counter = Arc::clone(&counter);
                async move {
                    let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
                    if count < 3 {
                        Err(TestError(ErrorClass::Transient))
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Success("success")));
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted_after_max_attempts() {
        let executor = RetryExecutor::new(fast_config(3));
        let counter = Arc::new(AtomicU32::new(0));

        let outcome: RetryOutcome<(), TestError> = executor
            .execute("op", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(TestError(ErrorClass::Transient))
                }
            })
            .await;

        match outcome {
            RetryOutcome::Exhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.0, ErrorClass::Transient);
            }
            RetryOutcome::Success(_) => panic!("expected exhaustion"),
        }
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_fatal_not_retried() {
        let executor = RetryExecutor::new(fast_config(5));
        let counter = Arc::new(AtomicU32::new(0));

        let outcome: RetryOutcome<(), TestError> = executor
            .execute("op", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(TestError(ErrorClass::Fatal))
                }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 1, .. }));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_conflict_not_retried() {
        let executor = RetryExecutor::new(fast_config(5));
        let outcome: RetryOutcome<(), TestError> = executor
            .execute("op", || async { Err(TestError(ErrorClass::Conflict)) })
            .await;
        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.0, ErrorClass::Conflict);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_sleeps_with_jitter_bound() {
        let executor = RetryExecutor::default();
        let start = tokio::time::Instant::now();
        let outcome: RetryOutcome<(), TestError> = executor
            .execute("op", || async { Err(TestError(ErrorClass::Transient)) })
            .await;
        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 3, .. }));
        // two sleeps, at most 500ms + 1000ms
        assert!(start.elapsed() <= Duration::from_millis(1500));
    }

    #[test]
    fn test_backoff_ceiling() {
        let executor = RetryExecutor::new(RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        });
        assert_eq!(executor.backoff_ceiling(0), Duration::from_millis(500));
        assert_eq!(executor.backoff_ceiling(1), Duration::from_millis(1000));
        assert_eq!(executor.backoff_ceiling(2), Duration::from_millis(2000));
        assert_eq!(executor.backoff_ceiling(20), Duration::from_secs(30));
    }

    #[test]
    fn test_no_retry_config() {
        assert_eq!(RetryConfig::no_retry().max_attempts, 1);
    }

    #[test]
    fn test_config_deserializes_millis() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"max_attempts":5,"base_backoff":10,"jitter":false}"#)
                .unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_backoff, Duration::from_millis(10));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
        assert!(!config.jitter);
    }

    proptest::proptest! {
        #[test]
        fn prop_jittered_backoff_never_exceeds_ceiling(retry in 0u32..16) {
            let executor = RetryExecutor::default();
            let ceiling = executor.backoff_ceiling(retry);
            let sampled = executor.compute_backoff(retry);
            proptest::prop_assert!(sampled <= ceiling);
        }
    }
}
