//! Bounded retry with exponential backoff and jitter.
//!
//! Only *dispatch* is retried: a classifier decides whether a failure is
//! [`FailureClass::Transient`] (connection reset, timeout, refused) or
//! [`FailureClass::Permanent`]. A permanent failure stops after the attempt
//! that produced it; transient failures are retried until `max_attempts`
//! dispatches have been made, after which the last transient failure is
//! returned as [`RetryError::Exhausted`].

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::env::defaults;

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total dispatch attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap for any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor per attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Relative jitter, 0.1 = ±10%
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    defaults::MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    defaults::BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    defaults::MAX_DELAY_MS
}

fn default_multiplier() -> f64 {
    defaults::BACKOFF_MULTIPLIER
}

fn default_jitter() -> f64 {
    defaults::JITTER
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// A successful value and the number of dispatches it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryError<E> {
    /// Classifier said retrying cannot help
    #[error("permanent failure after {attempts} attempt(s): {error}")]
    Permanent { error: E, attempts: u32 },

    /// Every attempt failed transiently
    #[error("gave up after {attempts} attempt(s): {error}")]
    Exhausted { error: E, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Permanent { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn error(&self) -> &E {
        match self {
            Self::Permanent { error, .. } | Self::Exhausted { error, .. } => error,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            Self::Permanent { error, .. } | Self::Exhausted { error, .. } => error,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Disable jitter, mostly useful in tests asserting exact delays.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay to wait after attempt number `attempt` (1-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let base = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);

        // Add jitter
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * self.jitter.clamp(0.0, 1.0);
        let jittered = (base * (1.0 + jitter)).max(0.0);

        Duration::from_millis(jittered as u64).min(self.max_delay())
    }

    /// Retry a stateless operation.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, C>(&self, classify: C, mut op: F) -> Result<Attempted<T>, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureClass,
    {
        let ((), result) = self
            .run_with((), classify, |(), attempt| {
                let fut = op(attempt);
                async move { ((), fut.await) }
            })
            .await;
        result
    }

    /// Retry an operation that needs exclusive use of `state` per attempt.
    ///
    /// The state is moved into each attempt and handed back with its result,
    /// which lets an attempt hold a mutable resource (such as a connection
    /// guard) without borrowing across attempts. The state is returned to the
    /// caller whatever the outcome.
    pub async fn run_with<S, T, E, F, Fut, C>(
        &self,
        state: S,
        classify: C,
        mut op: F,
    ) -> (S, Result<Attempted<T>, RetryError<E>>)
    where
        F: FnMut(S, u32) -> Fut,
        Fut: Future<Output = (S, Result<T, E>)>,
        C: Fn(&E) -> FailureClass,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut state = state;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let (returned, result) = op(state, attempt).await;
            state = returned;

            let error = match result {
                Ok(value) => {
                    return (
                        state,
                        Ok(Attempted {
                            value,
                            attempts: attempt,
                        }),
                    );
                }
                Err(error) => error,
            };

            if classify(&error) == FailureClass::Permanent {
                return (
                    state,
                    Err(RetryError::Permanent {
                        error,
                        attempts: attempt,
                    }),
                );
            }

            if attempt >= max_attempts {
                return (
                    state,
                    Err(RetryError::Exhausted {
                        error,
                        attempts: attempt,
                    }),
                );
            }

            let delay = self.delay_for(attempt);
            debug!(
                "Attempt {}/{} failed transiently, retrying in {:?}",
                attempt, max_attempts, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Flaky,
        Fatal,
    }

    fn classify(e: &TestError) -> FailureClass {
        match e {
            TestError::Flaky => FailureClass::Transient,
            TestError::Fatal => FailureClass::Permanent,
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_transient_failures_use_every_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<Attempted<()>, _> = fast_policy(4)
            .run(classify, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Flaky) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                error: TestError::Flaky,
                attempts: 4
            })
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<Attempted<()>, _> = fast_policy(5)
            .run(classify, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Fatal) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().attempts(), 1);
    }

    #[tokio::test]
    async fn test_success_on_third_attempt() {
        let result = fast_policy(5)
            .run(classify, |attempt| async move {
                if attempt < 3 {
                    Err(TestError::Flaky)
                } else {
                    Ok(attempt * 10)
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, 30);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_run_with_threads_state() {
        let (log, result) = fast_policy(3)
            .run_with(Vec::new(), classify, |mut log: Vec<u32>, attempt| async move {
                log.push(attempt);
                let result = if attempt == 2 { Ok("done") } else { Err(TestError::Flaky) };
                (log, result)
            })
            .await;

        assert_eq!(log, vec![1, 2]);
        assert_eq!(result.unwrap().value, "done");
    }

    #[tokio::test]
    async fn test_zero_max_attempts_still_dispatches_once() {
        let calls = AtomicU32::new(0);
        let _ = fast_policy(0)
            .run(classify, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Flaky) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.1,
        };
        for _ in 0..200 {
            let delay = policy.delay_for(1).as_millis();
            assert!((900..=1_100).contains(&delay), "delay {delay} outside ±10%");
        }
    }

    #[test]
    fn test_policy_from_partial_toml() {
        let policy: RetryPolicy = toml::from_str("max_attempts = 7").unwrap();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.base_delay_ms, defaults::BASE_DELAY_MS);
        assert_eq!(policy.jitter, defaults::JITTER);
    }
}
