//! kstage retry: run a flaky remote operation a bounded number of times,
//! stopping at the first failure the classifier calls fatal.
//!
//! Backoff is `min(base * attempt, cap)`: linear in the attempt number, capped.

#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

mod classify;

pub use classify::{always_fatal, always_transient, Classifier, FailureClass, PatternClassifier, FATAL_PATTERNS, TRANSIENT_PATTERNS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cap_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay: Duration::from_secs(5), cap_delay: Duration::from_secs(30) }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, cap_delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay, cap_delay }
    }

    /// Sleep after the failed `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.cap_delay)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// What one failed attempt produced: raw output plus an error description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptFailure {
    pub output: String,
    pub error: String,
}

impl AttemptFailure {
    pub fn new(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self { output: output.into(), error: error.into() }
    }

    pub fn from_error(e: impl fmt::Display) -> Self {
        Self { output: String::new(), error: e.to_string() }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.output.trim().is_empty() {
            f.write_str(&self.error)
        } else {
            write!(f, "{} (output: {})", self.error, self.output.trim())
        }
    }
}

/// Terminal failure of a retried step.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetryError {
    #[error("{step}: fatal error on attempt {attempt} of {max_attempts}: {last}")]
    Fatal { step: String, attempt: u32, max_attempts: u32, last: AttemptFailure },
    #[error("{step}: still failing after {attempts} attempts: {last}")]
    Exhausted { step: String, attempts: u32, last: AttemptFailure, history: Vec<String> },
}

impl RetryError {
    pub fn step(&self) -> &str {
        match self {
            RetryError::Fatal { step, .. } | RetryError::Exhausted { step, .. } => step,
        }
    }

    /// Attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempt, .. } => *attempt,
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn last(&self) -> &AttemptFailure {
        match self {
            RetryError::Fatal { last, .. } | RetryError::Exhausted { last, .. } => last,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RetryError::Fatal { .. })
    }
}

/// Runs one operation under a [`RetryPolicy`]. Attempt state lives only for one `run` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `op(attempt)` until it succeeds, a failure is classified fatal, or
    /// attempts run out. Every attempt performs the real call.
    pub async fn run<T, F, Fut>(&self, step: &str, classifier: &dyn Classifier, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptFailure>>,
    {
        let max = self.policy.attempts();
        let mut history = Vec::new();
        let mut attempt = 1u32;
        loop {
            counter!("retry_attempts_total", 1u64);
            let failure = match op(attempt).await {
                Ok(v) => {
                    if attempt > 1 {
                        debug!(step, attempt, "succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(f) => f,
            };

            match classifier.classify(&failure.output, &failure.error) {
                FailureClass::Fatal => {
                    counter!("retry_fatal_total", 1u64);
                    warn!(step, attempt, error = %failure.error, "fatal failure; not retrying");
                    return Err(RetryError::Fatal { step: step.to_string(), attempt, max_attempts: max, last: failure });
                }
                FailureClass::Transient if attempt >= max => {
                    counter!("retry_exhausted_total", 1u64);
                    history.push(format!("attempt {}: {}", attempt, failure.error));
                    warn!(step, attempts = attempt, error = %failure.error, "retries exhausted");
                    return Err(RetryError::Exhausted { step: step.to_string(), attempts: attempt, last: failure, history });
                }
                FailureClass::Transient => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        step,
                        attempt,
                        max_attempts = max,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.error,
                        "transient failure; backing off"
                    );
                    history.push(format!("attempt {}: {}", attempt, failure.error));
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn policy(max: u32) -> RetryPolicy {
        RetryPolicy::new(max, Duration::from_secs(2), Duration::from_secs(5))
    }

    #[test]
    fn delays_are_linear_and_capped() {
        let p = policy(10);
        let delays: Vec<_> = (1..=5).map(|a| p.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 5, 5, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_classifier_calls_operation_once() {
        let calls = AtomicU32::new(0);
        let exec = RetryExecutor::new(policy(7));
        let res: Result<(), _> = exec
            .run("apply", &always_fatal, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AttemptFailure::new("", "forbidden")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = res.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.attempts(), 1);
        assert!(err.to_string().contains("attempt 1 of 7"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_classifier_uses_every_attempt_with_growing_delays() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let exec = RetryExecutor::new(RetryPolicy::new(3, Duration::from_secs(3), Duration::from_secs(4)));
        let start = Instant::now();
        let s = stamps.clone();
        let res: Result<(), _> = exec
            .run("apply", &always_transient, move |attempt| {
                s.lock().unwrap().push(start.elapsed());
                async move { Err(AttemptFailure::new("out", format!("reset #{attempt}"))) }
            })
            .await;

        let stamps = stamps.lock().unwrap().clone();
        assert_eq!(stamps.len(), 3);
        let gaps: Vec<_> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps, vec![Duration::from_secs(3), Duration::from_secs(4)]);
        assert!(gaps.windows(2).all(|g| g[0] <= g[1]));

        match res.unwrap_err() {
            RetryError::Exhausted { attempts, last, history, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.error, "reset #3");
                assert_eq!(history.len(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let exec = RetryExecutor::new(policy(5));
        let classifier = PatternClassifier::default();
        let out = exec
            .run("apply", &classifier, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(AttemptFailure::new("", "read: connection reset by peer"))
                    } else {
                        Ok("applied")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, "applied");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let exec = RetryExecutor::new(RetryPolicy { max_attempts: 0, base_delay: Duration::ZERO, cap_delay: Duration::ZERO });
        let _ = exec
            .run("noop", &always_transient, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AttemptFailure::from_error("boom")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
