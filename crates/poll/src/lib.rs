//! kstage poll: sample an external signal until it reports ready, reports a
//! terminal failure, or the deadline passes.
//!
//! The deadline is checked before every sample. A sleep that straddles the
//! deadline still completes, so one interval of overrun is expected.
//! There is no cancel signal; callers needing early abort wrap `wait`.

#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Ready,
    Pending,
    /// Will never become ready; stop polling.
    Failed,
}

/// One sample of the external signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub status: ProbeStatus,
    pub detail: String,
}

impl Probe {
    pub fn ready(detail: impl Into<String>) -> Self {
        Self { status: ProbeStatus::Ready, detail: detail.into() }
    }

    pub fn pending(detail: impl Into<String>) -> Self {
        Self { status: ProbeStatus::Pending, detail: detail.into() }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self { status: ProbeStatus::Failed, detail: detail.into() }
    }

    /// Boolean readiness flag.
    pub fn from_flag(ready: bool, detail: impl Into<String>) -> Self {
        if ready { Self::ready(detail) } else { Self::pending(detail) }
    }

    /// Phase string compared case-insensitively to a target and a failure value.
    pub fn from_phase(phase: &str, target: &str, failed: &str) -> Self {
        let detail = format!("phase={}", if phase.is_empty() { "<none>" } else { phase });
        if phase.eq_ignore_ascii_case(target) {
            Self::ready(detail)
        } else if phase.eq_ignore_ascii_case(failed) {
            Self::failed(detail)
        } else {
            Self::pending(detail)
        }
    }

    /// Ready once the resource no longer exists.
    pub fn from_existence(exists: bool, detail: impl Into<String>) -> Self {
        Self::from_flag(!exists, detail)
    }
}

/// Emitted once per non-terminal iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollProgress {
    pub iteration: u32,
    pub elapsed: Duration,
    pub remaining: Duration,
    pub timeout: Duration,
    pub percent: u8,
    pub detail: String,
}

impl PollProgress {
    fn new(iteration: u32, elapsed: Duration, timeout: Duration, detail: String) -> Self {
        let percent = if timeout.is_zero() {
            100
        } else {
            ((elapsed.as_secs_f64() / timeout.as_secs_f64()) * 100.0).min(100.0) as u8
        };
        Self { iteration, elapsed, remaining: timeout.saturating_sub(elapsed), timeout, percent, detail }
    }
}

impl fmt::Display for PollProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "check {} • {}s elapsed • {}s remaining ({}%) • {}",
            self.iteration,
            self.elapsed.as_secs(),
            self.remaining.as_secs(),
            self.percent,
            self.detail
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    pub iterations: u32,
    pub elapsed: Duration,
    pub detail: String,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PollError {
    #[error("{what}: timed out after {}s of {}s ({iterations} checks); last status: {last_status}", .elapsed.as_secs(), .timeout.as_secs())]
    TimedOut { what: String, elapsed: Duration, timeout: Duration, iterations: u32, last_status: String },
    #[error("{what}: terminal failure on check {iteration}: {status}")]
    Failed { what: String, iteration: u32, status: String },
}

impl PollError {
    pub fn last_status(&self) -> &str {
        match self {
            PollError::TimedOut { last_status, .. } => last_status,
            PollError::Failed { status, .. } => status,
        }
    }
}

type ProgressFn = Box<dyn Fn(&PollProgress) + Send + Sync>;

/// Deadline-bounded poller. `what` names the wait in logs and errors.
pub struct ReadinessPoller {
    what: String,
    deadline: Duration,
    interval: Duration,
    on_progress: Option<ProgressFn>,
}

impl ReadinessPoller {
    pub fn new(what: impl Into<String>, deadline: Duration, interval: Duration) -> Self {
        Self { what: what.into(), deadline, interval, on_progress: None }
    }

    /// Receive each progress record in addition to the `info!` event.
    pub fn with_progress(mut self, f: impl Fn(&PollProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn what(&self) -> &str {
        &self.what
    }

    pub async fn wait<F, Fut, E>(&self, mut sample: F) -> Result<PollOutcome, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Probe, E>>,
        E: fmt::Display,
    {
        let start = Instant::now();
        let mut iteration = 0u32;
        let mut last_status = String::from("not sampled");
        debug!(what = %self.what, timeout_secs = self.deadline.as_secs(), interval_secs = self.interval.as_secs(), "poll started");
        loop {
            let elapsed = start.elapsed();
            if elapsed > self.deadline {
                counter!("poll_timeouts_total", 1u64);
                warn!(what = %self.what, iterations = iteration, last = %last_status, "poll timed out");
                return Err(PollError::TimedOut {
                    what: self.what.clone(),
                    elapsed,
                    timeout: self.deadline,
                    iterations: iteration,
                    last_status,
                });
            }
            iteration += 1;
            counter!("poll_iterations_total", 1u64);
            match sample().await {
                Ok(p) => match p.status {
                    ProbeStatus::Ready => {
                        let elapsed = start.elapsed();
                        info!(what = %self.what, iterations = iteration, elapsed_secs = elapsed.as_secs(), "ready");
                        return Ok(PollOutcome { iterations: iteration, elapsed, detail: p.detail });
                    }
                    ProbeStatus::Failed => {
                        warn!(what = %self.what, iteration, status = %p.detail, "terminal failure observed");
                        return Err(PollError::Failed { what: self.what.clone(), iteration, status: p.detail });
                    }
                    ProbeStatus::Pending => last_status = p.detail,
                },
                Err(e) => last_status = format!("sample error: {e}"),
            }

            let progress = PollProgress::new(iteration, start.elapsed(), self.deadline, last_status.clone());
            info!(
                what = %self.what,
                iteration = progress.iteration,
                elapsed_secs = progress.elapsed.as_secs(),
                remaining_secs = progress.remaining.as_secs(),
                percent = progress.percent,
                status = %progress.detail,
                "waiting"
            );
            if let Some(cb) = &self.on_progress {
                cb(&progress);
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[tokio::test(start_paused = true)]
    async fn returns_when_flag_turns_true() {
        let calls = AtomicU32::new(0);
        let poller = ReadinessPoller::new("controller", Duration::from_secs(60), Duration::from_secs(5));
        let out = poller
            .wait(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok::<_, String>(Probe::from_flag(n >= 3, format!("available={}", n >= 3))) }
            })
            .await
            .unwrap();
        assert_eq!(out.iterations, 3);
        assert_eq!(out.elapsed, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_checked_before_sampling() {
        let calls = Arc::new(AtomicU32::new(0));
        let poller = ReadinessPoller::new("cluster", Duration::from_secs(5), Duration::from_secs(2));
        let c = calls.clone();
        let err = poller
            .wait(move || {
                // the fourth sample would succeed, but it is never taken
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok::<_, String>(Probe::from_phase(if n >= 4 { "Provisioned" } else { "Provisioning" }, "Provisioned", "Failed")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            PollError::TimedOut { iterations, last_status, .. } => {
                assert_eq!(iterations, 3);
                assert_eq!(last_status, "phase=Provisioning");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_phase_stops_immediately() {
        let calls = AtomicU32::new(0);
        let poller = ReadinessPoller::new("cluster", Duration::from_secs(600), Duration::from_secs(10));
        let started = Instant::now();
        let err = poller
            .wait(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok::<_, String>(Probe::from_phase(if n == 2 { "Failed" } else { "Provisioning" }, "Provisioned", "Failed")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert!(matches!(err, PollError::Failed { iteration: 2, .. }));
        assert!(err.to_string().contains("phase=Failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn sample_errors_are_not_terminal_and_reach_progress() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let calls = AtomicU32::new(0);
        let poller = ReadinessPoller::new("rg", Duration::from_secs(30), Duration::from_secs(10))
            .with_progress(move |p| s.lock().unwrap().push((p.iteration, p.percent, p.detail.clone())));
        let out = poller
            .wait(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        Err("connection refused".to_string())
                    } else {
                        Ok(Probe::from_existence(n < 3, "resource group"))
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out.iterations, 3);
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (1, 0, "sample error: connection refused".to_string()));
        assert_eq!(seen[1].0, 2);
        assert_eq!(seen[1].1, 33);
    }

    #[test]
    fn phase_probe_is_case_insensitive() {
        assert_eq!(Probe::from_phase("provisioned", "Provisioned", "Failed").status, ProbeStatus::Ready);
        assert_eq!(Probe::from_phase("FAILED", "Provisioned", "Failed").status, ProbeStatus::Failed);
        assert_eq!(Probe::from_phase("", "Provisioned", "Failed").detail, "phase=<none>");
    }

    #[test]
    fn timeout_message_carries_status() {
        let e = PollError::TimedOut {
            what: "cluster c1".into(),
            elapsed: Duration::from_secs(61),
            timeout: Duration::from_secs(60),
            iterations: 7,
            last_status: "phase=Provisioning".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("61s of 60s") && msg.contains("phase=Provisioning"), "{msg}");
    }
}
