//! kstage reconcile: drive one workload cluster to Ready, or to fully absent.
//!
//! Create path: `NotApplied -> Applying -> WaitingReady -> {Ready, Failed, TimedOut}`.
//! Delete path: `Requested -> Deleting -> WaitingAbsent -> {Absent, TimedOut}`.
//! Steps run one at a time; the only waits are retry backoff and poll intervals.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kstage_apply::ManifestDoc;
use kstage_core::{DesiredConfig, Presence, ResourcePhase};
use kstage_kubehub::ResourceRef;
use kstage_poll::{PollError, PollOutcome, Probe, ReadinessPoller};
use kstage_retry::{Classifier, PatternClassifier, RetryError, RetryExecutor, RetryPolicy};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub mod backend;
mod status;

pub use backend::{AzCloud, CloudApi, ClusterApi, KubeCluster};
pub use status::{DeletionStatus, DependentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateState {
    NotApplied,
    Applying,
    WaitingReady,
    Ready,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteState {
    Requested,
    Deleting,
    WaitingAbsent,
    Absent,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Transition {
    Create(CreateState),
    Delete(DeleteState),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("apply aborted at {artifact} (document {index}): {source}")]
    Apply { artifact: String, index: usize, source: RetryError },
    #[error("cluster not ready: {source}")]
    NotReady { source: PollError },
    #[error("delete request for {target} failed: {reason}")]
    DeleteRequest { target: String, reason: String },
    #[error("teardown incomplete: {source}")]
    DeletionTimedOut { source: PollError, last: Option<DeletionStatus> },
}

impl ReconcileError {
    /// Attempts spent on the failing artifact, when the failure came from apply.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ReconcileError::Apply { source, .. } => Some(source.attempts()),
            _ => None,
        }
    }

    /// Last observed external status, when the failure came from a poll.
    pub fn last_status(&self) -> Option<String> {
        match self {
            ReconcileError::NotReady { source } => Some(source.last_status().to_string()),
            ReconcileError::DeletionTimedOut { last: Some(s), .. } => Some(s.to_string()),
            ReconcileError::DeletionTimedOut { source, .. } => Some(source.last_status().to_string()),
            _ => None,
        }
    }
}

/// Which objects the reconciler owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileTarget {
    pub cluster: ResourceRef,
    /// GVK keys whose objects in the cluster namespace block deletion.
    pub dependents: Vec<String>,
    /// Cloud resource container backing the cluster.
    pub container: String,
}

impl ReconcileTarget {
    pub fn from_config(cfg: &DesiredConfig, cluster_gvk: &str, dependents: &[String]) -> Self {
        Self {
            cluster: ResourceRef::new(cluster_gvk, Some(&cfg.resolved_namespace), cfg.cluster_name()),
            dependents: dependents.to_vec(),
            container: cfg.resource_group(),
        }
    }

    fn namespace(&self) -> &str {
        self.cluster.namespace.as_deref().unwrap_or("default")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateReport {
    pub applied: usize,
    pub iterations: u32,
    pub elapsed_secs: u64,
    pub detail: String,
}

type TransitionFn = Box<dyn Fn(Transition) + Send + Sync>;

pub struct LifecycleReconciler<C, K> {
    cluster: C,
    cloud: K,
    target: ReconcileTarget,
    retry: RetryExecutor,
    classifier: Arc<dyn Classifier>,
    timeout: Duration,
    interval: Duration,
    on_transition: Option<TransitionFn>,
}

impl<C: ClusterApi, K: CloudApi> LifecycleReconciler<C, K> {
    pub fn new(cluster: C, cloud: K, target: ReconcileTarget, timeout: Duration) -> Self {
        Self {
            cluster,
            cloud,
            target,
            retry: RetryExecutor::new(RetryPolicy::default()),
            classifier: Arc::new(PatternClassifier::default()),
            timeout,
            interval: Duration::from_secs(10),
            on_transition: None,
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryExecutor::new(policy);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn on_transition(mut self, f: impl Fn(Transition) + Send + Sync + 'static) -> Self {
        self.on_transition = Some(Box::new(f));
        self
    }

    pub fn target(&self) -> &ReconcileTarget {
        &self.target
    }

    fn enter(&self, t: Transition) {
        info!(cluster = %self.target.cluster, state = ?t, "lifecycle transition");
        if let Some(cb) = &self.on_transition {
            cb(t);
        }
    }

    /// Apply every document (each under the retry policy), then wait for the
    /// cluster phase. A document that fails for good stops the run; later
    /// documents are not attempted.
    pub async fn create(&self, docs: &[ManifestDoc]) -> Result<CreateReport, ReconcileError> {
        self.enter(Transition::Create(CreateState::NotApplied));
        self.enter(Transition::Create(CreateState::Applying));
        for doc in docs {
            let label = doc.label();
            let res = self.retry.run(&label, self.classifier.as_ref(), move |_| self.cluster.apply(doc)).await;
            if let Err(source) = res {
                warn!(artifact = %label, attempts = source.attempts(), fatal = source.is_fatal(), "apply failed");
                self.enter(Transition::Create(CreateState::Failed));
                return Err(ReconcileError::Apply { artifact: label, index: doc.index, source });
            }
        }
        info!(documents = docs.len(), "all documents applied");

        let out = self.wait_ready().await?;
        Ok(CreateReport { applied: docs.len(), iterations: out.iterations, elapsed_secs: out.elapsed.as_secs(), detail: out.detail })
    }

    /// Poll the cluster phase until `Provisioned`; `Failed` ends the wait at once.
    pub async fn wait_ready(&self) -> Result<PollOutcome, ReconcileError> {
        self.enter(Transition::Create(CreateState::WaitingReady));
        let this = self;
        let poller = ReadinessPoller::new(self.target.cluster.to_string(), self.timeout, self.interval);
        let res = poller
            .wait(move || async move {
                Ok::<_, anyhow::Error>(match this.cluster.phase(&this.target.cluster).await? {
                    None => Probe::pending("not found"),
                    Some(phase) => phase_probe(&phase),
                })
            })
            .await;
        match res {
            Ok(out) => {
                self.enter(Transition::Create(CreateState::Ready));
                Ok(out)
            }
            Err(source) => {
                let state = match source {
                    PollError::Failed { .. } => CreateState::Failed,
                    PollError::TimedOut { .. } => CreateState::TimedOut,
                };
                self.enter(Transition::Create(state));
                Err(ReconcileError::NotReady { source })
            }
        }
    }

    /// One snapshot of everything that blocks a complete teardown.
    pub async fn deletion_status(&self) -> anyhow::Result<DeletionStatus> {
        let primary = self.cluster.presence(&self.target.cluster).await?;
        let mut dependents = Vec::with_capacity(self.target.dependents.len());
        for gvk in &self.target.dependents {
            let names = self.cluster.list_names(gvk, self.target.namespace()).await?;
            dependents.push(DependentStatus { gvk: gvk.clone(), names });
        }
        let container_exists = self.cloud.container_exists(&self.target.container).await?;
        Ok(DeletionStatus {
            cluster: self.target.cluster.name.clone(),
            primary,
            dependents,
            container: self.target.container.clone(),
            container_exists,
        })
    }

    /// Request deletion of the primary object and wait until it, its
    /// dependents and the cloud container are all gone.
    pub async fn delete(&self) -> Result<DeletionStatus, ReconcileError> {
        self.enter(Transition::Delete(DeleteState::Requested));
        match self.cluster.request_delete(&self.target.cluster).await {
            Ok(true) => {}
            Ok(false) => info!(cluster = %self.target.cluster, "already absent; checking leftovers"),
            Err(e) => {
                return Err(ReconcileError::DeleteRequest { target: self.target.cluster.to_string(), reason: format!("{:#}", e) });
            }
        }
        self.enter(Transition::Delete(DeleteState::Deleting));

        self.enter(Transition::Delete(DeleteState::WaitingAbsent));
        let last_seen: Mutex<Option<DeletionStatus>> = Mutex::new(None);
        let (this, seen) = (self, &last_seen);
        let poller = ReadinessPoller::new(format!("teardown of {}", self.target.cluster), self.timeout, self.interval);
        let res = poller
            .wait(move || async move {
                let snap = this.deletion_status().await?;
                let probe = Probe::from_flag(snap.is_complete(), snap.to_string());
                *seen.lock().await = Some(snap);
                Ok::<_, anyhow::Error>(probe)
            })
            .await;
        let last = last_seen.into_inner();
        match res {
            Ok(_) => {
                self.enter(Transition::Delete(DeleteState::Absent));
                Ok(last.unwrap_or_else(|| self.absent_snapshot()))
            }
            Err(source) => {
                self.enter(Transition::Delete(DeleteState::TimedOut));
                Err(ReconcileError::DeletionTimedOut { source, last })
            }
        }
    }

    fn absent_snapshot(&self) -> DeletionStatus {
        DeletionStatus {
            cluster: self.target.cluster.name.clone(),
            primary: Presence::Absent,
            dependents: Vec::new(),
            container: self.target.container.clone(),
            container_exists: false,
        }
    }
}

fn phase_probe(phase: &ResourcePhase) -> Probe {
    match phase {
        ResourcePhase::Provisioned => Probe::ready(format!("phase={}", phase)),
        ResourcePhase::Failed => Probe::failed(format!("phase={}", phase)),
        _ => Probe::pending(format!("phase={}", phase)),
    }
}

/// Wait until every `(namespace, deployment)` reports all replicas available.
pub async fn wait_for_controllers<C: ClusterApi + ?Sized>(
    cluster: &C,
    controllers: &[(String, String)],
    timeout: Duration,
    interval: Duration,
) -> Result<PollOutcome, PollError> {
    let poller = ReadinessPoller::new("controllers", timeout, interval);
    poller
        .wait(move || async move {
            let mut waiting = Vec::new();
            for (ns, name) in controllers {
                let (ok, detail) = cluster.deployment_available(ns, name).await?;
                if !ok {
                    waiting.push(format!("{}/{} {}", ns, name, detail));
                }
            }
            Ok::<_, anyhow::Error>(if waiting.is_empty() {
                Probe::ready(format!("{} controllers available", controllers.len()))
            } else {
                Probe::pending(format!("waiting on {}", waiting.join(", ")))
            })
        })
        .await
}
