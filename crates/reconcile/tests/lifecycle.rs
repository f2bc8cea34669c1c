use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kstage_apply::ManifestDoc;
use kstage_core::{Presence, ResourcePhase};
use kstage_kubehub::ResourceRef;
use kstage_reconcile::{
    wait_for_controllers, CloudApi, ClusterApi, CreateState, DeleteState, LifecycleReconciler, ReconcileError, ReconcileTarget,
    Transition,
};
use kstage_retry::{AttemptFailure, RetryPolicy};

/// Pops scripted values in order; the last one repeats.
struct Script<T: Clone>(Mutex<VecDeque<T>>);

impl<T: Clone> Script<T> {
    fn new(items: Vec<T>) -> Self {
        Self(Mutex::new(items.into()))
    }

    fn next(&self) -> T {
        let mut q = self.0.lock().unwrap();
        if q.len() > 1 { q.pop_front().unwrap() } else { q.front().cloned().unwrap() }
    }
}

struct FakeCluster {
    apply_script: Mutex<HashMap<String, VecDeque<Result<(), AttemptFailure>>>>,
    applied: Arc<Mutex<Vec<String>>>,
    phases: Script<Option<ResourcePhase>>,
    presence: Script<Presence>,
    pools: Script<Vec<String>>,
    deletes: Arc<AtomicU32>,
    controller_checks: AtomicU32,
}

impl FakeCluster {
    fn new() -> Self {
        Self {
            apply_script: Mutex::new(HashMap::new()),
            applied: Arc::new(Mutex::new(Vec::new())),
            phases: Script::new(vec![Some(ResourcePhase::Provisioned)]),
            presence: Script::new(vec![Presence::Absent]),
            pools: Script::new(vec![Vec::new()]),
            deletes: Arc::new(AtomicU32::new(0)),
            controller_checks: AtomicU32::new(0),
        }
    }

    fn apply_results(self, name: &str, results: Vec<Result<(), AttemptFailure>>) -> Self {
        self.apply_script.lock().unwrap().insert(name.to_string(), results.into());
        self
    }

    fn phases(mut self, phases: Vec<Option<ResourcePhase>>) -> Self {
        self.phases = Script::new(phases);
        self
    }

    fn presence(mut self, p: Vec<Presence>) -> Self {
        self.presence = Script::new(p);
        self
    }

    fn pools(mut self, pools: Vec<Vec<&str>>) -> Self {
        self.pools = Script::new(pools.into_iter().map(|v| v.into_iter().map(String::from).collect()).collect());
        self
    }
}

#[async_trait::async_trait]
impl ClusterApi for FakeCluster {
    async fn apply(&self, doc: &ManifestDoc) -> Result<(), AttemptFailure> {
        self.applied.lock().unwrap().push(doc.name.clone());
        let mut script = self.apply_script.lock().unwrap();
        script.get_mut(&doc.name).and_then(|q| q.pop_front()).unwrap_or(Ok(()))
    }

    async fn phase(&self, _target: &ResourceRef) -> anyhow::Result<Option<ResourcePhase>> {
        Ok(self.phases.next())
    }

    async fn presence(&self, _target: &ResourceRef) -> anyhow::Result<Presence> {
        Ok(self.presence.next())
    }

    async fn request_delete(&self, _target: &ResourceRef) -> anyhow::Result<bool> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn list_names(&self, _gvk_key: &str, _namespace: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.pools.next())
    }

    async fn deployment_available(&self, namespace: &str, name: &str) -> anyhow::Result<(bool, String)> {
        let n = self.controller_checks.fetch_add(1, Ordering::SeqCst);
        if namespace == "capz-system" && n < 3 {
            return Ok((false, "available 0/1".into()));
        }
        Ok((true, format!("{name} available 1/1")))
    }
}

struct FakeCloud(Script<bool>);

#[async_trait::async_trait]
impl CloudApi for FakeCloud {
    async fn container_exists(&self, _name: &str) -> anyhow::Result<bool> {
        Ok(self.0.next())
    }
}

fn target() -> ReconcileTarget {
    ReconcileTarget {
        cluster: ResourceRef::new("cluster.x-k8s.io/v1beta1/Cluster", Some("kstage-1"), "capz1"),
        dependents: vec!["infrastructure.cluster.x-k8s.io/v1beta1/AzureManagedMachinePool".into()],
        container: "capz1".into(),
    }
}

fn doc(index: usize, name: &str) -> ManifestDoc {
    ManifestDoc {
        index,
        gvk: "v1/ConfigMap".into(),
        kind: "ConfigMap".into(),
        name: name.into(),
        namespace: Some("kstage-1".into()),
        body: serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}}),
    }
}

fn reconciler(cluster: FakeCluster, cloud: Vec<bool>, timeout_secs: u64) -> (LifecycleReconciler<FakeCluster, FakeCloud>, Arc<Mutex<Vec<Transition>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let r = LifecycleReconciler::new(cluster, FakeCloud(Script::new(cloud)), target(), Duration::from_secs(timeout_secs))
        .with_interval(Duration::from_secs(10))
        .with_retry(RetryPolicy::new(4, Duration::from_secs(1), Duration::from_secs(2)))
        .on_transition(move |t| s.lock().unwrap().push(t));
    (r, seen)
}

#[tokio::test(start_paused = true)]
async fn create_applies_every_document_then_waits_for_provisioned() {
    let cluster = FakeCluster::new().phases(vec![None, Some(ResourcePhase::Provisioning), Some(ResourcePhase::Provisioned)]);
    let (r, seen) = reconciler(cluster, vec![false], 300);
    let report = r.create(&[doc(0, "a"), doc(1, "b")]).await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(report.iterations, 3);
    assert_eq!(report.detail, "phase=Provisioned");
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            Transition::Create(CreateState::NotApplied),
            Transition::Create(CreateState::Applying),
            Transition::Create(CreateState::WaitingReady),
            Transition::Create(CreateState::Ready),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn fatal_apply_aborts_and_names_the_artifact() {
    let cluster = FakeCluster::new().apply_results("b", vec![Err(AttemptFailure::new("", "admission webhook denied the request: spec.location is invalid"))]);
    let applied = cluster.applied.clone();
    let (r, seen) = reconciler(cluster, vec![false], 300);
    let err = r.create(&[doc(0, "a"), doc(1, "b"), doc(2, "c")]).await.unwrap_err();

    match &err {
        ReconcileError::Apply { artifact, index, source } => {
            assert_eq!(artifact, "ConfigMap/kstage-1/b");
            assert_eq!(*index, 1);
            assert!(source.is_fatal());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.attempts(), Some(1));
    assert!(err.to_string().contains("attempt 1 of 4"), "{err}");
    assert_eq!(*applied.lock().unwrap(), vec!["a", "b"]);
    assert_eq!(seen.lock().unwrap().last(), Some(&Transition::Create(CreateState::Failed)));
}

#[tokio::test(start_paused = true)]
async fn transient_apply_failures_are_retried() {
    let reset = || Err(AttemptFailure::new("", "dial tcp 10.0.0.1:443: connection reset by peer"));
    let cluster = FakeCluster::new().apply_results("a", vec![reset(), reset()]);
    let applied = cluster.applied.clone();
    let (r, _) = reconciler(cluster, vec![false], 300);
    let report = r.create(&[doc(0, "a")]).await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(applied.lock().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_phase_ends_the_wait_immediately() {
    let cluster = FakeCluster::new().phases(vec![Some(ResourcePhase::Provisioning), Some(ResourcePhase::Failed)]);
    let (r, seen) = reconciler(cluster, vec![false], 3600);
    let started = tokio::time::Instant::now();
    let err = r.create(&[doc(0, "a")]).await.unwrap_err();
    assert!(matches!(err, ReconcileError::NotReady { .. }));
    assert_eq!(err.last_status().as_deref(), Some("phase=Failed"));
    assert_eq!(started.elapsed(), Duration::from_secs(10));
    assert_eq!(seen.lock().unwrap().last(), Some(&Transition::Create(CreateState::Failed)));
}

#[tokio::test(start_paused = true)]
async fn ready_timeout_carries_last_phase() {
    let cluster = FakeCluster::new().phases(vec![Some(ResourcePhase::Provisioning)]);
    let (r, seen) = reconciler(cluster, vec![false], 30);
    let err = r.wait_ready().await.unwrap_err();
    assert_eq!(err.last_status().as_deref(), Some("phase=Provisioning"));
    assert!(err.to_string().contains("timed out"), "{err}");
    assert_eq!(seen.lock().unwrap().last(), Some(&Transition::Create(CreateState::TimedOut)));
}

#[tokio::test(start_paused = true)]
async fn delete_waits_for_dependents_and_cloud_container() {
    let cluster = FakeCluster::new().presence(vec![Presence::Deleting, Presence::Absent]).pools(vec![vec!["pool0"], vec!["pool0"], vec![]]);
    let deletes = cluster.deletes.clone();
    let (r, seen) = reconciler(cluster, vec![true, true, true, false], 600);
    let started = tokio::time::Instant::now();
    let status = r.delete().await.unwrap();
    assert!(status.is_complete());
    assert_eq!(deletes.load(Ordering::SeqCst), 1);
    assert_eq!(started.elapsed(), Duration::from_secs(30));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            Transition::Delete(DeleteState::Requested),
            Transition::Delete(DeleteState::Deleting),
            Transition::Delete(DeleteState::WaitingAbsent),
            Transition::Delete(DeleteState::Absent),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn delete_timeout_reports_what_is_still_blocking() {
    let cluster = FakeCluster::new();
    let (r, _) = reconciler(cluster, vec![true], 20);
    let err = r.delete().await.unwrap_err();
    match &err {
        ReconcileError::DeletionTimedOut { last: Some(last), .. } => {
            assert!(last.primary.is_absent());
            assert!(last.container_exists);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.last_status().as_deref(), Some("waiting on: resource group capz1 exists"));
}

#[tokio::test(start_paused = true)]
async fn deletion_status_is_a_single_snapshot() {
    let cluster = FakeCluster::new().presence(vec![Presence::Exists]).pools(vec![vec!["pool0", "pool1"]]);
    let (r, _) = reconciler(cluster, vec![true], 60);
    let snap = r.deletion_status().await.unwrap();
    assert_eq!(snap.primary, Presence::Exists);
    assert_eq!(snap.dependents[0].names, vec!["pool0", "pool1"]);
    assert!(!snap.is_complete());
}

#[tokio::test(start_paused = true)]
async fn controllers_wait_until_all_available() {
    let cluster = FakeCluster::new();
    let controllers = vec![("capi-system".to_string(), "capi-controller-manager".to_string()), ("capz-system".to_string(), "capz-controller-manager".to_string())];
    let out = wait_for_controllers(&cluster, &controllers, Duration::from_secs(120), Duration::from_secs(5)).await.unwrap();
    assert!(out.iterations >= 2);
    assert!(out.detail.contains("2 controllers"));
}
