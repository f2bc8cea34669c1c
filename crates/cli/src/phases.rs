//! One function per phase. Each resolves what it needs, does its work, and
//! returns a report; failures carry the step, attempts and last status.

use std::future::Future;
use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use kstage_apply::{extract_cluster_name, split_documents, DriftDetector};
use kstage_config::{ConfigResolver, PhaseSettings, ProcessEnv};
use kstage_core::{DesiredConfig, DriftDecision, NamespaceSource, PersistedState};
use kstage_ops::{check_dependencies, run_checked, ClusterCli, CommandRunner, CommandSpec, Generator, ProcessRunner, ToolError};
use kstage_persist::DeploymentStateStore;
use kstage_reconcile::{wait_for_controllers, AzCloud, ClusterApi, KubeCluster, LifecycleReconciler, ReconcileTarget};
use kstage_retry::{AttemptFailure, PatternClassifier, RetryError, RetryExecutor, RetryPolicy};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct PhaseReport {
    pub phase: &'static str,
    pub ok: bool,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip)]
    lines: Vec<String>,
}

impl PhaseReport {
    fn new(phase: &'static str, details: serde_json::Value) -> Self {
        Self { phase, ok: true, details, warnings: Vec::new(), lines: Vec::new() }
    }

    fn line(mut self, l: impl Into<String>) -> Self {
        self.lines.push(l.into());
        self
    }

    fn warnings(mut self, w: &[String]) -> Self {
        self.warnings = w.to_vec();
        self
    }

    pub fn print_human(&self) {
        for w in &self.warnings {
            eprintln!("warning: {}", w);
        }
        for l in &self.lines {
            println!("{}", l);
        }
    }
}

/// Everything a phase needs, resolved once per invocation.
pub struct Context {
    pub config: DesiredConfig,
    pub settings: PhaseSettings,
    pub store: DeploymentStateStore,
    pub warnings: Vec<String>,
}

impl Context {
    pub fn load(state: Option<PathBuf>, artifact: Option<PathBuf>) -> Result<Self> {
        let store = state.map(DeploymentStateStore::new).unwrap_or_else(DeploymentStateStore::open_default);
        let resolution = ConfigResolver::new(ProcessEnv).with_store(store.clone()).resolve().context("invalid configuration")?;
        let mut warnings = resolution.warnings;
        let mut settings = PhaseSettings::from_env(&ProcessEnv, &mut warnings);
        if let Some(a) = artifact {
            settings.artifact_path = a;
        }
        Ok(Self { config: resolution.config, settings, store, warnings })
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.settings.retry_attempts, self.settings.retry_base, self.settings.retry_cap)
    }

    async fn reconciler(&self, cluster_name: Option<String>) -> Result<LifecycleReconciler<KubeCluster, AzCloud>> {
        let mut target = ReconcileTarget::from_config(&self.config, &self.settings.cluster_gvk, &self.settings.dependent_gvks);
        if let Some(name) = cluster_name {
            target.cluster.name = name;
        }
        let cluster = KubeCluster::connect().await?;
        Ok(LifecycleReconciler::new(cluster, AzCloud::new(), target, self.config.deployment_timeout)
            .with_retry(self.retry_policy())
            .with_interval(self.settings.poll_interval))
    }
}

/// Retry a tool invocation under the configured policy, classifying its output.
async fn retry_tool<T, F, Fut>(ctx: &Context, step: &str, mut op: F) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ToolError>>,
{
    let classifier = PatternClassifier::default();
    RetryExecutor::new(ctx.retry_policy())
        .run(step, &classifier, |_| {
            let fut = op();
            async move { fut.await.map_err(|e| AttemptFailure::new(e.output(), e.to_string())) }
        })
        .await
}

/// Inputs handed to the generation script.
pub fn generator_vars(cfg: &DesiredConfig) -> Vec<(&'static str, String)> {
    vec![
        ("KSTAGE_NAMESPACE", cfg.resolved_namespace.clone()),
        ("KSTAGE_CLUSTER_NAME", cfg.cluster_name()),
        ("KSTAGE_RESOURCE_GROUP", cfg.resource_group()),
        ("KSTAGE_REGION", cfg.region.clone()),
        ("KSTAGE_USER", cfg.user_identifier.clone()),
        ("KSTAGE_ENV", cfg.environment_identifier.clone()),
        ("KSTAGE_DOMAIN_PREFIX", cfg.domain_prefix()),
        ("KSTAGE_EXTERNAL_AUTH_ID", cfg.external_auth_id()),
    ]
}

pub fn check_deps() -> Result<PhaseReport> {
    let mut warnings = Vec::new();
    let settings = PhaseSettings::from_env(&ProcessEnv, &mut warnings);
    let report = check_dependencies(&settings.required_tools);
    if !report.all_found() {
        bail!("missing required tools: {}", report.missing().join(", "));
    }
    let mut out = PhaseReport::new("check-deps", serde_json::to_value(&report)?).warnings(&warnings);
    for t in &report.tools {
        let path = t.path.as_ref().map(|p| p.display().to_string()).unwrap_or_default();
        out = out.line(format!("{:<12} {}", t.name, path));
    }
    Ok(out)
}

pub async fn setup(ctx: &Context) -> Result<PhaseReport> {
    let name = &ctx.settings.mgmt_cluster;
    let kind = ClusterCli::new();
    let created = retry_tool(ctx, "create management cluster", || kind.ensure(name, None, ctx.config.controller_timeout)).await?;

    let cluster = KubeCluster::connect().await?;
    let controllers = ctx.settings.controller_refs();
    if !controllers_available(&cluster, &controllers).await {
        let init = CommandSpec::new("clusterctl")
            .args(["init", "--infrastructure", "azure"])
            .timeout(ctx.config.controller_timeout);
        retry_tool(ctx, "clusterctl init", || run_checked(&ProcessRunner, &init, &[], &["error:"])).await?;
    } else {
        info!("controllers already available; skipping provider init");
    }
    let ready = wait_for_controllers(&cluster, &controllers, ctx.config.controller_timeout, ctx.settings.poll_interval).await?;

    Ok(PhaseReport::new("setup", json!({ "mgmt_cluster": name, "created": created, "controllers": ctx.settings.controllers }))
        .warnings(&ctx.warnings)
        .line(format!("management cluster {} {}", name, if created { "created" } else { "already present" }))
        .line(format!("{} after {}s", ready.detail, ready.elapsed.as_secs())))
}

async fn controllers_available<C: ClusterApi>(cluster: &C, controllers: &[(String, String)]) -> bool {
    for (ns, name) in controllers {
        match cluster.deployment_available(ns, name).await {
            Ok((true, _)) => {}
            Ok((false, _)) => return false,
            Err(e) => {
                warn!(controller = %format!("{}/{}", ns, name), error = %e, "controller check failed");
                return false;
            }
        }
    }
    true
}

/// Write the state record unless it already holds this config. An override that
/// replaces a persisted namespace is written but reported.
fn persist_state(ctx: &Context, warnings: &mut Vec<String>) -> Result<(PersistedState, bool)> {
    let existing = match ctx.store.read() {
        Ok(found) => found,
        Err(e) => {
            warn!(error = %e, "existing state unreadable; overwriting");
            None
        }
    };
    if let Some(prev) = existing {
        if PersistedState::from_config(&ctx.config, prev.written_at.clone()) == prev {
            return Ok((prev, false));
        }
        if ctx.config.namespace_source == NamespaceSource::Override && prev.resolved_namespace != ctx.config.resolved_namespace {
            warn!(persisted = %prev.resolved_namespace, namespace = %ctx.config.resolved_namespace, "namespace override replaces persisted namespace");
            warnings.push(format!(
                "namespace override {:?} replaces persisted namespace {:?}",
                ctx.config.resolved_namespace, prev.resolved_namespace
            ));
        }
    }
    Ok((ctx.store.write(&ctx.config)?, true))
}

pub async fn generate(ctx: &Context, force: bool) -> Result<PhaseReport> {
    generate_with(ctx, &Generator::new(&ctx.settings.generate_script), force).await
}

pub async fn generate_with<R: CommandRunner>(ctx: &Context, gen: &Generator<R>, force: bool) -> Result<PhaseReport> {
    let mut warnings = ctx.warnings.clone();
    let (persisted, state_written) = persist_state(ctx, &mut warnings)?;
    let artifact = &ctx.settings.artifact_path;
    let detector = DriftDetector::default();
    let decision = if force { DriftDecision::regenerate("regeneration forced") } else { detector.check(artifact, &ctx.config) };

    let mut regenerated = false;
    if !decision.is_reuse() {
        info!(reason = %decision.reason, "regenerating manifests");
        if let Some(dir) = artifact.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let vars = generator_vars(&ctx.config);
        retry_tool(ctx, "generate manifests", || gen.run(artifact, &vars, ctx.config.deployment_timeout)).await?;
        let after = detector.check(artifact, &ctx.config);
        if !after.is_reuse() {
            bail!("generated artifact {} still differs from desired config: {}", artifact.display(), after.reason);
        }
        regenerated = true;
    }

    Ok(PhaseReport::new(
        "generate",
        json!({
            "namespace": persisted.resolved_namespace,
            "state_written": state_written,
            "decision": decision,
            "regenerated": regenerated,
            "artifact": artifact,
        }),
    )
    .warnings(&warnings)
    .line(format!("namespace {} ({:?})", ctx.config.resolved_namespace, ctx.config.namespace_source))
    .line(if state_written {
        format!("state written to {}", ctx.store.path().display())
    } else {
        format!("state at {} already current", ctx.store.path().display())
    })
    .line(format!("{}: {}", if regenerated { "regenerated" } else { "reused" }, decision.reason)))
}

pub async fn apply(ctx: &Context) -> Result<PhaseReport> {
    let artifact = &ctx.settings.artifact_path;
    let drift = DriftDetector::default().check(artifact, &ctx.config);
    if !drift.is_reuse() {
        bail!("artifact {} does not match desired config ({}); run generate first", artifact.display(), drift.reason);
    }
    let raw = std::fs::read_to_string(artifact).with_context(|| format!("reading {}", artifact.display()))?;
    let docs = split_documents(&raw)?;
    if docs.is_empty() {
        bail!("artifact {} contains no documents", artifact.display());
    }

    let r = ctx.reconciler(None).await?;
    let report = r.create(&docs).await?;
    Ok(PhaseReport::new("apply", serde_json::to_value(&report)?)
        .warnings(&ctx.warnings)
        .line(format!("applied {} documents", report.applied))
        .line(format!("{} ready after {}s ({})", r.target().cluster, report.elapsed_secs, report.detail)))
}

pub async fn verify(ctx: &Context) -> Result<PhaseReport> {
    let r = ctx.reconciler(None).await?;
    let out = r.wait_ready().await?;
    Ok(PhaseReport::new("verify", json!({ "cluster": r.target().cluster, "iterations": out.iterations, "elapsed_secs": out.elapsed.as_secs(), "detail": out.detail }))
        .warnings(&ctx.warnings)
        .line(format!("{} ready ({})", r.target().cluster, out.detail)))
}

/// Cluster name from generated manifests when present, else derived from config.
fn teardown_cluster_name(ctx: &Context) -> Option<String> {
    match extract_cluster_name(&ctx.settings.artifact_path) {
        Ok(found) => found,
        Err(e) => {
            warn!(error = %format!("{:#}", e), "cannot read cluster name from artifact; using configured name");
            None
        }
    }
}

pub async fn status(ctx: &Context) -> Result<PhaseReport> {
    let r = ctx.reconciler(teardown_cluster_name(ctx)).await?;
    let snap = r.deletion_status().await?;
    let mut out = PhaseReport::new("status", serde_json::to_value(&snap)?).warnings(&ctx.warnings);
    out = out.line(format!("cluster {}: {}", snap.cluster, snap.primary));
    for d in &snap.dependents {
        out = out.line(format!("{}: {}", d.kind(), if d.names.is_empty() { "none".to_string() } else { d.names.join(", ") }));
    }
    Ok(out.line(format!("resource group {}: {}", snap.container, if snap.container_exists { "exists" } else { "absent" })))
}

pub async fn teardown(ctx: &Context) -> Result<PhaseReport> {
    let r = ctx.reconciler(teardown_cluster_name(ctx)).await?;
    let snap = r.delete().await?;
    Ok(PhaseReport::new("teardown", serde_json::to_value(&snap)?).warnings(&ctx.warnings).line(snap.to_string()))
}

pub async fn cleanup(ctx: &Context) -> Result<PhaseReport> {
    let name = &ctx.settings.mgmt_cluster;
    let kind = ClusterCli::new();
    retry_tool(ctx, "delete management cluster", || kind.delete(name)).await?;
    let removed = ctx.store.delete()?;
    Ok(PhaseReport::new("cleanup", json!({ "mgmt_cluster": name, "state_removed": removed }))
        .warnings(&ctx.warnings)
        .line(format!("management cluster {} deleted", name))
        .line(if removed {
            format!("removed {}", ctx.store.path().display())
        } else {
            format!("no state at {}", ctx.store.path().display())
        }))
}

pub fn config(ctx: &Context) -> Result<PhaseReport> {
    let c = &ctx.config;
    Ok(PhaseReport::new(
        "config",
        json!({ "config": c, "settings": ctx.settings, "state_path": ctx.store.path() }),
    )
    .warnings(&ctx.warnings)
    .line(format!("namespace          {} ({:?})", c.resolved_namespace, c.namespace_source))
    .line(format!("cluster            {}", c.cluster_name()))
    .line(format!("resource group     {}", c.resource_group()))
    .line(format!("domain prefix      {}", c.domain_prefix()))
    .line(format!("external auth id   {}", c.external_auth_id()))
    .line(format!("region             {}", c.region))
    .line(format!("deployment timeout {}s", c.deployment_timeout.as_secs()))
    .line(format!("controller timeout {}s", c.controller_timeout.as_secs()))
    .line(format!("artifact           {}", ctx.settings.artifact_path.display()))
    .line(format!("state              {}", ctx.store.path().display())))
}
