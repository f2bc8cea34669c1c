//! Thin wrappers over the cluster-lifecycle CLI (`kind`), the cloud CLI (`az`)
//! and the manifest generation script.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::{judge_output, CommandOutput, CommandRunner, CommandSpec, ProcessRunner, Verdict};

/// A tool run that could not start, or whose output was judged a failure.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0:#}")]
    Run(anyhow::Error),
    #[error("`{cmd}`: {reason}")]
    Rejected { cmd: String, reason: String, output: String },
}

impl ToolError {
    /// Raw tool output, for retry classification.
    pub fn output(&self) -> &str {
        match self {
            ToolError::Run(_) => "",
            ToolError::Rejected { output, .. } => output,
        }
    }
}

const KIND_ERROR_MARKERS: &[&str] = &["error:", "failed to create cluster"];

/// Bound for `kind get` and `kind delete`.
pub const KIND_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
/// Added to `--wait` for `kind create` so node image pulls fit.
pub const KIND_CREATE_MARGIN: Duration = Duration::from_secs(300);

/// Run `spec` and judge its output with [`judge_output`].
pub async fn run_checked<R: CommandRunner + ?Sized>(
    runner: &R,
    spec: &CommandSpec,
    success: &[&str],
    errors: &[&str],
) -> Result<CommandOutput, ToolError> {
    let out = runner.run(spec).await.map_err(ToolError::Run)?;
    match judge_output(&out.combined, out.success(), success, errors) {
        Verdict::Success => Ok(out),
        Verdict::Failure(reason) => Err(ToolError::Rejected { cmd: spec.display(), reason, output: out.combined }),
    }
}

/// Local management cluster lifecycle via `kind`.
pub struct ClusterCli<R = ProcessRunner> {
    runner: R,
    program: String,
}

impl ClusterCli<ProcessRunner> {
    pub fn new() -> Self {
        Self::with_runner(ProcessRunner)
    }
}

impl Default for ClusterCli<ProcessRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> ClusterCli<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner, program: "kind".to_string() }
    }

    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub async fn clusters(&self) -> Result<Vec<String>, ToolError> {
        let spec = CommandSpec::new(&self.program).args(["get", "clusters"]).timeout(KIND_COMMAND_TIMEOUT);
        let out = run_checked(&self.runner, &spec, &[], KIND_ERROR_MARKERS).await?;
        // "No kind clusters found." goes to stderr; stdout lists one name per line
        Ok(out.stdout.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect())
    }

    pub async fn exists(&self, name: &str) -> Result<bool, ToolError> {
        Ok(self.clusters().await?.iter().any(|c| c == name))
    }

    /// Create unless a cluster with this name already exists. Returns whether one was created.
    pub async fn ensure(&self, name: &str, config: Option<&Path>, wait: Duration) -> Result<bool, ToolError> {
        if self.exists(name).await? {
            info!(cluster = %name, "management cluster already exists");
            return Ok(false);
        }
        let mut spec = CommandSpec::new(&self.program)
            .args(["create", "cluster", "--name", name])
            .arg(format!("--wait={}s", wait.as_secs()))
            .timeout(wait + KIND_CREATE_MARGIN);
        if let Some(cfg) = config {
            spec = spec.arg("--config").arg(cfg.as_os_str());
        }
        run_checked(&self.runner, &spec, &[], KIND_ERROR_MARKERS).await?;
        info!(cluster = %name, "management cluster created");
        Ok(true)
    }

    /// Deleting an absent cluster succeeds.
    pub async fn delete(&self, name: &str) -> Result<(), ToolError> {
        let spec = CommandSpec::new(&self.program).args(["delete", "cluster", "--name", name]).timeout(KIND_COMMAND_TIMEOUT);
        run_checked(&self.runner, &spec, &[], KIND_ERROR_MARKERS).await?;
        info!(cluster = %name, "management cluster deleted");
        Ok(())
    }
}

/// Cloud resource container checks via `az`.
pub struct CloudCli<R = ProcessRunner> {
    runner: R,
    program: String,
}

impl CloudCli<ProcessRunner> {
    pub fn new() -> Self {
        Self::with_runner(ProcessRunner)
    }
}

impl Default for CloudCli<ProcessRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> CloudCli<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner, program: "az".to_string() }
    }

    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// `az group exists` prints a bare `true` or `false`; anything else is an error.
    pub async fn group_exists(&self, group: &str) -> Result<bool, ToolError> {
        let spec = CommandSpec::new(&self.program).args(["group", "exists", "--name", group]).timeout(Duration::from_secs(120));
        let out = run_checked(&self.runner, &spec, &["true", "false"], &["error:"]).await?;
        match out.stdout.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(ToolError::Rejected {
                cmd: spec.display(),
                reason: format!("unexpected answer {:?}", other),
                output: out.combined,
            }),
        }
    }
}

/// Runs the external manifest generator with naming inputs exported as env vars.
pub struct Generator<R = ProcessRunner> {
    runner: R,
    script: PathBuf,
}

impl Generator<ProcessRunner> {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self::with_runner(ProcessRunner, script)
    }
}

impl<R: CommandRunner> Generator<R> {
    pub fn with_runner(runner: R, script: impl Into<PathBuf>) -> Self {
        Self { runner, script: script.into() }
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    pub async fn run(&self, output: &Path, vars: &[(&str, String)], timeout: Duration) -> Result<CommandOutput, ToolError> {
        let mut spec = CommandSpec::new(self.script.as_os_str()).env("KSTAGE_OUTPUT", output.as_os_str()).timeout(timeout);
        for (k, v) in vars {
            spec = spec.env(*k, v.as_str());
        }
        let out = run_checked(&self.runner, &spec, &[], &[]).await?;
        info!(script = %self.script.display(), output = %output.display(), "manifests generated");
        Ok(out)
    }
}
