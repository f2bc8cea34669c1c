//! kstage ops: the external command-line collaborators.
//!
//! Every tool is an opaque subprocess whose only observable signal is its text
//! output and exit status. `ProcessRunner` drains stdout and stderr
//! concurrently into one accumulator so neither pipe can fill and stall the
//! child, and only then reads the exit status.

#![forbid(unsafe_code)]

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub mod deps;
pub mod tools;
pub mod verdict;

pub use deps::{check_dependencies, DependencyReport, ToolStatus};
pub use tools::{run_checked, CloudCli, ClusterCli, Generator, ToolError};
pub use verdict::{judge_output, Verdict};

/// Program plus argv; never passed through a shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
    /// Kill the child when it outlives this.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self { program: program.into(), ..Default::default() }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }

    /// `program arg1 arg2` for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_tokio_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }
}

/// Captured result of one subprocess run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// stdout and stderr lines in arrival order.
    pub combined: String,
    pub stdout: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Seam for tests and alternative transports.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Spawn failures are errors; a non-zero exit is not.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[derive(Default)]
struct Captured {
    combined: String,
    stdout: String,
}

/// Split on raw `\n` so one non-UTF-8 byte cannot end the read and drop the rest.
async fn drain<R: AsyncRead + Unpin>(pipe: R, sink: Arc<Mutex<Captured>>, is_stdout: bool) -> std::io::Result<()> {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        let line = String::from_utf8_lossy(&buf);
        let mut cap = sink.lock().await;
        cap.combined.push_str(&line);
        cap.combined.push('\n');
        if is_stdout {
            cap.stdout.push_str(&line);
            cap.stdout.push('\n');
        }
    }
}

#[async_trait::async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let shown = spec.display();
        let mut cmd = spec.to_tokio_command();
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
        let mut child = cmd.spawn().with_context(|| format!("spawning `{}`", shown))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("`{}`: stdout not captured", shown))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow!("`{}`: stderr not captured", shown))?;

        let sink = Arc::new(Mutex::new(Captured::default()));
        let finish = async {
            let (out_res, err_res) = tokio::join!(drain(stdout, sink.clone(), true), drain(stderr, sink.clone(), false));
            if let Err(e) = out_res.and(err_res) {
                warn!(cmd = %shown, error = %e, "reading subprocess output");
            }
            child.wait().await
        };
        let status = match spec.timeout {
            Some(t) => match tokio::time::timeout(t, finish).await {
                Ok(s) => s,
                Err(_) => return Err(anyhow!("`{}` timed out after {}s", shown, t.as_secs())),
            },
            None => finish.await,
        }
        .with_context(|| format!("waiting for `{}`", shown))?;

        let cap = std::mem::take(&mut *sink.lock().await);
        debug!(cmd = %shown, code = ?status.code(), bytes = cap.combined.len(), "subprocess finished");
        Ok(CommandOutput { combined: cap.combined, stdout: cap.stdout, exit_code: status.code() })
    }
}
