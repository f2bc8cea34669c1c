//! kstage persistence: the deployment state file that lets independently
//! invoked phases agree on identifiers they did not create.
//!
//! One JSON object at a well-known path. Absence means "no prior run".
//! No file locking: a single active run per state path is assumed.

#![forbid(unsafe_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

use kstage_core::{validate_name, DesiredConfig, PersistedState};
use metrics::{counter, histogram};
use tracing::{debug, info};

pub const STATE_PATH_ENV: &str = "KSTAGE_STATE_PATH";
pub const STATE_FILE_NAME: &str = "deployment-state.json";

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("encoding state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// File-backed store for [`PersistedState`].
#[derive(Debug, Clone)]
pub struct DeploymentStateStore {
    path: PathBuf,
}

impl DeploymentStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `KSTAGE_STATE_PATH` or `$HOME/.kstage/deployment-state.json`.
    pub fn open_default() -> Self {
        let path = std::env::var(STATE_PATH_ENV).map(PathBuf::from).unwrap_or_else(|_| default_state_path());
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize `cfg` and atomically replace the state file. Safe to repeat.
    pub fn write(&self, cfg: &DesiredConfig) -> Result<PersistedState, StateError> {
        let started = std::time::Instant::now();
        let record = PersistedState::from_config(cfg, chrono::Utc::now().to_rfc3339());
        let mut body = serde_json::to_string_pretty(&record)?;
        body.push('\n');

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| self.io_err(e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| self.io_err(e))?;
        restrict_permissions(tmp.as_file()).map_err(|e| self.io_err(e))?;
        tmp.write_all(body.as_bytes()).map_err(|e| self.io_err(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_err(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_err(e.error))?;

        histogram!("state_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("state_write_total", 1u64);
        info!(path = %self.path.display(), namespace = %record.resolved_namespace, "deployment state written");
        Ok(record)
    }

    /// `Ok(None)` when the file does not exist. A file that does not parse, or
    /// whose namespace is not a valid name, is reported as `Corrupt`.
    pub fn read(&self) -> Result<Option<PersistedState>, StateError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no deployment state");
                return Ok(None);
            }
            Err(e) => return Err(self.io_err(e)),
        };
        let record: PersistedState = serde_json::from_str(&raw).map_err(|e| StateError::Corrupt {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        if let Err(v) = validate_name("resolved_namespace", &record.resolved_namespace) {
            return Err(StateError::Corrupt { path: self.path.display().to_string(), reason: v.to_string() });
        }
        counter!("state_read_total", 1u64);
        Ok(Some(record))
    }

    /// Remove the state file; an already-absent file is success.
    pub fn delete(&self) -> Result<bool, StateError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "deployment state removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn io_err(&self, source: std::io::Error) -> StateError {
        StateError::Io { path: self.path.display().to_string(), source }
    }
}

#[cfg(unix)]
fn restrict_permissions(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}

fn default_state_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".kstage");
        p.push(STATE_FILE_NAME);
        return p;
    }
    // Fallback to current directory
    PathBuf::from(STATE_FILE_NAME)
}
