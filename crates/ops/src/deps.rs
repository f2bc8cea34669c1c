//! Required-tool lookup on `PATH`.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStatus {
    pub name: String,
    pub path: Option<PathBuf>,
}

impl ToolStatus {
    pub fn found(&self) -> bool {
        self.path.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    pub tools: Vec<ToolStatus>,
}

impl DependencyReport {
    pub fn missing(&self) -> Vec<&str> {
        self.tools.iter().filter(|t| !t.found()).map(|t| t.name.as_str()).collect()
    }

    pub fn all_found(&self) -> bool {
        self.tools.iter().all(ToolStatus::found)
    }
}

/// Resolve every tool, reporting all missing ones together.
pub fn check_dependencies<S: AsRef<str>>(tools: &[S]) -> DependencyReport {
    let tools = tools
        .iter()
        .map(|t| {
            let name = t.as_ref().to_string();
            match which::which(&name) {
                Ok(path) => {
                    debug!(tool = %name, path = %path.display(), "found");
                    ToolStatus { name, path: Some(path) }
                }
                Err(e) => {
                    warn!(tool = %name, error = %e, "required tool not on PATH");
                    ToolStatus { name, path: None }
                }
            }
        })
        .collect();
    DependencyReport { tools }
}
