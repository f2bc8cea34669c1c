use std::fmt;

use kstage_core::Presence;
use serde::Serialize;

/// Objects of one dependent kind still present in the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependentStatus {
    pub gvk: String,
    pub names: Vec<String>,
}

impl DependentStatus {
    pub fn kind(&self) -> &str {
        self.gvk.rsplit('/').next().unwrap_or(&self.gvk)
    }
}

/// One deletion-progress sample: what still blocks a complete teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionStatus {
    pub cluster: String,
    pub primary: Presence,
    pub dependents: Vec<DependentStatus>,
    pub container: String,
    pub container_exists: bool,
}

impl DeletionStatus {
    pub fn is_complete(&self) -> bool {
        self.primary.is_absent() && self.dependents.iter().all(|d| d.names.is_empty()) && !self.container_exists
    }

    /// Human-readable list of what is still present.
    pub fn blocking(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.primary.is_absent() {
            out.push(format!("cluster {} {}", self.cluster, self.primary));
        }
        for d in self.dependents.iter().filter(|d| !d.names.is_empty()) {
            out.push(format!("{} {}", d.kind(), d.names.join(",")));
        }
        if self.container_exists {
            out.push(format!("resource group {} exists", self.container));
        }
        out
    }
}

impl fmt::Display for DeletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let blocking = self.blocking();
        if blocking.is_empty() {
            write!(f, "cluster {} and resource group {} are gone", self.cluster, self.container)
        } else {
            write!(f, "waiting on: {}", blocking.join("; "))
        }
    }
}
