//! Per-phase knobs that are not part of `DesiredConfig`: paths, tool names,
//! resource keys and retry/poll tuning.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::env::{duration_or, list, u32_or, EnvSource};

pub const DEFAULT_CLUSTER_GVK: &str = "cluster.x-k8s.io/v1beta1/Cluster";
pub const DEFAULT_DEPENDENT_GVKS: &[&str] = &[
    "infrastructure.cluster.x-k8s.io/v1beta1/AzureManagedControlPlane",
    "infrastructure.cluster.x-k8s.io/v1beta1/AzureManagedMachinePool",
    "cluster.x-k8s.io/v1beta1/MachinePool",
];
pub const DEFAULT_CONTROLLERS: &[&str] = &[
    "capi-system/capi-controller-manager",
    "capz-system/capz-controller-manager",
    "azureserviceoperator-system/azureserviceoperator-controller-manager",
];
pub const DEFAULT_TOOLS: &[&str] = &["kind", "kubectl", "az", "clusterctl"];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PhaseSettings {
    pub artifact_path: PathBuf,
    pub generate_script: PathBuf,
    pub mgmt_cluster: String,
    pub cluster_gvk: String,
    pub dependent_gvks: Vec<String>,
    /// `namespace/deployment` pairs that must be available after setup.
    pub controllers: Vec<String>,
    pub required_tools: Vec<String>,
    pub retry_attempts: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub poll_interval: Duration,
}

impl PhaseSettings {
    pub fn from_env<E: EnvSource + ?Sized>(env: &E, warnings: &mut Vec<String>) -> Self {
        let owned = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            artifact_path: env.get("KSTAGE_ARTIFACT").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("generated/cluster.yaml")),
            generate_script: env
                .get("KSTAGE_GENERATE_SCRIPT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./hack/generate-manifests.sh")),
            mgmt_cluster: env.get("KSTAGE_MGMT_CLUSTER").unwrap_or_else(|| "kstage-mgmt".to_string()),
            cluster_gvk: env.get("KSTAGE_CLUSTER_GVK").unwrap_or_else(|| DEFAULT_CLUSTER_GVK.to_string()),
            dependent_gvks: list(env, "KSTAGE_DEPENDENT_GVKS").unwrap_or_else(|| owned(DEFAULT_DEPENDENT_GVKS)),
            controllers: list(env, "KSTAGE_CONTROLLERS").unwrap_or_else(|| owned(DEFAULT_CONTROLLERS)),
            required_tools: list(env, "KSTAGE_REQUIRED_TOOLS").unwrap_or_else(|| owned(DEFAULT_TOOLS)),
            retry_attempts: u32_or(env, "KSTAGE_RETRY_ATTEMPTS", 5, warnings),
            retry_base: duration_or(env, "KSTAGE_RETRY_BASE", Duration::from_secs(5), warnings),
            retry_cap: duration_or(env, "KSTAGE_RETRY_CAP", Duration::from_secs(30), warnings),
            poll_interval: duration_or(env, "KSTAGE_POLL_INTERVAL", Duration::from_secs(10), warnings),
        }
    }

    /// Split `namespace/deployment` entries; malformed ones are skipped.
    pub fn controller_refs(&self) -> Vec<(String, String)> {
        self.controllers
            .iter()
            .filter_map(|c| c.split_once('/').map(|(ns, name)| (ns.to_string(), name.to_string())))
            .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_without_env() {
        let env: HashMap<&str, &str> = HashMap::new();
        let mut w = Vec::new();
        let s = PhaseSettings::from_env(&env, &mut w);
        assert!(w.is_empty());
        assert_eq!(s.retry_attempts, 5);
        assert_eq!(s.cluster_gvk, DEFAULT_CLUSTER_GVK);
        assert_eq!(s.controller_refs().len(), 3);
    }

    #[test]
    fn lists_and_bad_numbers() {
        let env: HashMap<&str, &str> = [
            ("KSTAGE_CONTROLLERS", "a/b, bad ,c/d"),
            ("KSTAGE_RETRY_ATTEMPTS", "zero"),
            ("KSTAGE_POLL_INTERVAL", "5s"),
        ]
        .into_iter()
        .collect();
        let mut w = Vec::new();
        let s = PhaseSettings::from_env(&env, &mut w);
        assert_eq!(s.controller_refs(), vec![("a".into(), "b".into()), ("c".into(), "d".into())]);
        assert_eq!(s.retry_attempts, 5);
        assert_eq!(s.poll_interval, Duration::from_secs(5));
        assert_eq!(w.len(), 1);
    }
}
