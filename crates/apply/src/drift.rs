//! Drift detection: are previously generated manifests still valid for the
//! current configuration?
//!
//! Only a couple of scalar fields are read, from the first document of a known
//! kind; the manifest schema belongs to the generator. Anything unexpected
//! yields `Regenerate`.

use std::path::Path;

use anyhow::{Context, Result};
use kstage_core::{DesiredConfig, DriftDecision};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, info};

/// Where to find the fields compared against `DesiredConfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftProbe {
    pub kind: String,
    /// JSON pointer to the naming prefix (compared to `cluster_name_prefix`).
    pub prefix_pointer: String,
    /// JSON pointer to the namespace (compared to `resolved_namespace`).
    pub namespace_pointer: String,
}

impl Default for DriftProbe {
    fn default() -> Self {
        Self {
            kind: "Cluster".to_string(),
            prefix_pointer: "/metadata/name".to_string(),
            namespace_pointer: "/metadata/namespace".to_string(),
        }
    }
}

/// Pure decision function; no side effects.
#[derive(Debug, Clone, Default)]
pub struct DriftDetector {
    probe: DriftProbe,
}

impl DriftDetector {
    pub fn new(probe: DriftProbe) -> Self {
        Self { probe }
    }

    pub fn check(&self, artifact: &Path, desired: &DesiredConfig) -> DriftDecision {
        let raw = match std::fs::read_to_string(artifact) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return DriftDecision::regenerate(format!("no generated artifact at {}", artifact.display()));
            }
            Err(e) => {
                return DriftDecision::regenerate(format!("cannot read {}: {}", artifact.display(), e));
            }
        };
        let decision = self.check_str(&raw, desired);
        info!(artifact = %artifact.display(), action = ?decision.action, reason = %decision.reason, "drift check");
        decision
    }

    pub fn check_str(&self, yaml: &str, desired: &DesiredConfig) -> DriftDecision {
        let doc = match find_document(yaml, &self.probe.kind) {
            Ok(Some(doc)) => doc,
            Ok(None) => return DriftDecision::regenerate(format!("no {} document in artifact", self.probe.kind)),
            Err(e) => return DriftDecision::regenerate(format!("artifact does not parse: {:#}", e)),
        };

        let field = |ptr: &str| doc.pointer(ptr).and_then(|v| v.as_str()).map(|s| s.to_string());
        let mut mismatches = Vec::new();
        compare(&mut mismatches, "name prefix", field(&self.probe.prefix_pointer), &desired.cluster_name_prefix);
        compare(&mut mismatches, "namespace", field(&self.probe.namespace_pointer), &desired.resolved_namespace);

        if mismatches.is_empty() {
            debug!(kind = %self.probe.kind, "artifact matches desired config");
            DriftDecision::reuse(format!(
                "{} matches name prefix {:?} and namespace {:?}",
                self.probe.kind, desired.cluster_name_prefix, desired.resolved_namespace
            ))
        } else {
            DriftDecision::regenerate(mismatches.join("; "))
        }
    }
}

fn compare(out: &mut Vec<String>, what: &str, found: Option<String>, want: &str) {
    match found {
        Some(v) if v == want => {}
        Some(v) => out.push(format!("{} mismatch: artifact has {:?}, desired {:?}", what, v, want)),
        None => out.push(format!("{} missing from artifact (desired {:?})", what, want)),
    }
}

/// First document in a multi-document stream whose `kind` equals `kind`.
pub fn find_document(yaml: &str, kind: &str) -> Result<Option<Json>> {
    for (pos, de) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(de).with_context(|| format!("parsing YAML document #{}", pos))?;
        if val.get("kind").and_then(|k| k.as_str()) == Some(kind) {
            return Ok(Some(serde_json::to_value(val).context("converting YAML to JSON")?));
        }
    }
    Ok(None)
}

/// Cluster name embedded in generated manifests (`metadata.name` of the `Cluster` document).
pub fn extract_cluster_name(artifact: &Path) -> Result<Option<String>> {
    let raw = std::fs::read_to_string(artifact).with_context(|| format!("reading {}", artifact.display()))?;
    let probe = DriftProbe::default();
    Ok(find_document(&raw, &probe.kind)?
        .and_then(|d| d.pointer(&probe.prefix_pointer).and_then(|v| v.as_str()).map(|s| s.to_string())))
}
