//! kstage core types: desired configuration, persisted state, drift decisions
//! and the resource phases the reconciler interprets.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod naming;

pub use naming::{validate_name, NameViolation, DOMAIN_PREFIX_MAX, EXTERNAL_AUTH_MAX};

/// Which precedence rung produced `DesiredConfig::resolved_namespace`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceSource {
    Override,
    Persisted,
    Generated,
}

/// Fully resolved configuration for one process lifetime. Never mutated after resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DesiredConfig {
    pub namespace_prefix: String,
    pub resolved_namespace: String,
    pub namespace_source: NamespaceSource,
    pub cluster_name_prefix: String,
    pub user_identifier: String,
    pub environment_identifier: String,
    pub region: String,
    #[serde(with = "secs")]
    pub deployment_timeout: Duration,
    #[serde(with = "secs")]
    pub controller_timeout: Duration,
}

impl DesiredConfig {
    /// `user-env`, bounded by [`DOMAIN_PREFIX_MAX`].
    pub fn domain_prefix(&self) -> String {
        format!("{}-{}", self.user_identifier, self.environment_identifier)
    }

    /// Name of the cloud resource container (resource group) backing the cluster.
    pub fn resource_group(&self) -> String {
        self.cluster_name_prefix.clone()
    }

    pub fn cluster_name(&self) -> String {
        self.cluster_name_prefix.clone()
    }

    /// `prefix-ea`, bounded by [`EXTERNAL_AUTH_MAX`].
    pub fn external_auth_id(&self) -> String {
        format!("{}-ea", self.cluster_name_prefix)
    }

    /// Check every naming rule and return all violations at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();
        let named = [
            ("namespace_prefix", &self.namespace_prefix),
            ("resolved_namespace", &self.resolved_namespace),
            ("cluster_name_prefix", &self.cluster_name_prefix),
            ("user_identifier", &self.user_identifier),
            ("environment_identifier", &self.environment_identifier),
            ("region", &self.region),
        ];
        for (field, value) in named {
            if let Err(v) = validate_name(field, value) {
                violations.push(v);
            }
        }

        let domain = self.domain_prefix();
        if domain.len() > DOMAIN_PREFIX_MAX {
            violations.push(NameViolation::new(
                "user_identifier+environment_identifier",
                &domain,
                format!(
                    "composite length {} exceeds {} (user={:?}, env={:?})",
                    domain.len(),
                    DOMAIN_PREFIX_MAX,
                    self.user_identifier,
                    self.environment_identifier
                ),
            ));
        }
        let ea = self.external_auth_id();
        if ea.len() > EXTERNAL_AUTH_MAX {
            violations.push(NameViolation::new(
                "cluster_name_prefix+\"-ea\"",
                &ea,
                format!(
                    "composite length {} exceeds {} (cluster_prefix={:?})",
                    ea.len(),
                    EXTERNAL_AUTH_MAX,
                    self.cluster_name_prefix
                ),
            ));
        }

        if violations.is_empty() { Ok(()) } else { Err(ConfigError { violations }) }
    }
}

/// Minimal on-disk record letting later phases rebuild the same `DesiredConfig`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedState {
    pub resolved_namespace: String,
    pub namespace_prefix: String,
    pub cluster_name_prefix: String,
    pub user_identifier: String,
    pub environment_identifier: String,
    pub region: String,
    /// RFC 3339 timestamp of the write; informational only.
    #[serde(default)]
    pub written_at: String,
}

impl PersistedState {
    pub fn from_config(cfg: &DesiredConfig, written_at: String) -> Self {
        Self {
            resolved_namespace: cfg.resolved_namespace.clone(),
            namespace_prefix: cfg.namespace_prefix.clone(),
            cluster_name_prefix: cfg.cluster_name_prefix.clone(),
            user_identifier: cfg.user_identifier.clone(),
            environment_identifier: cfg.environment_identifier.clone(),
            region: cfg.region.clone(),
            written_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriftAction {
    Reuse,
    Regenerate,
}

/// Outcome of comparing generated artifacts to the desired configuration. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriftDecision {
    pub action: DriftAction,
    pub reason: String,
}

impl DriftDecision {
    pub fn reuse(reason: impl Into<String>) -> Self {
        Self { action: DriftAction::Reuse, reason: reason.into() }
    }

    pub fn regenerate(reason: impl Into<String>) -> Self {
        Self { action: DriftAction::Regenerate, reason: reason.into() }
    }

    pub fn is_reuse(&self) -> bool {
        self.action == DriftAction::Reuse
    }
}

/// Create-path phase reported by the cluster API (`status.phase`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourcePhase {
    Unknown,
    Provisioning,
    Provisioned,
    Failed,
    /// Any other phase string, kept verbatim for diagnostics.
    Other(String),
}

impl ResourcePhase {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => ResourcePhase::Unknown,
            Some(s) if s.eq_ignore_ascii_case("unknown") => ResourcePhase::Unknown,
            Some(s) if s.eq_ignore_ascii_case("pending") || s.eq_ignore_ascii_case("provisioning") => ResourcePhase::Provisioning,
            Some(s) if s.eq_ignore_ascii_case("provisioned") => ResourcePhase::Provisioned,
            Some(s) if s.eq_ignore_ascii_case("failed") => ResourcePhase::Failed,
            Some(s) => ResourcePhase::Other(s.to_string()),
        }
    }
}

impl fmt::Display for ResourcePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourcePhase::Unknown => f.write_str("Unknown"),
            ResourcePhase::Provisioning => f.write_str("Provisioning"),
            ResourcePhase::Provisioned => f.write_str("Provisioned"),
            ResourcePhase::Failed => f.write_str("Failed"),
            ResourcePhase::Other(s) => f.write_str(s),
        }
    }
}

/// Delete-path view of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Exists,
    Deleting,
    Absent,
}

impl Presence {
    pub fn is_absent(self) -> bool {
        matches!(self, Presence::Absent)
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Presence::Exists => f.write_str("exists"),
            Presence::Deleting => f.write_str("deleting"),
            Presence::Absent => f.write_str("absent"),
        }
    }
}

/// Configuration errors are fatal and must never reach a remote call.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid configuration: {}", render_violations(.violations))]
pub struct ConfigError {
    pub violations: Vec<NameViolation>,
}

fn render_violations(v: &[NameViolation]) -> String {
    v.iter().map(|x| x.to_string()).collect::<Vec<_>>().join("; ")
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

pub mod prelude {
    pub use super::{
        ConfigError, DesiredConfig, DriftAction, DriftDecision, NamespaceSource, PersistedState, Presence, ResourcePhase,
    };
}
