//! kstage configuration: resolve a [`DesiredConfig`] from environment input and
//! any persisted state left by an earlier phase.
//!
//! Namespace precedence: explicit override, then persisted state, then
//! `prefix-YYYYMMDDhhmmss`. Other naming fields: explicit env value, then
//! persisted state, then default. Resolution never writes state.

#![forbid(unsafe_code)]

use std::time::Duration;

use chrono::{DateTime, Utc};
use kstage_core::{ConfigError, DesiredConfig, NamespaceSource, PersistedState};
use kstage_persist::DeploymentStateStore;
use serde::Serialize;
use tracing::{debug, info, warn};

pub mod duration;
mod env;
pub mod settings;

pub use duration::{parse_duration, DurationParseError};
pub use env::{EnvSource, ProcessEnv};
pub use settings::PhaseSettings;

pub const ENV_NAMESPACE: &str = "KSTAGE_NAMESPACE";
pub const ENV_NAMESPACE_PREFIX: &str = "KSTAGE_NAMESPACE_PREFIX";
pub const ENV_CLUSTER_PREFIX: &str = "KSTAGE_CLUSTER_PREFIX";
pub const ENV_USER: &str = "KSTAGE_USER";
pub const ENV_ENVIRONMENT: &str = "KSTAGE_ENV";
pub const ENV_REGION: &str = "KSTAGE_REGION";
pub const ENV_DEPLOYMENT_TIMEOUT: &str = "KSTAGE_DEPLOYMENT_TIMEOUT";
pub const ENV_CONTROLLER_TIMEOUT: &str = "KSTAGE_CONTROLLER_TIMEOUT";

pub const DEFAULT_NAMESPACE_PREFIX: &str = "kstage";
pub const DEFAULT_CLUSTER_PREFIX: &str = "kstage";
pub const DEFAULT_USER: &str = "kstage";
pub const DEFAULT_ENVIRONMENT: &str = "dev";
pub const DEFAULT_REGION: &str = "eastus";
pub const DEFAULT_DEPLOYMENT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_CONTROLLER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Format of the generated namespace suffix (second granularity).
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// A validated configuration plus the non-fatal warnings gathered on the way.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub config: DesiredConfig,
    pub warnings: Vec<String>,
}

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Builds a [`DesiredConfig`]. Owned by the caller; nothing is cached between calls.
pub struct ConfigResolver<E: EnvSource> {
    env: E,
    store: Option<DeploymentStateStore>,
    clock: Clock,
}

impl ConfigResolver<ProcessEnv> {
    /// Process environment plus the default state path.
    pub fn from_process() -> Self {
        Self::new(ProcessEnv).with_store(DeploymentStateStore::open_default())
    }
}

impl<E: EnvSource> ConfigResolver<E> {
    pub fn new(env: E) -> Self {
        Self { env, store: None, clock: Box::new(Utc::now) }
    }

    pub fn with_store(mut self, store: DeploymentStateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    /// Resolve and validate. Validation failures enumerate every violated field.
    pub fn resolve(&self) -> Result<Resolution, ConfigError> {
        let mut warnings = Vec::new();
        let persisted = self.read_persisted(&mut warnings);

        let pick = |key: &str, from_state: Option<&String>, default: &str| -> String {
            self.env
                .get(key)
                .or_else(|| from_state.cloned())
                .unwrap_or_else(|| default.to_string())
        };

        let namespace_prefix = pick(ENV_NAMESPACE_PREFIX, persisted.as_ref().map(|p| &p.namespace_prefix), DEFAULT_NAMESPACE_PREFIX);
        let cluster_name_prefix =
            pick(ENV_CLUSTER_PREFIX, persisted.as_ref().map(|p| &p.cluster_name_prefix), DEFAULT_CLUSTER_PREFIX);
        let default_user = self.env.get("USER").map(|u| u.to_ascii_lowercase()).unwrap_or_else(|| DEFAULT_USER.to_string());
        let user_identifier = pick(ENV_USER, persisted.as_ref().map(|p| &p.user_identifier), &default_user);
        let environment_identifier =
            pick(ENV_ENVIRONMENT, persisted.as_ref().map(|p| &p.environment_identifier), DEFAULT_ENVIRONMENT);
        let region = pick(ENV_REGION, persisted.as_ref().map(|p| &p.region), DEFAULT_REGION);

        let (resolved_namespace, namespace_source) = match (self.env.get(ENV_NAMESPACE), persisted.as_ref()) {
            (Some(ns), _) => (ns, NamespaceSource::Override),
            (None, Some(p)) => {
                if p.namespace_prefix != namespace_prefix {
                    warn!(persisted = %p.namespace_prefix, current = %namespace_prefix, "namespace prefix changed; keeping persisted namespace");
                    warnings.push(format!(
                        "namespace prefix {:?} differs from persisted {:?}; persisted namespace {:?} is kept",
                        namespace_prefix, p.namespace_prefix, p.resolved_namespace
                    ));
                }
                (p.resolved_namespace.clone(), NamespaceSource::Persisted)
            }
            (None, None) => (generate_namespace(&namespace_prefix, (self.clock)()), NamespaceSource::Generated),
        };

        let deployment_timeout =
            env::duration_or(&self.env, ENV_DEPLOYMENT_TIMEOUT, DEFAULT_DEPLOYMENT_TIMEOUT, &mut warnings);
        let controller_timeout =
            env::duration_or(&self.env, ENV_CONTROLLER_TIMEOUT, DEFAULT_CONTROLLER_TIMEOUT, &mut warnings);

        let config = DesiredConfig {
            namespace_prefix,
            resolved_namespace,
            namespace_source,
            cluster_name_prefix,
            user_identifier,
            environment_identifier,
            region,
            deployment_timeout,
            controller_timeout,
        };
        config.validate()?;
        info!(
            namespace = %config.resolved_namespace,
            source = ?config.namespace_source,
            cluster = %config.cluster_name_prefix,
            "configuration resolved"
        );
        Ok(Resolution { config, warnings })
    }

    fn read_persisted(&self, warnings: &mut Vec<String>) -> Option<PersistedState> {
        let store = self.store.as_ref()?;
        match store.read() {
            Ok(found) => {
                debug!(path = %store.path().display(), found = found.is_some(), "persisted state read");
                found
            }
            Err(e) => {
                warn!(error = %e, "ignoring unreadable deployment state");
                warnings.push(format!("ignoring unreadable deployment state: {e}"));
                None
            }
        }
    }
}

/// `prefix-YYYYMMDDhhmmss`.
pub fn generate_namespace(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}", prefix, now.format(TIMESTAMP_FORMAT))
}
