use std::collections::HashMap;
use std::time::Duration;

use crate::duration::parse_duration;

/// Read-only view of environment input.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;

    /// Non-empty, trimmed value.
    fn get(&self, key: &str) -> Option<String> {
        self.var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl EnvSource for HashMap<&str, &str> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).map(|s| s.to_string())
    }
}

/// Duration from `key`, falling back to `default` and recording a warning when unparsable.
pub(crate) fn duration_or<E: EnvSource + ?Sized>(env: &E, key: &str, default: Duration, warnings: &mut Vec<String>) -> Duration {
    match env.get(key) {
        None => default,
        Some(raw) => match parse_duration(&raw) {
            Ok(d) => d,
            Err(e) => {
                let msg = format!("{key}={raw:?} is not a valid duration ({e}); using default {}s", default.as_secs());
                tracing::warn!(key, value = %raw, default_secs = default.as_secs(), "unparsable duration; using default");
                warnings.push(msg);
                default
            }
        },
    }
}

pub(crate) fn u32_or<E: EnvSource + ?Sized>(env: &E, key: &str, default: u32, warnings: &mut Vec<String>) -> u32 {
    match env.get(key) {
        None => default,
        Some(raw) => match raw.parse::<u32>() {
            Ok(v) if v > 0 => v,
            _ => {
                tracing::warn!(key, value = %raw, default, "invalid positive integer; using default");
                warnings.push(format!("{key}={raw:?} is not a positive integer; using default {default}"));
                default
            }
        },
    }
}

pub(crate) fn list<E: EnvSource + ?Sized>(env: &E, key: &str) -> Option<Vec<String>> {
    env.get(key).map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
}
