//! RFC-1123 naming rules and composite length limits.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Max length of `user-env`.
pub const DOMAIN_PREFIX_MAX: usize = 15;
/// Max length of `cluster_prefix-ea`.
pub const EXTERNAL_AUTH_MAX: usize = 15;
/// RFC-1123 subdomain upper bound.
pub const SUBDOMAIN_MAX: usize = 253;

/// One violated naming rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameViolation {
    pub field: String,
    pub value: String,
    pub rule: String,
}

impl NameViolation {
    pub fn new(field: &str, value: &str, rule: impl Into<String>) -> Self {
        Self { field: field.to_string(), value: value.to_string(), rule: rule.into() }
    }
}

impl fmt::Display for NameViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?}: {}", self.field, self.value, self.rule)
    }
}

/// Lowercase alphanumerics and `-`, starting and ending alphanumeric, non-empty.
pub fn validate_name(field: &str, value: &str) -> Result<(), NameViolation> {
    if value.is_empty() {
        return Err(NameViolation::new(field, value, "must not be empty"));
    }
    if value.len() > SUBDOMAIN_MAX {
        return Err(NameViolation::new(field, value, format!("longer than {} characters", SUBDOMAIN_MAX)));
    }
    if let Some(bad) = value.chars().find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')) {
        return Err(NameViolation::new(
            field,
            value,
            format!("invalid character {:?} (allowed: lowercase alphanumerics and '-')", bad),
        ));
    }
    let first = value.as_bytes()[0];
    let last = value.as_bytes()[value.len() - 1];
    if first == b'-' || last == b'-' {
        return Err(NameViolation::new(field, value, "must start and end with an alphanumeric character"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dns_labels() {
        for ok in ["a", "kstage-20240101120000", "abc123", "x-y-z"] {
            assert!(validate_name("f", ok).is_ok(), "{ok}");
        }
    }

    #[test]
    fn rejects_bad_shapes() {
        let cases = [
            ("", "empty"),
            ("-abc", "start"),
            ("abc-", "end"),
            ("Abc", "character"),
            ("a_b", "character"),
            ("a.b", "character"),
        ];
        for (v, want) in cases {
            let err = validate_name("ns", v).unwrap_err();
            assert!(err.rule.contains(want), "{v}: {}", err.rule);
            assert_eq!(err.field, "ns");
        }
    }

    #[test]
    fn rejects_overlong() {
        let long = "a".repeat(SUBDOMAIN_MAX + 1);
        assert!(validate_name("ns", &long).is_err());
    }
}
