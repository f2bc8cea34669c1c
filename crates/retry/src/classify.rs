//! Failure classification over opaque command output.
//!
//! Patterns live in a table so new transient signatures can be added without
//! touching the retry loop. Transient patterns are checked before fatal ones:
//! webhook-not-ready errors often carry "not found" text while still being
//! worth another attempt.

use regex::RegexSet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Fatal,
    Transient,
}

/// Decides whether a failed attempt is worth repeating.
pub trait Classifier: Send + Sync {
    fn classify(&self, output: &str, error: &str) -> FailureClass;
}

impl<F> Classifier for F
where
    F: Fn(&str, &str) -> FailureClass + Send + Sync,
{
    fn classify(&self, output: &str, error: &str) -> FailureClass {
        self(output, error)
    }
}

pub const TRANSIENT_PATTERNS: &[&str] = &[
    r"connection reset",
    r"connection refused",
    r"broken pipe",
    r"handshake timeout",
    r"i/o timeout",
    r"deadline exceeded",
    r"timed? ?out awaiting",
    r"request timed out",
    r"\b50[0234]\b",
    r"internal server error",
    r"bad gateway",
    r"service unavailable",
    r"gateway timeout",
    r"no such host",
    r"temporary failure in name resolution",
    r"server misbehaving",
    r"too many requests",
    r"\b429\b",
    r"throttl",
    r"failed calling webhook",
    r"no endpoints available",
    r"unexpected eof",
];

pub const FATAL_PATTERNS: &[&str] = &[
    r"not found",
    r"forbidden",
    r"unauthorized",
    r"already exists",
    r"is invalid",
    r"invalid value",
    r"schema",
    r"unknown field",
];

/// Case-insensitive regex table. Output matching none of the patterns is
/// `unmatched` (fatal by default).
pub struct PatternClassifier {
    transient: RegexSet,
    fatal: RegexSet,
    unmatched: FailureClass,
}

impl PatternClassifier {
    pub fn new(transient: &[&str], fatal: &[&str]) -> Result<Self, regex::Error> {
        let ci = |xs: &[&str]| xs.iter().map(|p| format!("(?i){}", p)).collect::<Vec<_>>();
        Ok(Self { transient: RegexSet::new(ci(transient))?, fatal: RegexSet::new(ci(fatal))?, unmatched: FailureClass::Fatal })
    }

    pub fn with_unmatched(mut self, class: FailureClass) -> Self {
        self.unmatched = class;
        self
    }

    /// First transient pattern matching `text`, for diagnostics.
    pub fn transient_match(&self, text: &str) -> Option<String> {
        self.transient.matches(text).iter().next().map(|i| self.transient.patterns()[i].trim_start_matches("(?i)").to_string())
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        // The built-in tables are constant and known to compile.
        let transient = RegexSet::new(TRANSIENT_PATTERNS.iter().map(|p| format!("(?i){}", p))).unwrap_or_else(|_| RegexSet::empty());
        let fatal = RegexSet::new(FATAL_PATTERNS.iter().map(|p| format!("(?i){}", p))).unwrap_or_else(|_| RegexSet::empty());
        Self { transient, fatal, unmatched: FailureClass::Fatal }
    }
}

impl Classifier for PatternClassifier {
    fn classify(&self, output: &str, error: &str) -> FailureClass {
        for text in [error, output] {
            if self.transient.is_match(text) {
                return FailureClass::Transient;
            }
        }
        for text in [error, output] {
            if self.fatal.is_match(text) {
                return FailureClass::Fatal;
            }
        }
        self.unmatched
    }
}

/// Never retry.
pub fn always_fatal(_: &str, _: &str) -> FailureClass {
    FailureClass::Fatal
}

/// Always retry until attempts run out.
pub fn always_transient(_: &str, _: &str) -> FailureClass {
    FailureClass::Transient
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_blips_are_transient() {
        let c = PatternClassifier::default();
        let cases = [
            "read tcp 10.0.0.1:443: read: connection reset by peer",
            "net/http: TLS handshake timeout",
            "context deadline exceeded",
            "Error from server (InternalError): Internal Server Error",
            "dial tcp: lookup api.example: no such host",
            "the server has received too many requests",
            "Internal error occurred: failed calling webhook \"default.azuremanagedcontrolplane\"",
            "HTTP 503",
        ];
        for out in cases {
            assert_eq!(c.classify(out, ""), FailureClass::Transient, "{out}");
        }
    }

    #[test]
    fn permanent_conditions_are_fatal() {
        let c = PatternClassifier::default();
        for err in [
            "clusters.cluster.x-k8s.io \"c1\" not found",
            "User \"x\" cannot get resource: forbidden",
            "Unauthorized",
            "AzureManagedControlPlane.infrastructure \"c1\" is invalid: spec.version",
            "namespaces \"x\" already exists",
        ] {
            assert_eq!(c.classify("", err), FailureClass::Fatal, "{err}");
        }
    }

    #[test]
    fn unmatched_output_defaults_to_fatal() {
        let c = PatternClassifier::default();
        assert_eq!(c.classify("something odd", "exit status 1"), FailureClass::Fatal);
        let lenient = PatternClassifier::default().with_unmatched(FailureClass::Transient);
        assert_eq!(lenient.classify("something odd", ""), FailureClass::Transient);
    }

    #[test]
    fn custom_table_and_closure_classifiers() {
        let c = PatternClassifier::new(&["quota pending"], &["denied"]).unwrap();
        assert_eq!(c.classify("Quota Pending for region", ""), FailureClass::Transient);
        assert_eq!(c.classify("", "access denied"), FailureClass::Fatal);
        assert_eq!(c.transient_match("quota pending"), Some("quota pending".to_string()));

        let f = |out: &str, _: &str| if out.contains("retry") { FailureClass::Transient } else { FailureClass::Fatal };
        assert_eq!(Classifier::classify(&f, "please retry", ""), FailureClass::Transient);
    }
}
