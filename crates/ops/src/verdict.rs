//! Success/failure judgement over opaque tool output.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    Success,
    Failure(String),
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Success)
    }
}

/// Judge a tool run from its text and exit status.
///
/// Order: an error marker fails regardless of exit status; then a non-zero
/// exit fails; then, when success markers are given, at least one must appear.
/// Output that carries neither kind of marker is a failure. Matching is
/// case-insensitive.
pub fn judge_output(text: &str, exit_ok: bool, success_markers: &[&str], error_markers: &[&str]) -> Verdict {
    let lower = text.to_lowercase();
    if let Some(m) = error_markers.iter().find(|m| lower.contains(&m.to_lowercase())) {
        return Verdict::Failure(format!("output contains error marker {:?}", m));
    }
    if !exit_ok {
        return Verdict::Failure(format!("non-zero exit; last output: {}", last_line(text)));
    }
    if success_markers.is_empty() || success_markers.iter().any(|m| lower.contains(&m.to_lowercase())) {
        return Verdict::Success;
    }
    Verdict::Failure(format!(
        "no success marker ({}) in output; last output: {}",
        success_markers.join(", "),
        last_line(text)
    ))
}

fn last_line(text: &str) -> &str {
    text.lines().rev().find(|l| !l.trim().is_empty()).map(str::trim).unwrap_or("<empty>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_marker_beats_success_marker_and_exit() {
        let v = judge_output("cluster created\nError: quota exceeded", true, &["created"], &["error:"]);
        assert!(matches!(v, Verdict::Failure(r) if r.contains("error:")));
    }

    #[test]
    fn non_zero_exit_fails_even_with_success_text() {
        let v = judge_output("created\n", false, &["created"], &[]);
        assert!(!v.is_success());
    }

    #[test]
    fn ambiguous_output_is_failure() {
        let v = judge_output("doing things\n", true, &["ready"], &["error"]);
        match v {
            Verdict::Failure(r) => assert!(r.contains("no success marker") && r.contains("doing things")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn success_marker_or_no_markers_succeeds() {
        assert!(judge_output("Cluster READY", true, &["ready"], &["error"]).is_success());
        assert!(judge_output("", true, &[], &[]).is_success());
    }
}
