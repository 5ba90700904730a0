//! Deterministic helpers behind the diagnose, propose and risk stages.

use std::collections::BTreeSet;
use std::path::{Component, Path};
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{ProposedStep, RiskLevel};

pub const NO_FAILURE_PARSED: &str = "no explicit failure parsed";

const FAILURE_MARKERS: [&str; 5] = ["FAILED", "ERROR", "panicked", "error:", "error["];

static DIFF_TARGET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\+\+\+ b/(.+?)\r?$").expect("valid diff target regex"));

/// Lines from test output that look like failures. Never empty.
pub fn diagnose_failures(stdout: &str, stderr: &str) -> Vec<String> {
    let mut found: Vec<String> = stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .filter(|line| FAILURE_MARKERS.iter().any(|m| line.contains(m)))
        .map(str::to_string)
        .collect();
    found.dedup();
    if found.is_empty()
        && let Some(first) = stderr.lines().map(str::trim).find(|l| !l.is_empty())
    {
        found.push(first.to_string());
    }
    if found.is_empty() {
        found.push(NO_FAILURE_PARSED.to_string());
    }
    found
}

/// New-side paths in the order the diff touches them, repeats included.
fn diff_targets(diff: &str) -> impl Iterator<Item = String> + '_ {
    DIFF_TARGET
        .captures_iter(diff)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().split('\t').next().unwrap_or("").trim().to_string())
        .filter(|p| !p.is_empty())
}

/// New-side paths touched by a unified diff, sorted and de-duplicated.
pub fn diff_paths(diff: &str) -> Vec<String> {
    diff_targets(diff)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Files the change touches: applied files when known, else the working diff.
pub fn impacted_paths(applied_files: &[String], current_diff: &str) -> Vec<String> {
    if applied_files.is_empty() {
        return diff_paths(current_diff);
    }
    applied_files
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn classify_risk(impacted: usize) -> RiskLevel {
    match impacted {
        0 => RiskLevel::Low,
        1..=3 => RiskLevel::Medium,
        _ => RiskLevel::High,
    }
}

/// True for a repository-relative path that cannot escape the repository.
pub fn is_safe_relative_path(path: &str) -> bool {
    if path.trim().is_empty() || path.contains('\0') || path.contains('\\') {
        return false;
    }
    // Drive prefixes such as `C:` are not caught by `Path::is_absolute` on unix.
    if path.len() >= 2 && path.as_bytes()[1] == b':' {
        return false;
    }
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Single step proposed when no usable generator output exists.
pub fn fallback_step(applied_files: &[String], current_diff: &str) -> ProposedStep {
    if let Some(first) = applied_files.first() {
        return ProposedStep {
            id: "manual-1".to_string(),
            file: first.clone(),
            intent: "review-applied-patch".to_string(),
            reason: "Previously applied changes need a follow-up patch.".to_string(),
        };
    }
    let file = diff_targets(current_diff)
        .next()
        .unwrap_or_else(|| "tests/".to_string());
    ProposedStep {
        id: "step-1".to_string(),
        file,
        intent: "implement-story-change".to_string(),
        reason: "Deterministic fallback derived from the working tree.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnose_prefers_marker_lines() {
        let stdout = "running 2 tests\ntest a ... ok\ntest b ... FAILED\n";
        let lines = diagnose_failures(stdout, "");
        assert_eq!(lines, vec!["test b ... FAILED".to_string()]);
    }

    #[test]
    fn diagnose_falls_back_to_stderr_then_generic_line() {
        assert_eq!(
            diagnose_failures("all good", "\n  exit status 3\n"),
            vec!["exit status 3".to_string()]
        );
        assert_eq!(diagnose_failures("", ""), vec![NO_FAILURE_PARSED.to_string()]);
    }

    #[test]
    fn diff_paths_are_sorted_and_unique() {
        let diff = "--- a/b.rs\n+++ b/b.rs\n@@ -1 +1 @@\n-x\n+y\n--- a/a.rs\n+++ b/a.rs\n--- a/b.rs\n+++ b/b.rs\n";
        assert_eq!(diff_paths(diff), vec!["a.rs".to_string(), "b.rs".to_string()]);
    }

    #[test]
    fn risk_thresholds() {
        assert_eq!(classify_risk(0), RiskLevel::Low);
        assert_eq!(classify_risk(3), RiskLevel::Medium);
        assert_eq!(classify_risk(4), RiskLevel::High);
    }

    #[test]
    fn unsafe_paths_are_detected() {
        for bad in ["", "/etc/passwd", "../x", "src/../../x", "C:\\x", "a\0b", "src\\main.rs"] {
            assert!(!is_safe_relative_path(bad), "{bad:?}");
        }
        for good in ["src/lib.rs", "./README.md", "tests/"] {
            assert!(is_safe_relative_path(good), "{good:?}");
        }
    }

    #[test]
    fn fallback_step_prefers_applied_then_diff_then_tests_dir() {
        let step = fallback_step(&["src/a.rs".to_string()], "");
        assert_eq!((step.id.as_str(), step.file.as_str()), ("manual-1", "src/a.rs"));

        let step = fallback_step(&[], "--- a/src/b.rs\n+++ b/src/b.rs\n");
        assert_eq!((step.id.as_str(), step.file.as_str()), ("step-1", "src/b.rs"));

        assert_eq!(fallback_step(&[], "").file, "tests/");
    }

    #[test]
    fn fallback_step_takes_first_path_in_diff_order() {
        let diff = "--- a/zeta.rs\n+++ b/zeta.rs\n@@ -1 +1 @@\n-a\n+b\n--- a/alpha.rs\n+++ b/alpha.rs\n";
        assert_eq!(fallback_step(&[], diff).file, "zeta.rs");
        assert_eq!(diff_paths(diff), vec!["alpha.rs".to_string(), "zeta.rs".to_string()]);
    }
}
