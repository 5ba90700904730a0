//! File-backed change-request validation.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

use crate::core::contract::{ContractReport, MAX_CHANGE_REQUEST_BYTES, validate_change_request};

/// Validate the change request at `path`.
///
/// A missing file is reported as a contract issue rather than an error, so
/// callers can treat it like any other failed check.
pub fn validate_change_request_file(path: &Path) -> Result<ContractReport> {
    if !path.is_file() {
        return Ok(ContractReport {
            ok: false,
            issues: vec![format!("change request not found: {}", path.display())],
        });
    }
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    // One byte past the limit is enough for the size check to trip.
    let mut bytes = Vec::new();
    file.take(MAX_CHANGE_REQUEST_BYTES as u64 + 1)
        .read_to_end(&mut bytes)
        .with_context(|| format!("read {}", path.display()))?;
    Ok(validate_change_request(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_an_issue() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = validate_change_request_file(&temp.path().join("change-request.md"))
            .expect("validate");
        assert!(!report.ok);
        assert!(report.issues[0].starts_with("change request not found"));
    }

    #[test]
    fn oversized_file_is_rejected_without_reading_it_all() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("change-request.md");
        std::fs::write(&path, "x".repeat(MAX_CHANGE_REQUEST_BYTES * 2)).expect("write");
        let report = validate_change_request_file(&path).expect("validate");
        assert!(!report.ok);
        assert!(report.issues[0].contains("too large"));
    }

    #[test]
    fn inline_labels_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("cr.md");
        std::fs::write(
            &path,
            "Objective: add caching\nScope: src/cache.rs\nOut of scope: eviction\nDone criteria: tests pass\nRisk: stale reads\n",
        )
        .expect("write");
        let report = validate_change_request_file(&path).expect("validate");
        assert!(report.ok, "{:?}", report.issues);
    }
}
