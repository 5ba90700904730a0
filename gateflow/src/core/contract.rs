//! Change-request document contract.
//!
//! A change request must carry five sections with real content. Headings may
//! be markdown (`## Scope`) or inline labels (`Scope: api only`).

use serde::{Deserialize, Serialize};

/// Upper bound on a change-request document.
pub const MAX_CHANGE_REQUEST_BYTES: usize = 64 * 1024;

const PLACEHOLDERS: [&str; 5] = ["todo", "tbd", "-", "n/a", "na"];

/// Required sections and the normalized labels that introduce them.
const SECTIONS: [(&str, &[&str]); 5] = [
    ("Objective", &["objective"]),
    ("Scope", &["scope"]),
    ("Out of scope", &["out of scope"]),
    ("Definition of done", &["definition of done", "done criteria"]),
    ("Risks", &["risks", "risk"]),
];

/// Outcome of validating a change-request document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractReport {
    pub ok: bool,
    pub issues: Vec<String>,
}

impl ContractReport {
    fn from_issues(issues: Vec<String>) -> Self {
        Self {
            ok: issues.is_empty(),
            issues,
        }
    }
}

pub fn validate_change_request(bytes: &[u8]) -> ContractReport {
    if bytes.len() > MAX_CHANGE_REQUEST_BYTES {
        return ContractReport::from_issues(vec![format!(
            "change request is too large ({} bytes, limit {MAX_CHANGE_REQUEST_BYTES})",
            bytes.len()
        )]);
    }
    let Ok(text) = std::str::from_utf8(bytes) else {
        return ContractReport::from_issues(vec!["change request is not valid UTF-8".to_string()]);
    };
    if text.trim().is_empty() {
        return ContractReport::from_issues(vec!["change request is empty".to_string()]);
    }

    let mut bodies: [Option<Vec<&str>>; 5] = Default::default();
    let mut current: Option<usize> = None;
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix('#') {
            let label = normalize(heading.trim_start_matches('#'));
            current = section_index(&label);
            if let Some(idx) = current {
                bodies[idx].get_or_insert_with(Vec::new);
            }
            continue;
        }
        if let Some((label, rest)) = trimmed.split_once(':')
            && let Some(idx) = section_index(&normalize(label))
        {
            current = Some(idx);
            let body = bodies[idx].get_or_insert_with(Vec::new);
            body.push(rest);
            continue;
        }
        if let Some(idx) = current {
            bodies[idx].get_or_insert_with(Vec::new).push(line);
        }
    }

    let mut issues = Vec::new();
    for (idx, (name, _)) in SECTIONS.iter().enumerate() {
        match &bodies[idx] {
            None => issues.push(format!("missing required section: {name}")),
            Some(lines) if !has_real_content(lines) => {
                issues.push(format!("section has empty or placeholder content: {name}"));
            }
            Some(_) => {}
        }
    }
    ContractReport::from_issues(issues)
}

fn section_index(label: &str) -> Option<usize> {
    SECTIONS
        .iter()
        .position(|(_, aliases)| aliases.contains(&label))
}

/// Lowercase, punctuation to spaces, collapsed whitespace.
fn normalize(label: &str) -> String {
    let spaced: String = label
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn has_real_content(lines: &[&str]) -> bool {
    lines.iter().any(|line| {
        let trimmed = line.trim();
        if trimmed.is_empty() || is_placeholder(trimmed) {
            return false;
        }
        let item = trimmed
            .trim_start_matches(['-', '*', '+'])
            .trim_start()
            .trim_start_matches("[ ]")
            .trim_start_matches("[x]")
            .trim();
        !item.is_empty() && !is_placeholder(item)
    })
}

fn is_placeholder(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    PLACEHOLDERS.contains(&lowered.trim_end_matches('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "# Change request\n\n## Objective\nAdd retry to the fetcher.\n\n## Scope\n- src/fetch.rs\n\n## Out-of-scope\n- CLI changes\n\n## Definition of done\n- [ ] tests pass\n\n## Risks\n- slower failures\n";

    #[test]
    fn well_formed_document_passes() {
        let report = validate_change_request(VALID.as_bytes());
        assert!(report.ok, "{:?}", report.issues);
    }

    #[test]
    fn inline_labels_and_aliases_count_as_sections() {
        let doc = "Objective: add retry\nScope: fetcher\nOut of scope: cli\nDone criteria: green ci\nRisk: latency\n";
        let report = validate_change_request(doc.as_bytes());
        assert!(report.ok, "{:?}", report.issues);
    }

    #[test]
    fn missing_and_placeholder_sections_are_listed() {
        let doc = "## Objective\nTBD\n\n## Scope\n- \n- todo\n\n## Out of scope\nnone planned\n\n## Risks\nN/A\n";
        let report = validate_change_request(doc.as_bytes());
        assert!(!report.ok);
        assert_eq!(
            report.issues,
            vec![
                "section has empty or placeholder content: Objective".to_string(),
                "section has empty or placeholder content: Scope".to_string(),
                "missing required section: Definition of done".to_string(),
                "section has empty or placeholder content: Risks".to_string(),
            ]
        );
    }

    #[test]
    fn empty_oversized_and_binary_documents_fail() {
        assert!(!validate_change_request(b"  \n").ok);
        assert!(!validate_change_request(&[0xff, 0xfe, 0x00]).ok);
        let big = vec![b'a'; MAX_CHANGE_REQUEST_BYTES + 1];
        let report = validate_change_request(&big);
        assert!(report.issues[0].contains("too large"));
    }
}
