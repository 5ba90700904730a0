//! Unified-diff parsing and line-exact hunk application.
//!
//! Parsing is count-driven: a hunk body is read until the `@@` header's old
//! and new counts are consumed, so removed lines that happen to start with
//! `--` are never mistaken for file headers. Application never fuzzes; a
//! context or removal line must match the target exactly.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::errors::PatchError;

pub const NULL_PATH: &str = "/dev/null";

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("valid hunk header regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTag {
    Context,
    Add,
    Remove,
    /// `\ No newline at end of file`
    NoNewline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkLine {
    pub tag: LineTag,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// Fails unless the body's line tallies agree with the header.
    pub fn check_counts(&self) -> Result<(), PatchError> {
        let old = self
            .lines
            .iter()
            .filter(|l| matches!(l.tag, LineTag::Context | LineTag::Remove))
            .count();
        let new = self
            .lines
            .iter()
            .filter(|l| matches!(l.tag, LineTag::Context | LineTag::Add))
            .count();
        if old != self.old_count || new != self.new_count {
            return Err(self.count_mismatch());
        }
        Ok(())
    }

    fn count_mismatch(&self) -> PatchError {
        PatchError::LineCountMismatch {
            old_start: self.old_start,
            old_count: self.old_count,
            new_start: self.new_start,
            new_count: self.new_count,
        }
    }

    /// Zero-based index in the old file where this hunk begins.
    ///
    /// A pure insertion (`-N,0`) lands after old line N.
    fn old_index(&self) -> usize {
        if self.old_count == 0 {
            self.old_start
        } else {
            self.old_start.saturating_sub(1)
        }
    }

    /// Trailing-newline state implied by `\ No newline` markers, if any.
    fn eof_newline_hint(&self) -> Option<bool> {
        let mut hint = None;
        let mut prev: Option<LineTag> = None;
        for line in &self.lines {
            if line.tag == LineTag::NoNewline {
                match prev {
                    Some(LineTag::Add | LineTag::Context) => return Some(false),
                    Some(LineTag::Remove) => hint = Some(true),
                    _ => {}
                }
            }
            prev = Some(line.tag);
        }
        hint
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    Add,
    Delete,
    Modify,
}

/// All hunks for one file. `None` paths are `/dev/null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    pub fn kind(&self) -> Result<PatchKind, PatchError> {
        match (&self.old_path, &self.new_path) {
            (None, None) => Err(PatchError::BothPathsNull),
            (None, Some(_)) => Ok(PatchKind::Add),
            (Some(_), None) => Ok(PatchKind::Delete),
            (Some(old), Some(new)) if old != new => Err(PatchError::PathMismatch {
                old: old.clone(),
                new: new.clone(),
            }),
            (Some(_), Some(_)) => Ok(PatchKind::Modify),
        }
    }

    /// Repository-relative path this patch touches.
    pub fn target_path(&self) -> Result<&str, PatchError> {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .ok_or(PatchError::BothPathsNull)
    }
}

/// Split on `\n` only, keeping any `\r`, without a phantom empty last line.
pub fn split_lines(text: &str) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }
    let body = text.strip_suffix('\n').unwrap_or(text);
    body.split('\n').collect()
}

/// Parse a unified diff into file patches.
///
/// Empty input yields no patches; non-empty input that contains no file
/// sections is an error.
pub fn parse_unified_diff(text: &str) -> Result<Vec<FilePatch>, PatchError> {
    let lines = split_lines(text);
    reject_unsupported(&lines)?;

    let mut patches: Vec<FilePatch> = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if let Some(old) = line.strip_prefix("--- ") {
            let new = lines
                .get(i + 1)
                .and_then(|next| next.strip_prefix("+++ "))
                .ok_or_else(|| PatchError::MissingNewHeader(old.to_string()))?;
            patches.push(FilePatch {
                old_path: parse_header_path(old),
                new_path: parse_header_path(new),
                hunks: Vec::new(),
            });
            i += 2;
            continue;
        }
        if line.starts_with("@@") {
            let file = patches
                .last_mut()
                .ok_or_else(|| PatchError::HunkWithoutFile(line.to_string()))?;
            let (hunk, next) = parse_hunk(&lines, i)?;
            file.hunks.push(hunk);
            i = next;
            continue;
        }
        // Body-looking lines after a finished hunk mean the header undercounted.
        if let Some(hunk) = patches.last().and_then(|p| p.hunks.last())
            && matches!(line.chars().next(), Some('+' | '-' | ' '))
            && line != "-- "
        {
            return Err(hunk.count_mismatch());
        }
        i += 1;
    }

    if patches.is_empty() && !text.trim().is_empty() {
        return Err(PatchError::NoFilePatches);
    }
    for patch in &patches {
        patch.kind()?;
    }
    Ok(patches)
}

fn reject_unsupported(lines: &[&str]) -> Result<(), PatchError> {
    for line in lines {
        if line.starts_with("GIT binary patch") || line.starts_with("Binary files ") {
            return Err(PatchError::Binary);
        }
        for prefix in ["rename from ", "rename to ", "copy from ", "copy to "] {
            if line.starts_with(prefix) {
                return Err(PatchError::Rename(line.to_string()));
            }
        }
    }
    Ok(())
}

fn parse_header_path(raw: &str) -> Option<String> {
    let path = raw.split('\t').next().unwrap_or(raw).trim_end();
    if path == NULL_PATH {
        return None;
    }
    let path = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    Some(path.to_string())
}

fn parse_hunk(lines: &[&str], header_idx: usize) -> Result<(Hunk, usize), PatchError> {
    let header = lines[header_idx];
    let caps = HUNK_HEADER
        .captures(header)
        .ok_or_else(|| PatchError::MalformedHunkHeader(header.to_string()))?;
    let number = |idx: usize| -> Result<usize, PatchError> {
        match caps.get(idx) {
            Some(m) => m
                .as_str()
                .parse()
                .map_err(|_| PatchError::MalformedHunkHeader(header.to_string())),
            None => Ok(1),
        }
    };
    let mut hunk = Hunk {
        old_start: number(1)?,
        old_count: number(2)?,
        new_start: number(3)?,
        new_count: number(4)?,
        lines: Vec::new(),
    };

    let (mut old_left, mut new_left) = (hunk.old_count, hunk.new_count);
    let mut i = header_idx + 1;
    while old_left > 0 || new_left > 0 {
        let Some(line) = lines.get(i) else {
            return Err(hunk.count_mismatch());
        };
        if line.starts_with("@@") || line.starts_with("diff --git ") {
            return Err(hunk.count_mismatch());
        }
        let parsed = parse_body_line(line)?;
        let (old_used, new_used) = match parsed.tag {
            LineTag::Context => (1, 1),
            LineTag::Remove => (1, 0),
            LineTag::Add => (0, 1),
            LineTag::NoNewline => (0, 0),
        };
        if old_used > old_left || new_used > new_left {
            return Err(hunk.count_mismatch());
        }
        old_left -= old_used;
        new_left -= new_used;
        hunk.lines.push(parsed);
        i += 1;
    }
    while let Some(line) = lines.get(i)
        && line.starts_with('\\')
    {
        hunk.lines.push(parse_body_line(line)?);
        i += 1;
    }
    Ok((hunk, i))
}

fn parse_body_line(line: &str) -> Result<HunkLine, PatchError> {
    // Editors often strip the lone space of an empty context line.
    let Some(first) = line.chars().next() else {
        return Ok(HunkLine {
            tag: LineTag::Context,
            text: String::new(),
        });
    };
    let tag = match first {
        ' ' => LineTag::Context,
        '+' => LineTag::Add,
        '-' => LineTag::Remove,
        '\\' => LineTag::NoNewline,
        _ => return Err(PatchError::UnknownTag(line.to_string())),
    };
    Ok(HunkLine {
        tag,
        text: line[1..].to_string(),
    })
}

/// Apply `hunks` to `original` by splicing each hunk in place.
///
/// Hunk positions come from the header's old start plus the running line
/// delta of earlier hunks in the same file.
pub fn apply_hunks(original: &str, hunks: &[Hunk]) -> Result<String, PatchError> {
    let mut lines: Vec<String> = split_lines(original)
        .into_iter()
        .map(str::to_string)
        .collect();
    let mut trailing_newline = original.is_empty() || original.ends_with('\n');
    let mut delta: isize = 0;

    for hunk in hunks {
        hunk.check_counts()?;
        let idx = hunk.old_index() as isize + delta;
        if idx < 0 || idx as usize > lines.len() {
            return Err(PatchError::HunkOutOfRange(hunk.old_start));
        }
        let idx = idx as usize;
        let mut cursor = idx;
        let mut replacement = Vec::with_capacity(hunk.new_count);
        for line in &hunk.lines {
            let old_line = (cursor as isize - delta) as usize + 1;
            match line.tag {
                LineTag::Context => {
                    if lines.get(cursor) != Some(&line.text) {
                        return Err(PatchError::ContextMismatch {
                            line: old_line,
                            expected: line.text.clone(),
                        });
                    }
                    replacement.push(line.text.clone());
                    cursor += 1;
                }
                LineTag::Remove => {
                    if lines.get(cursor) != Some(&line.text) {
                        return Err(PatchError::RemovalMismatch {
                            line: old_line,
                            expected: line.text.clone(),
                        });
                    }
                    cursor += 1;
                }
                LineTag::Add => replacement.push(line.text.clone()),
                LineTag::NoNewline => {}
            }
        }
        lines.splice(idx..cursor, replacement);
        delta += hunk.new_count as isize - hunk.old_count as isize;
        if let Some(hint) = hunk.eof_newline_hint() {
            trailing_newline = hint;
        }
    }

    Ok(join_lines(&lines, trailing_newline))
}

/// Rebuild the file by copying untouched spans between hunks.
///
/// Same contract as [`apply_hunks`]; hunks must be in ascending, non-overlapping order.
pub fn rebuild_with_context(original: &str, hunks: &[Hunk]) -> Result<String, PatchError> {
    let source = split_lines(original);
    let mut out: Vec<String> = Vec::with_capacity(source.len());
    let mut trailing_newline = original.is_empty() || original.ends_with('\n');
    let mut cursor = 0usize;

    for hunk in hunks {
        hunk.check_counts()?;
        let start = hunk.old_index();
        if start < cursor || start > source.len() {
            return Err(PatchError::HunkOutOfRange(hunk.old_start));
        }
        out.extend(source[cursor..start].iter().map(|s| s.to_string()));
        cursor = start;
        for line in &hunk.lines {
            match line.tag {
                LineTag::Context | LineTag::Remove => {
                    if source.get(cursor).copied() != Some(line.text.as_str()) {
                        let line_no = cursor + 1;
                        let expected = line.text.clone();
                        return Err(if line.tag == LineTag::Context {
                            PatchError::ContextMismatch {
                                line: line_no,
                                expected,
                            }
                        } else {
                            PatchError::RemovalMismatch {
                                line: line_no,
                                expected,
                            }
                        });
                    }
                    if line.tag == LineTag::Context {
                        out.push(line.text.clone());
                    }
                    cursor += 1;
                }
                LineTag::Add => out.push(line.text.clone()),
                LineTag::NoNewline => {}
            }
        }
        if let Some(hint) = hunk.eof_newline_hint() {
            trailing_newline = hint;
        }
    }
    out.extend(source[cursor..].iter().map(|s| s.to_string()));

    Ok(join_lines(&out, trailing_newline))
}

fn join_lines(lines: &[String], trailing_newline: bool) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut out = lines.join("\n");
    if trailing_newline {
        out.push('\n');
    }
    out
}

/// New contents for a file patch, or `None` when the file should be removed.
///
/// Creations are rebuilt from an empty file; modifications splice in place.
/// Deletions must consume the whole current file.
pub fn apply_file_patch(current: Option<&str>, patch: &FilePatch) -> Result<Option<String>, PatchError> {
    let path = patch.target_path()?.to_string();
    match patch.kind()? {
        PatchKind::Add => {
            if current.is_some() {
                return Err(PatchError::TargetExists(path));
            }
            rebuild_with_context("", &patch.hunks).map(Some)
        }
        PatchKind::Modify => {
            let current = current.ok_or_else(|| PatchError::TargetMissing(path))?;
            apply_hunks(current, &patch.hunks).map(Some)
        }
        PatchKind::Delete => {
            let current = current.ok_or_else(|| PatchError::TargetMissing(path.clone()))?;
            if !patch.hunks.is_empty() && !apply_hunks(current, &patch.hunks)?.is_empty() {
                return Err(PatchError::DeleteLeavesContent(path));
            }
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(diff: &str) -> FilePatch {
        let mut patches = parse_unified_diff(diff).expect("parse");
        assert_eq!(patches.len(), 1);
        patches.remove(0)
    }

    #[test]
    fn parses_git_style_modify() {
        let diff = "diff --git a/src/lib.rs b/src/lib.rs\nindex 1..2 100644\n--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,2 +1,2 @@\n fn a() {}\n-fn b() {}\n+fn c() {}\n";
        let patch = single(diff);
        assert_eq!(patch.kind(), Ok(PatchKind::Modify));
        assert_eq!(patch.target_path(), Ok("src/lib.rs"));
        assert_eq!(patch.hunks[0].old_count, 2);
        assert_eq!(patch.hunks[0].lines.len(), 3);
    }

    #[test]
    fn missing_counts_default_to_one_and_tabs_are_stripped() {
        let diff = "--- a/x.txt\t2026-01-01 00:00:00\n+++ b/x.txt\t2026-01-01 00:00:01\n@@ -3 +3 @@\n-old\n+new\n";
        let patch = single(diff);
        assert_eq!(patch.old_path.as_deref(), Some("x.txt"));
        let hunk = &patch.hunks[0];
        assert_eq!((hunk.old_start, hunk.old_count, hunk.new_count), (3, 1, 1));
    }

    #[test]
    fn classifies_add_and_delete() {
        let add = single("--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1 @@\n+hi\n");
        assert_eq!(add.kind(), Ok(PatchKind::Add));
        let del = single("--- a/old.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-bye\n");
        assert_eq!(del.kind(), Ok(PatchKind::Delete));
        assert_eq!(del.target_path(), Ok("old.txt"));
    }

    fn rejected(diff: &str) -> PatchError {
        parse_unified_diff(diff).expect_err(diff)
    }

    #[test]
    fn rejects_unsupported_and_malformed_input() {
        assert_eq!(
            rejected("diff --git a/x b/x\nGIT binary patch\nliteral 1\n"),
            PatchError::Binary
        );
        assert_eq!(rejected("Binary files a/x and b/x differ\n"), PatchError::Binary);
        assert!(matches!(
            rejected("diff --git a/x b/y\nrename from x\nrename to y\n"),
            PatchError::Rename(_)
        ));
        assert!(matches!(
            rejected("--- a/x\n@@ -1 +1 @@\n"),
            PatchError::MissingNewHeader(_)
        ));
        assert!(matches!(
            rejected("--- a/x\n+++ b/x\n@@ -1 +1\n-a\n+b\n"),
            PatchError::MalformedHunkHeader(_)
        ));
        assert_eq!(
            rejected("--- /dev/null\n+++ /dev/null\n"),
            PatchError::BothPathsNull
        );
        assert!(matches!(
            rejected("--- a/x\n+++ b/y\n@@ -1 +1 @@\n-a\n+b\n"),
            PatchError::PathMismatch { .. }
        ));
        assert_eq!(rejected("just some prose\n"), PatchError::NoFilePatches);
        assert!(matches!(
            rejected("--- a/x\n+++ b/x\n@@ -1 +1 @@\n*a\n"),
            PatchError::UnknownTag(_)
        ));
    }

    #[test]
    fn short_or_long_hunk_bodies_are_count_mismatches() {
        let short = "--- a/x\n+++ b/x\n@@ -1,2 +1,2 @@\n a\n";
        assert!(matches!(
            parse_unified_diff(short),
            Err(PatchError::LineCountMismatch { .. })
        ));
        let long = "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n+c\n";
        assert!(matches!(
            parse_unified_diff(long),
            Err(PatchError::LineCountMismatch { .. })
        ));
    }

    #[test]
    fn removed_line_starting_with_dashes_is_not_a_header() {
        let diff = "--- a/q.sql\n+++ b/q.sql\n@@ -1,2 +1 @@\n--- comment\n select 1;\n";
        let patch = single(diff);
        assert_eq!(patch.hunks[0].lines[0].tag, LineTag::Remove);
        assert_eq!(patch.hunks[0].lines[0].text, "-- comment");
        let out = apply_hunks("-- comment\nselect 1;\n", &patch.hunks).expect("apply");
        assert_eq!(out, "select 1;\n");
    }

    #[test]
    fn applies_multiple_hunks_with_running_delta() {
        let original = "1\n2\n3\n4\n5\n6\n7\n8\n9\n";
        let diff = "--- a/n\n+++ b/n\n@@ -1,2 +1,3 @@\n 1\n+1.5\n 2\n@@ -8,2 +9,1 @@\n-8\n 9\n";
        let patch = single(diff);
        let out = apply_hunks(original, &patch.hunks).expect("apply");
        assert_eq!(out, "1\n1.5\n2\n3\n4\n5\n6\n7\n9\n");
        let rebuilt = rebuild_with_context(original, &patch.hunks).expect("rebuild");
        assert_eq!(rebuilt, out);
    }

    #[test]
    fn pure_insertion_lands_after_named_line() {
        let patch = single("--- a/n\n+++ b/n\n@@ -2,0 +3 @@\n+inserted\n");
        let out = apply_hunks("a\nb\nc\n", &patch.hunks).expect("apply");
        assert_eq!(out, "a\nb\ninserted\nc\n");
    }

    /// Pairs of file versions with the diff between them; each diff must reproduce `after` exactly.
    #[test]
    fn round_trips_including_trailing_newline_presence() {
        let cases = [
            ("a\nb\n", "a\nB\n", "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\n-b\n+B\n"),
            (
                "a\nb\n",
                "a\nb",
                "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\n-b\n+b\n\\ No newline at end of file\n",
            ),
            (
                "a\nb",
                "a\nb\n",
                "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\n-b\n\\ No newline at end of file\n+b\n",
            ),
            (
                "a\nb",
                "a\nc",
                "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\n-b\n\\ No newline at end of file\n+c\n\\ No newline at end of file\n",
            ),
            ("a\nb\nc\n", "a\nc\n", "--- a/f\n+++ b/f\n@@ -1,3 +1,2 @@\n a\n-b\n c\n"),
            ("x\n", "", "--- a/f\n+++ b/f\n@@ -1 +0,0 @@\n-x\n"),
        ];
        for (before, after, diff) in cases {
            let patch = single(diff);
            assert_eq!(apply_hunks(before, &patch.hunks).as_deref(), Ok(after), "{diff}");
            assert_eq!(
                rebuild_with_context(before, &patch.hunks).as_deref(),
                Ok(after),
                "{diff}"
            );
        }
    }

    #[test]
    fn context_and_removal_mismatches_are_reported() {
        let patch = single("--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\n-b\n+c\n");
        assert!(matches!(
            apply_hunks("z\nb\n", &patch.hunks),
            Err(PatchError::ContextMismatch { line: 1, .. })
        ));
        assert!(matches!(
            apply_hunks("a\nq\n", &patch.hunks),
            Err(PatchError::RemovalMismatch { line: 2, .. })
        ));
        assert!(matches!(
            rebuild_with_context("a\nq\n", &patch.hunks),
            Err(PatchError::RemovalMismatch { line: 2, .. })
        ));
    }

    #[test]
    fn hand_built_hunk_with_wrong_counts_is_refused() {
        let hunk = Hunk {
            old_start: 1,
            old_count: 2,
            new_start: 1,
            new_count: 1,
            lines: vec![HunkLine {
                tag: LineTag::Context,
                text: "a".to_string(),
            }],
        };
        assert!(matches!(
            apply_hunks("a\n", std::slice::from_ref(&hunk)),
            Err(PatchError::LineCountMismatch { .. })
        ));
    }

    #[test]
    fn hunk_past_end_of_file_is_out_of_range() {
        let patch = single("--- a/f\n+++ b/f\n@@ -10 +10 @@\n-a\n+b\n");
        assert_eq!(
            apply_hunks("a\n", &patch.hunks),
            Err(PatchError::HunkOutOfRange(10))
        );
    }

    #[test]
    fn file_patch_kinds_check_existence() {
        let add = single("--- /dev/null\n+++ b/n.txt\n@@ -0,0 +1,2 @@\n+one\n+two\n");
        assert_eq!(
            apply_file_patch(None, &add),
            Ok(Some("one\ntwo\n".to_string()))
        );
        assert!(matches!(
            apply_file_patch(Some("x"), &add),
            Err(PatchError::TargetExists(_))
        ));

        let del = single("--- a/n.txt\n+++ /dev/null\n@@ -1,2 +0,0 @@\n-one\n-two\n");
        assert_eq!(apply_file_patch(Some("one\ntwo\n"), &del), Ok(None));
        assert!(matches!(
            apply_file_patch(Some("one\ntwo\nthree\n"), &del),
            Err(PatchError::DeleteLeavesContent(_))
        ));
    }
}
