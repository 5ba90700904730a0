//! Filesystem sandbox: every read, write and patch target must resolve under
//! an allowed root.
//!
//! Resolution canonicalizes the nearest existing ancestor of a path, so a
//! symlink planted inside a root that points elsewhere is judged by where it
//! lands, not by where it sits.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::errors::{PatchError, SandboxError};
use crate::core::patch::{apply_file_patch, parse_unified_diff, split_lines};
use crate::core::types::{OpEvent, OpKind, OpLog, now};
use crate::io::config::FsLimits;

#[derive(Debug, Clone)]
pub struct Sandbox {
    base: PathBuf,
    roots: Vec<PathBuf>,
    limits: FsLimits,
}

impl Sandbox {
    /// Build a sandbox rooted at `base`.
    ///
    /// Relative roots are taken relative to `base`; `output_root` is always
    /// allowed and is created if missing.
    pub fn new(
        base: &Path,
        allowed_roots: &[PathBuf],
        output_root: &Path,
        limits: FsLimits,
    ) -> Result<Self> {
        let base = fs::canonicalize(base)
            .with_context(|| format!("resolve sandbox base {}", base.display()))?;
        let output_root = base.join(output_root);
        fs::create_dir_all(&output_root)
            .with_context(|| format!("create output root {}", output_root.display()))?;

        let mut roots = Vec::new();
        for root in allowed_roots.iter().map(|r| base.join(r)).chain([output_root]) {
            if has_parent_segment(&root) {
                warn!(root = %root.display(), "ignoring allowed root with parent segment");
                continue;
            }
            let resolved = resolve(&root)
                .with_context(|| format!("resolve allowed root {}", root.display()))?;
            if !roots.contains(&resolved) {
                roots.push(resolved);
            }
        }
        debug!(base = %base.display(), roots = roots.len(), "sandbox ready");
        Ok(Self {
            base,
            roots,
            limits,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolve `path` and confirm it lies under an allowed root.
    pub fn check_path(&self, path: &Path) -> Result<PathBuf> {
        let display = path.display().to_string();
        let reject = |reason: String| SandboxError::PathNotAllowed {
            path: display.clone(),
            reason,
        };
        if path.as_os_str().as_encoded_bytes().contains(&0) {
            return Err(reject("contains NUL byte".to_string()).into());
        }
        if has_parent_segment(path) {
            return Err(reject("contains parent-directory segment".to_string()).into());
        }
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base.join(path)
        };
        let resolved = resolve(&absolute).map_err(|e| reject(format!("cannot resolve: {e}")))?;
        if self
            .roots
            .iter()
            .any(|root| resolved == *root || resolved.starts_with(root))
        {
            Ok(resolved)
        } else {
            Err(reject("outside allowed roots".to_string()).into())
        }
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn read_to_string(&self, path: &Path, log: &mut OpLog) -> Result<String> {
        logged(log, OpKind::Read, path, || {
            let resolved = self.check_path(path)?;
            let size = fs::metadata(&resolved)
                .with_context(|| format!("stat {}", resolved.display()))?
                .len();
            self.check_size(path, size)?;
            let contents = fs::read_to_string(&resolved)
                .with_context(|| format!("read {}", resolved.display()))?;
            Ok((contents, size))
        })
    }

    /// Atomically replace `path` with `contents`.
    #[instrument(skip_all, fields(path = %path.display(), bytes = contents.len()))]
    pub fn write(&self, path: &Path, contents: &str, log: &mut OpLog) -> Result<()> {
        logged(log, OpKind::Write, path, || {
            self.check_size(path, contents.len() as u64)?;
            let resolved = self.check_path(path)?;
            write_atomic(&resolved, contents)?;
            Ok(((), contents.len() as u64))
        })
    }

    /// Append to `path`, creating it if needed. The combined size is limited.
    pub fn append(&self, path: &Path, contents: &str, log: &mut OpLog) -> Result<()> {
        let resolved = self.check_path(path)?;
        let mut current = if resolved.exists() {
            self.read_to_string(path, log)?
        } else {
            String::new()
        };
        current.push_str(contents);
        self.write(path, &current, log)
    }

    /// Parse and apply `diff` against files under `root`.
    ///
    /// Limits, paths and every hunk are checked before the first write, so a
    /// rejected diff leaves the tree untouched. Returns the touched paths
    /// relative to `root`, in diff order.
    #[instrument(skip_all, fields(root = %root.display(), diff_bytes = diff.len()))]
    pub fn apply_patch(&self, root: &Path, diff: &str, log: &mut OpLog) -> Result<Vec<String>> {
        let planned = match self.plan_patch(root, diff) {
            Ok(planned) => planned,
            Err(err) => {
                let at = now();
                log.push(OpEvent {
                    op: OpKind::Patch,
                    target: root.display().to_string(),
                    ok: false,
                    bytes: 0,
                    started_at: at,
                    finished_at: at,
                    error: Some(format!("{err:#}")),
                });
                warn!(err = %format!("{err:#}"), "patch rejected");
                return Err(err);
            }
        };

        let mut touched = Vec::with_capacity(planned.len());
        for change in planned {
            let target = change.resolved.clone();
            match change.contents {
                Some(contents) => logged(log, OpKind::Patch, &target, || {
                    write_atomic(&target, &contents)?;
                    Ok(((), contents.len() as u64))
                })?,
                None => logged(log, OpKind::Delete, &target, || {
                    fs::remove_file(&target)
                        .with_context(|| format!("delete {}", target.display()))?;
                    Ok(((), 0))
                })?,
            }
            touched.push(change.rel_path);
        }
        debug!(files = touched.len(), "patch applied");
        Ok(touched)
    }

    fn plan_patch(&self, root: &Path, diff: &str) -> Result<Vec<PlannedChange>> {
        let line_count = split_lines(diff).len();
        if line_count > self.limits.max_diff_lines {
            return Err(SandboxError::DiffTooLarge(format!(
                "{line_count} lines exceeds limit {}",
                self.limits.max_diff_lines
            ))
            .into());
        }
        let patches = parse_unified_diff(diff)?;
        if patches.len() > self.limits.max_files_changed {
            return Err(SandboxError::DiffTooLarge(format!(
                "{} files exceeds limit {}",
                patches.len(),
                self.limits.max_files_changed
            ))
            .into());
        }

        let mut seen = BTreeSet::new();
        let mut planned = Vec::with_capacity(patches.len());
        for patch in &patches {
            let rel_path = patch.target_path()?.to_string();
            if !seen.insert(rel_path.clone()) {
                return Err(PatchError::DuplicateTarget(rel_path).into());
            }
            let rel = Path::new(&rel_path);
            if rel.is_absolute() {
                return Err(SandboxError::PathNotAllowed {
                    path: rel_path.clone(),
                    reason: "absolute path in diff".to_string(),
                }
                .into());
            }
            let resolved = self.check_path(&root.join(rel))?;
            let current = if resolved.is_file() {
                let size = fs::metadata(&resolved)
                    .with_context(|| format!("stat {}", resolved.display()))?
                    .len();
                self.check_size(&resolved, size)?;
                Some(
                    fs::read_to_string(&resolved)
                        .with_context(|| format!("read {}", resolved.display()))?,
                )
            } else {
                None
            };
            let contents = apply_file_patch(current.as_deref(), patch)?;
            if let Some(contents) = &contents {
                self.check_size(&resolved, contents.len() as u64)?;
            }
            planned.push(PlannedChange {
                rel_path,
                resolved,
                contents,
            });
        }
        Ok(planned)
    }

    fn check_size(&self, path: &Path, size: u64) -> Result<()> {
        if size > self.limits.max_file_bytes {
            return Err(SandboxError::FileTooLarge {
                path: path.display().to_string(),
                size,
                limit: self.limits.max_file_bytes,
            }
            .into());
        }
        Ok(())
    }
}

struct PlannedChange {
    rel_path: String,
    resolved: PathBuf,
    /// `None` removes the file.
    contents: Option<String>,
}

fn has_parent_segment(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

/// Canonicalize the longest existing prefix of `path` and re-attach the rest.
fn resolve(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path;
    let mut missing: Vec<OsString> = Vec::new();
    while fs::symlink_metadata(existing).is_err() {
        let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no existing ancestor",
            ));
        };
        missing.push(name.to_os_string());
        existing = parent;
    }
    let mut resolved = fs::canonicalize(existing)?;
    for name in missing.iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

fn logged<T>(
    log: &mut OpLog,
    op: OpKind,
    target: &Path,
    f: impl FnOnce() -> Result<(T, u64)>,
) -> Result<T> {
    let started_at = now();
    let result = f();
    let finished_at = now();
    let (ok, bytes, error) = match &result {
        Ok((_, bytes)) => (true, *bytes, None),
        Err(err) => (false, 0, Some(format!("{err:#}"))),
    };
    log.push(OpEvent {
        op,
        target: target.display().to_string(),
        ok,
        bytes,
        started_at,
        finished_at,
        error,
    });
    result.map(|(value, _)| value)
}

/// Write `contents` to a temporary sibling and rename it over `path`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let mut tmp_name = OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
