//! Thin wrapper around the `git` CLI.
//!
//! Context gathering treats git failures as warnings; branch preparation
//! before applying a patch treats them as fatal. Callers decide which.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Return the current branch name (errors on detached HEAD).
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            return Err(anyhow!("detached HEAD"));
        }
        Ok(name)
    }

    /// Unified diff of the working tree against HEAD.
    #[instrument(skip_all)]
    pub fn current_diff(&self) -> Result<String> {
        self.run_capture(&["diff", "--no-color", "--no-ext-diff", "HEAD"])
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Check out `branch`, creating it from `base` when it does not exist yet.
    ///
    /// A missing `base` falls back to HEAD. Returns whether the branch was
    /// created.
    #[instrument(skip_all, fields(branch = %branch, base = ?base))]
    pub fn ensure_branch(&self, branch: &str, base: Option<&str>) -> Result<bool> {
        if self.current_branch().ok().as_deref() == Some(branch) {
            debug!("already on branch");
            return Ok(false);
        }
        if self.branch_exists(branch)? {
            self.checkout_branch(branch)?;
            return Ok(false);
        }
        let start = match base {
            Some(base) if self.branch_exists(base)? => Some(base),
            Some(base) => {
                warn!(base, "base branch not found, branching from HEAD");
                None
            }
            None => None,
        };
        self.checkout_new_branch(branch, start)?;
        Ok(true)
    }

    pub fn checkout_new_branch(&self, branch: &str, start: Option<&str>) -> Result<()> {
        debug!(branch, start, "creating and checking out new branch");
        let mut args = vec!["checkout", "-b", branch];
        args.extend(start);
        self.run_checked(&args)?;
        Ok(())
    }

    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(args = %args.join(" "), "git command failed");
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
