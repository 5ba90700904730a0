//! Pipeline configuration stored under `.gateflow/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::sandbox::write_atomic;

/// Pipeline configuration (TOML).
///
/// Edited by humans; every field has a default so a missing or partial file
/// still yields a usable config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FlowConfig {
    pub runs: RunsConfig,
    pub security: SecurityConfig,
    pub generator: GeneratorConfig,
    pub context: ContextConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunsConfig {
    /// Directory holding one subdirectory per run, relative to the project root.
    pub outputs_dir: PathBuf,
    /// Retry cycles allowed after failing tests before the run fails.
    pub max_iters: u32,
    /// Safety ceiling on stages executed by a single advance.
    pub max_hops: u32,
    /// Wall-clock budget for the test command.
    pub timeout_seconds: u64,
    pub output_limit_bytes: usize,
    pub test_command: Vec<String>,
    pub base_branch: String,
    pub branch_prefix: String,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            outputs_dir: PathBuf::from(".gateflow/runs"),
            max_iters: 3,
            max_hops: 100,
            timeout_seconds: 600,
            output_limit_bytes: 100_000,
            test_command: vec!["cargo".to_string(), "test".to_string()],
            base_branch: "main".to_string(),
            branch_prefix: "gateflow/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Exact argv vectors the command guard may run.
    pub allowed_commands: Vec<Vec<String>>,
    /// Roots (relative to the project root) that reads, writes and patches may touch.
    /// The outputs directory is always allowed.
    pub allowed_write_roots: Vec<PathBuf>,
    pub fs: FsLimits,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_commands: vec![vec!["cargo".to_string(), "test".to_string()]],
            allowed_write_roots: vec![PathBuf::from(".")],
            fs: FsLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FsLimits {
    pub max_file_bytes: u64,
    pub max_diff_lines: usize,
    pub max_files_changed: usize,
}

impl Default for FsLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 512 * 1024,
            max_diff_lines: 800,
            max_files_changed: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// External generator process; empty disables generation.
    pub command: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    pub key_files: Vec<String>,
    pub max_tree_entries: usize,
    pub max_key_file_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            key_files: vec![
                "README.md".to_string(),
                "Cargo.toml".to_string(),
                "AGENTS.md".to_string(),
            ],
            max_tree_entries: 250,
            max_key_file_chars: 12_000,
        }
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.runs.outputs_dir.as_os_str().is_empty() {
            return Err(anyhow!("runs.outputs_dir must not be empty"));
        }
        if self.runs.max_hops == 0 {
            return Err(anyhow!("runs.max_hops must be > 0"));
        }
        if self.runs.timeout_seconds == 0 {
            return Err(anyhow!("runs.timeout_seconds must be > 0"));
        }
        if self.runs.output_limit_bytes == 0 {
            return Err(anyhow!("runs.output_limit_bytes must be > 0"));
        }
        if self.runs.test_command.is_empty() || self.runs.test_command[0].trim().is_empty() {
            return Err(anyhow!("runs.test_command must be a non-empty array"));
        }
        if self
            .security
            .allowed_commands
            .iter()
            .any(|argv| argv.is_empty())
        {
            return Err(anyhow!("security.allowed_commands entries must be non-empty"));
        }
        if self.security.fs.max_file_bytes == 0
            || self.security.fs.max_diff_lines == 0
            || self.security.fs.max_files_changed == 0
        {
            return Err(anyhow!("security.fs limits must be > 0"));
        }
        if self.generator.timeout_seconds == 0 {
            return Err(anyhow!("generator.timeout_seconds must be > 0"));
        }
        Ok(())
    }
}

/// Canonical locations under a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub gateflow_dir: PathBuf,
    pub config_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let gateflow_dir = root.join(".gateflow");
        Self {
            config_path: gateflow_dir.join("config.toml"),
            gateflow_dir,
            root,
        }
    }

    pub fn outputs_dir(&self, cfg: &FlowConfig) -> PathBuf {
        self.root.join(&cfg.runs.outputs_dir)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FlowConfig::default()`.
pub fn load_config(path: &Path) -> Result<FlowConfig> {
    if !path.exists() {
        let cfg = FlowConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FlowConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FlowConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, FlowConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = FlowConfig::default();
        cfg.security.allowed_commands.push(vec!["just".into(), "ci".into()]);
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[runs]\nmax_iters = 5\n\n[security.fs]\nmax_diff_lines = 10\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.runs.max_iters, 5);
        assert_eq!(cfg.runs.max_hops, 100);
        assert_eq!(cfg.security.fs.max_diff_lines, 10);
        assert_eq!(cfg.security.fs.max_files_changed, 20);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[runs]\ntest_command = []\n").expect("write");
        let err = load_config(&path).expect_err("empty test command");
        assert!(format!("{err:#}").contains("runs.test_command"));
    }
}
