//! Run directories and the `run.json` record.
//!
//! Layout: `<outputs_dir>/<run_id>/run.json` next to the run's markdown
//! artifacts. Every write goes through the sandbox path check and lands
//! atomically.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, info, instrument};

use crate::core::errors::{StateError, StoreError};
use crate::core::status::RunStatus;
use crate::core::types::{CommandResult, OpLog, Run, RunInputs, now};
use crate::io::artifacts::{ArtifactRenderer, RUN_REPORT};
use crate::io::sandbox::{Sandbox, write_atomic};

const RUN_FILE: &str = "run.json";

#[derive(Debug, Clone)]
pub struct RunStore {
    outputs_dir: PathBuf,
    sandbox: Sandbox,
}

impl RunStore {
    pub fn new(outputs_dir: impl Into<PathBuf>, sandbox: Sandbox) -> Self {
        Self {
            outputs_dir: outputs_dir.into(),
            sandbox,
        }
    }

    pub fn outputs_dir(&self) -> &Path {
        &self.outputs_dir
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        validate_run_id(run_id)?;
        Ok(self.outputs_dir.join(run_id))
    }

    pub fn artifact_path(&self, run_id: &str, name: &str) -> Result<PathBuf> {
        Ok(self.run_dir(run_id)?.join(name))
    }

    fn run_path(&self, run_id: &str) -> Result<PathBuf> {
        self.artifact_path(run_id, RUN_FILE)
    }

    pub fn exists(&self, run_id: &str) -> bool {
        self.run_path(run_id).is_ok_and(|path| path.is_file())
    }

    /// Create a new run with a fresh id and its initial run report.
    #[instrument(skip_all)]
    pub fn init_run(&self, inputs: RunInputs) -> Result<Run> {
        let at = now();
        let mut run = Run::new(generate_run_id(at), inputs, at);
        self.create(&run)?;
        let report = ArtifactRenderer::new().run_report(&run)?;
        let mut log = OpLog::new();
        self.sandbox
            .write(&self.artifact_path(&run.run_id, RUN_REPORT)?, &report, &mut log)?;
        run.record_fs_events(log.into_events());
        self.save(&mut run)?;
        info!(run_id = %run.run_id, "run created");
        Ok(run)
    }

    /// Persist a brand-new run. Fails if `run.json` already exists.
    pub fn create(&self, run: &Run) -> Result<()> {
        let path = self.run_path(&run.run_id)?;
        if path.exists() {
            return Err(StoreError::RunExists(run.run_id.clone()).into());
        }
        self.write_run(&path, run)
    }

    pub fn load(&self, run_id: &str) -> Result<Run> {
        let path = self.run_path(run_id)?;
        if !path.is_file() {
            return Err(StoreError::RunNotFound(run_id.to_string()).into());
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let run: Run = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", path.display()))?;
        debug!(run_id, status = %run.status, "run loaded");
        Ok(run)
    }

    /// Stamp `updated_at` and atomically replace `run.json`.
    pub fn save(&self, run: &mut Run) -> Result<()> {
        let path = self.run_path(&run.run_id)?;
        run.updated_at = now().max(run.created_at);
        self.write_run(&path, run)
    }

    /// Load, mutate, save. Nothing is written when `f` fails.
    pub fn update<F>(&self, run_id: &str, f: F) -> Result<Run>
    where
        F: FnOnce(&mut Run) -> Result<()>,
    {
        let mut run = self.load(run_id)?;
        f(&mut run)?;
        self.save(&mut run)?;
        Ok(run)
    }

    /// Ids of every stored run, oldest first.
    pub fn list_runs(&self) -> Result<Vec<String>> {
        if !self.outputs_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.outputs_dir)
            .with_context(|| format!("list {}", self.outputs_dir.display()))?
        {
            let entry = entry.with_context(|| format!("list {}", self.outputs_dir.display()))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_run_id(&name).is_ok() && entry.path().join(RUN_FILE).is_file() {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Stage patch text for the next APPLY_CHANGES.
    pub fn stage_patch(&self, run_id: &str, patch_text: &str) -> Result<Run> {
        self.update(run_id, |run| {
            if !matches!(
                run.status,
                RunStatus::PatchProposed | RunStatus::WaitingApprovalPatch | RunStatus::ApprovedPatch
            ) {
                return Err(StateError::PatchNotExpected(run.status).into());
            }
            run.edits.patch_text = patch_text.to_string();
            Ok(())
        })
    }

    pub fn append_command(&self, run_id: &str, result: CommandResult) -> Result<Run> {
        self.update(run_id, |run| {
            run.commands.push(result);
            Ok(())
        })
    }

    /// Atomically write an artifact into the run directory.
    pub fn write_artifact(&self, run_id: &str, name: &str, contents: &str, log: &mut OpLog) -> Result<()> {
        self.sandbox
            .write(&self.artifact_path(run_id, name)?, contents, log)
    }

    pub fn append_artifact(&self, run_id: &str, name: &str, contents: &str, log: &mut OpLog) -> Result<()> {
        self.sandbox
            .append(&self.artifact_path(run_id, name)?, contents, log)
    }

    /// Read an artifact, or `None` if it was never written.
    pub fn read_artifact(&self, run_id: &str, name: &str, log: &mut OpLog) -> Result<Option<String>> {
        let path = self.artifact_path(run_id, name)?;
        if !path.is_file() {
            return Ok(None);
        }
        self.sandbox.read_to_string(&path, log).map(Some)
    }

    fn write_run(&self, path: &Path, run: &Run) -> Result<()> {
        let resolved = self.sandbox.check_path(path)?;
        let mut buf = serde_json::to_string_pretty(run).context("serialize run")?;
        buf.push('\n');
        write_atomic(&resolved, &buf)
    }
}

/// Time-ordered id: `YYYYMMDD_HHMMSS_` plus four random hex chars.
pub fn generate_run_id(at: DateTime<Utc>) -> String {
    let suffix: u16 = rand::thread_rng().r#gen();
    format!("{}_{suffix:04x}", at.format("%Y%m%d_%H%M%S"))
}

fn validate_run_id(run_id: &str) -> Result<()> {
    let valid = !run_id.is_empty()
        && run_id.len() <= 64
        && !run_id.starts_with('.')
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidRunId(run_id.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::io::config::FsLimits;

    fn store(root: &Path) -> RunStore {
        let outputs = PathBuf::from("outputs");
        let sandbox = Sandbox::new(root, &[], &outputs, FsLimits::default()).expect("sandbox");
        RunStore::new(root.join(outputs), sandbox)
    }

    fn store_error(err: &anyhow::Error) -> Option<&StoreError> {
        err.downcast_ref::<StoreError>()
    }

    #[test]
    fn run_id_shape() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single().expect("time");
        let id = generate_run_id(at);
        assert!(id.starts_with("20260304_050607_"), "{id}");
        assert_eq!(id.len(), "20260304_050607_".len() + 4);
        assert!(validate_run_id(&id).is_ok());
    }

    #[test]
    fn init_creates_record_and_report() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let run = store
            .init_run(RunInputs {
                story: "Greet louder".to_string(),
                ..RunInputs::default()
            })
            .expect("init");
        assert_eq!(run.status, RunStatus::Created);
        let loaded = store.load(&run.run_id).expect("load");
        assert_eq!(loaded.inputs.story, "Greet louder");
        let report = fs::read_to_string(store.artifact_path(&run.run_id, RUN_REPORT).expect("path"))
            .expect("report");
        assert!(report.contains("Greet louder"));
        assert_eq!(store.list_runs().expect("list"), vec![run.run_id]);
    }

    #[test]
    fn create_refuses_existing_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let run = Run::new("20260101_000000_0001".to_string(), RunInputs::default(), now());
        store.create(&run).expect("create");
        let err = store.create(&run).expect_err("duplicate");
        assert_eq!(
            store_error(&err),
            Some(&StoreError::RunExists(run.run_id.clone()))
        );
    }

    #[test]
    fn missing_and_malformed_ids_are_typed_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let err = store.load("20260101_000000_ffff").expect_err("missing");
        assert!(matches!(store_error(&err), Some(StoreError::RunNotFound(_))));
        for bad in ["", "../escape", "a/b", ".hidden"] {
            let err = store.load(bad).expect_err(bad);
            assert!(matches!(store_error(&err), Some(StoreError::InvalidRunId(_))), "{bad}");
        }
    }

    #[test]
    fn failed_update_writes_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let run = Run::new("r1".to_string(), RunInputs::default(), now());
        store.create(&run).expect("create");
        let before = store.load("r1").expect("load");
        let err = store
            .update("r1", |run| {
                run.loop_iters = 9;
                anyhow::bail!("nope")
            })
            .expect_err("update fails");
        assert_eq!(err.to_string(), "nope");
        assert_eq!(store.load("r1").expect("load"), before);
    }

    #[test]
    fn patch_staging_requires_patch_phase() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let run = Run::new("r1".to_string(), RunInputs::default(), now());
        store.create(&run).expect("create");
        let err = store.stage_patch("r1", "diff").expect_err("too early");
        assert_eq!(
            err.downcast_ref::<StateError>(),
            Some(&StateError::PatchNotExpected(RunStatus::Created))
        );

        store
            .update("r1", |run| {
                run.status = RunStatus::WaitingApprovalPatch;
                Ok(())
            })
            .expect("advance");
        let run = store.stage_patch("r1", "diff text").expect("stage");
        assert_eq!(run.edits.patch_text, "diff text");
    }

    #[test]
    fn save_stamps_updated_at_and_appends_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let created = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().expect("time");
        let run = Run::new("r1".to_string(), RunInputs::default(), created);
        store.create(&run).expect("create");
        let result = CommandResult::refused(vec!["rm".to_string()], now(), 5, "no".to_string());
        let run = store.append_command("r1", result).expect("append");
        assert_eq!(run.commands.len(), 1);
        assert!(run.updated_at > created);
    }
}
