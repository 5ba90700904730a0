//! The persisted run record and its per-stage sub-state.
//!
//! Every sub-state field defaults when absent so older `run.json` files keep
//! loading as new fields are introduced. Fields this version does not know
//! about are carried through `extra` untouched.

use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::router::Stage;
use crate::core::status::{Gate, RunStatus};
use crate::core::telemetry::TelemetryState;

/// Current UTC time, truncated to microseconds so it survives a JSON round trip.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Operation events retained in `run.json`; older ones are dropped first.
pub const MAX_FS_EVENTS: usize = 500;

/// One end-to-end execution of the gated pipeline (`<outputs>/<run_id>/run.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub inputs: RunInputs,
    #[serde(default)]
    pub commands: Vec<CommandResult>,
    #[serde(default)]
    pub approvals: Vec<ApprovalRecord>,
    #[serde(default)]
    pub loop_iters: u32,
    #[serde(default)]
    pub pending_gate: Option<Gate>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub plan: PlanState,
    #[serde(default)]
    pub context: ContextState,
    #[serde(default)]
    pub edits: EditsState,
    #[serde(default)]
    pub tests: TestsState,
    #[serde(default)]
    pub risk: RiskState,
    #[serde(default)]
    pub status_meta: StatusMeta,
    #[serde(default)]
    pub contract_issues: Vec<String>,
    #[serde(default)]
    pub telemetry: TelemetryState,
    #[serde(default)]
    pub fs_events: Vec<OpEvent>,
    #[serde(default)]
    pub finalized_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Run {
    pub fn new(run_id: String, inputs: RunInputs, at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            status: RunStatus::Created,
            created_at: at,
            updated_at: at,
            inputs,
            commands: Vec::new(),
            approvals: Vec::new(),
            loop_iters: 0,
            pending_gate: None,
            failure_reason: None,
            plan: PlanState::default(),
            context: ContextState::default(),
            edits: EditsState::default(),
            tests: TestsState::default(),
            risk: RiskState::default(),
            status_meta: StatusMeta::default(),
            contract_issues: Vec::new(),
            telemetry: TelemetryState::default(),
            fs_events: Vec::new(),
            finalized_at: None,
            extra: BTreeMap::new(),
        }
    }

    /// Append operation events, keeping only the newest [`MAX_FS_EVENTS`].
    pub fn record_fs_events(&mut self, events: Vec<OpEvent>) {
        self.fs_events.extend(events);
        let excess = self.fs_events.len().saturating_sub(MAX_FS_EVENTS);
        self.fs_events.drain(..excess);
    }
}

/// Caller-supplied task payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunInputs {
    pub story: String,
    pub diff_path: Option<String>,
    pub branch: Option<String>,
    pub base_branch: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanSource {
    #[default]
    None,
    Generated,
    Fallback,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlanState {
    pub change_request_md: String,
    pub test_plan_md: String,
    pub source: PlanSource,
    /// Why the generator output was not used, when `source` is fallback.
    pub generator_note: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextState {
    pub repo_tree: Vec<String>,
    pub key_files: BTreeMap<String, String>,
    pub current_diff: String,
    /// `git status --porcelain` entries as `XY path`.
    pub working_changes: Vec<String>,
    pub constraints: Constraints,
    /// Non-fatal problems hit while gathering context.
    pub warnings: Vec<String>,
}

/// Limits the generator must respect when proposing edits.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Constraints {
    pub allowed_write_roots: Vec<String>,
    pub allowed_commands: Vec<Vec<String>>,
}

/// One candidate edit produced by PROPOSE_CHANGES.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProposedStep {
    pub id: String,
    pub file: String,
    pub intent: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EditsState {
    pub proposed_steps: Vec<ProposedStep>,
    pub selected_step_id: Option<String>,
    pub source: PlanSource,
    /// Patch staged for the next APPLY_CHANGES; cleared once applied.
    pub patch_text: String,
    pub applied_files: Vec<String>,
    pub branch_name: Option<String>,
}

/// Captured outcome of one guarded subprocess.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub command: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `None` when the command timed out or was never spawned.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub timed_out: bool,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Result for a command that could not be run at all.
    pub fn refused(
        command: Vec<String>,
        at: DateTime<Utc>,
        timeout_seconds: u64,
        message: String,
    ) -> Self {
        Self {
            command,
            started_at: at,
            finished_at: at,
            exit_code: None,
            stdout: String::new(),
            stderr: message,
            timeout_seconds,
            timed_out: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestRun {
    pub exit_code: Option<i32>,
    pub passed: bool,
    pub duration_sec: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestsState {
    pub command: Vec<String>,
    pub results: Vec<TestRun>,
    pub duration_sec: f64,
    pub failures: Vec<String>,
    pub last_stdout: String,
    pub last_stderr: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Unknown => "unknown",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RiskState {
    pub impacted_paths: Vec<String>,
    pub regression_level: RiskLevel,
    pub suggested_tests: Vec<String>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StatusMeta {
    pub stage: Option<Stage>,
    pub ok: bool,
    pub message: Option<String>,
}

impl Default for StatusMeta {
    fn default() -> Self {
        Self {
            stage: None,
            ok: true,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Rejected,
}

/// Append-only record of a gate decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalRecord {
    pub gate: Gate,
    pub approver: String,
    #[serde(alias = "approved_at")]
    pub decided_at: DateTime<Utc>,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Read,
    Write,
    Delete,
    Patch,
    Exec,
}

/// One sandboxed filesystem or process operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpEvent {
    pub op: OpKind,
    pub target: String,
    pub ok: bool,
    pub bytes: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-run operation log handed to the sandbox and command guard.
///
/// Callers own the log and decide where its events end up; nothing is
/// recorded globally.
#[derive(Debug, Default)]
pub struct OpLog {
    events: Vec<OpEvent>,
}

impl OpLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: OpEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[OpEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<OpEvent> {
        self.events
    }
}
