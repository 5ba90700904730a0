//! Run lifecycle state machine: statuses, legal edges, and approval gates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::StateError;
use crate::core::types::{ApprovalRecord, Decision, Run};

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Created,
    Planned,
    WaitingApprovalPlan,
    ApprovedPlan,
    PatchProposed,
    WaitingApprovalPatch,
    ApprovedPatch,
    TestsRunning,
    TestsFailed,
    TestsPassed,
    WaitingApprovalFinal,
    Finalized,
    Failed,
}

impl RunStatus {
    pub const ALL: [RunStatus; 13] = [
        RunStatus::Created,
        RunStatus::Planned,
        RunStatus::WaitingApprovalPlan,
        RunStatus::ApprovedPlan,
        RunStatus::PatchProposed,
        RunStatus::WaitingApprovalPatch,
        RunStatus::ApprovedPatch,
        RunStatus::TestsRunning,
        RunStatus::TestsFailed,
        RunStatus::TestsPassed,
        RunStatus::WaitingApprovalFinal,
        RunStatus::Finalized,
        RunStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Created => "CREATED",
            RunStatus::Planned => "PLANNED",
            RunStatus::WaitingApprovalPlan => "WAITING_APPROVAL_PLAN",
            RunStatus::ApprovedPlan => "APPROVED_PLAN",
            RunStatus::PatchProposed => "PATCH_PROPOSED",
            RunStatus::WaitingApprovalPatch => "WAITING_APPROVAL_PATCH",
            RunStatus::ApprovedPatch => "APPROVED_PATCH",
            RunStatus::TestsRunning => "TESTS_RUNNING",
            RunStatus::TestsFailed => "TESTS_FAILED",
            RunStatus::TestsPassed => "TESTS_PASSED",
            RunStatus::WaitingApprovalFinal => "WAITING_APPROVAL_FINAL",
            RunStatus::Finalized => "FINALIZED",
            RunStatus::Failed => "FAILED",
        }
    }

    /// Legal successors. Terminal statuses have none.
    pub fn successors(self) -> &'static [RunStatus] {
        match self {
            RunStatus::Created => &[RunStatus::Planned],
            RunStatus::Planned => &[RunStatus::WaitingApprovalPlan],
            RunStatus::WaitingApprovalPlan => &[RunStatus::ApprovedPlan],
            RunStatus::ApprovedPlan => &[RunStatus::PatchProposed],
            RunStatus::PatchProposed => &[RunStatus::WaitingApprovalPatch],
            RunStatus::WaitingApprovalPatch => &[RunStatus::ApprovedPatch],
            RunStatus::ApprovedPatch => &[RunStatus::TestsRunning],
            RunStatus::TestsRunning => &[RunStatus::TestsPassed, RunStatus::TestsFailed],
            RunStatus::TestsFailed => &[RunStatus::PatchProposed],
            RunStatus::TestsPassed => &[RunStatus::WaitingApprovalFinal],
            RunStatus::WaitingApprovalFinal => &[RunStatus::Finalized],
            RunStatus::Finalized | RunStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(self, to: RunStatus) -> bool {
        self.successors().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Finalized | RunStatus::Failed)
    }

    /// Gate this status is blocked on, if any.
    pub fn waiting_gate(self) -> Option<Gate> {
        match self {
            RunStatus::WaitingApprovalPlan => Some(Gate::Plan),
            RunStatus::WaitingApprovalPatch => Some(Gate::Patch),
            RunStatus::WaitingApprovalFinal => Some(Gate::Final),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named human approval checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gate {
    Plan,
    Patch,
    Final,
}

impl Gate {
    pub fn as_str(self) -> &'static str {
        match self {
            Gate::Plan => "plan",
            Gate::Patch => "patch",
            Gate::Final => "final",
        }
    }

    /// Status the run must be in for this gate to be decided.
    pub fn waiting_status(self) -> RunStatus {
        match self {
            Gate::Plan => RunStatus::WaitingApprovalPlan,
            Gate::Patch => RunStatus::WaitingApprovalPatch,
            Gate::Final => RunStatus::WaitingApprovalFinal,
        }
    }

    /// Status reached when the gate is approved.
    pub fn approved_status(self) -> RunStatus {
        match self {
            Gate::Plan => RunStatus::ApprovedPlan,
            Gate::Patch => RunStatus::ApprovedPatch,
            Gate::Final => RunStatus::Finalized,
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gate {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plan" => Ok(Gate::Plan),
            "patch" => Ok(Gate::Patch),
            "final" => Ok(Gate::Final),
            _ => Err(StateError::UnknownGate(s.to_string())),
        }
    }
}

impl Run {
    /// Move to `to` along a legal edge.
    ///
    /// TESTS_FAILED -> PATCH_PROPOSED is the retry edge and bumps `loop_iters`.
    /// On error the run is left untouched.
    pub fn transition_to(&mut self, to: RunStatus) -> Result<(), StateError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(StateError::InvalidTransition { from, to });
        }
        if from == RunStatus::TestsFailed && to == RunStatus::PatchProposed {
            self.loop_iters += 1;
        }
        self.status = to;
        Ok(())
    }

    /// Force FAILED from any non-terminal status.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), StateError> {
        if self.status.is_terminal() {
            return Err(StateError::Terminal(self.status));
        }
        let reason = reason.into();
        self.status = RunStatus::Failed;
        self.pending_gate = None;
        self.status_meta.ok = false;
        self.status_meta.message = Some(reason.clone());
        self.failure_reason = Some(reason);
        Ok(())
    }

    pub fn approve_gate(
        &mut self,
        gate: Gate,
        approver: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StateError> {
        self.ensure_gate_status("approve", gate)?;
        self.transition_to(gate.approved_status())?;
        self.pending_gate = None;
        self.approvals.push(ApprovalRecord {
            gate,
            approver: approver.to_string(),
            decided_at: at,
            decision: Decision::Approved,
            note: None,
        });
        Ok(())
    }

    pub fn reject_gate(
        &mut self,
        gate: Gate,
        approver: &str,
        note: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StateError> {
        self.ensure_gate_status("reject", gate)?;
        let note = note.map(str::trim).filter(|n| !n.is_empty());
        let reason = match note {
            Some(note) => format!("gate '{gate}' rejected by {approver}: {note}"),
            None => format!("gate '{gate}' rejected by {approver}"),
        };
        self.fail(reason)?;
        self.approvals.push(ApprovalRecord {
            gate,
            approver: approver.to_string(),
            decided_at: at,
            decision: Decision::Rejected,
            note: note.map(str::to_string),
        });
        Ok(())
    }

    fn ensure_gate_status(&self, action: &'static str, gate: Gate) -> Result<(), StateError> {
        let expected = gate.waiting_status();
        if self.status != expected {
            return Err(StateError::WrongStatusForGate {
                action,
                gate,
                current: self.status,
                expected,
            });
        }
        Ok(())
    }
}
