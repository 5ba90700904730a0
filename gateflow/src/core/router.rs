//! Pure routing for the pipeline node graph.
//!
//! [`route_from_status`] picks the entry stage for a persisted run, and
//! [`route_after`] follows the graph edges once a stage has run. Both return
//! `None` to stop: the run is paused at a gate or terminal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::status::RunStatus;

/// One node of the pipeline graph. Declaration order is the reporting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    LoadContext,
    Plan,
    ProposeChanges,
    AwaitApproval,
    ApplyChanges,
    RunTests,
    Diagnose,
    FixLoop,
    RegressionRisk,
    Review,
    Finalize,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::LoadContext,
        Stage::Plan,
        Stage::ProposeChanges,
        Stage::AwaitApproval,
        Stage::ApplyChanges,
        Stage::RunTests,
        Stage::Diagnose,
        Stage::FixLoop,
        Stage::RegressionRisk,
        Stage::Review,
        Stage::Finalize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::LoadContext => "LOAD_CONTEXT",
            Stage::Plan => "PLAN",
            Stage::ProposeChanges => "PROPOSE_CHANGES",
            Stage::AwaitApproval => "AWAIT_APPROVAL",
            Stage::ApplyChanges => "APPLY_CHANGES",
            Stage::RunTests => "RUN_TESTS",
            Stage::Diagnose => "DIAGNOSE",
            Stage::FixLoop => "FIX_LOOP",
            Stage::RegressionRisk => "REGRESSION_RISK",
            Stage::Review => "REVIEW",
            Stage::Finalize => "FINALIZE",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry stage for a run resumed at `status`.
pub fn route_from_status(status: RunStatus) -> Option<Stage> {
    match status {
        RunStatus::Created | RunStatus::Planned => Some(Stage::LoadContext),
        RunStatus::WaitingApprovalPlan
        | RunStatus::PatchProposed
        | RunStatus::WaitingApprovalPatch
        | RunStatus::WaitingApprovalFinal => Some(Stage::AwaitApproval),
        RunStatus::ApprovedPlan => Some(Stage::ProposeChanges),
        RunStatus::ApprovedPatch => Some(Stage::ApplyChanges),
        RunStatus::TestsRunning => Some(Stage::RunTests),
        RunStatus::TestsFailed => Some(Stage::Diagnose),
        RunStatus::TestsPassed => Some(Stage::RegressionRisk),
        RunStatus::Finalized => Some(Stage::Finalize),
        RunStatus::Failed => None,
    }
}

/// Successor of `stage` given the status it left the run in.
pub fn route_after(stage: Stage, status: RunStatus) -> Option<Stage> {
    if status == RunStatus::Failed {
        return None;
    }
    match stage {
        Stage::LoadContext => Some(Stage::Plan),
        Stage::Plan | Stage::ProposeChanges | Stage::Review => Some(Stage::AwaitApproval),
        Stage::AwaitApproval => match status {
            RunStatus::ApprovedPlan => Some(Stage::ProposeChanges),
            RunStatus::ApprovedPatch => Some(Stage::ApplyChanges),
            RunStatus::Finalized => Some(Stage::Finalize),
            _ => None,
        },
        Stage::ApplyChanges => Some(Stage::RunTests),
        Stage::RunTests => match status {
            RunStatus::TestsPassed => Some(Stage::RegressionRisk),
            _ => Some(Stage::Diagnose),
        },
        Stage::Diagnose => Some(Stage::FixLoop),
        Stage::FixLoop => match status {
            RunStatus::PatchProposed => Some(Stage::ProposeChanges),
            _ => None,
        },
        Stage::RegressionRisk => Some(Stage::Review),
        Stage::Finalize => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_routes_cover_every_status() {
        assert_eq!(route_from_status(RunStatus::Created), Some(Stage::LoadContext));
        assert_eq!(route_from_status(RunStatus::PatchProposed), Some(Stage::AwaitApproval));
        assert_eq!(route_from_status(RunStatus::ApprovedPatch), Some(Stage::ApplyChanges));
        assert_eq!(route_from_status(RunStatus::TestsFailed), Some(Stage::Diagnose));
        assert_eq!(route_from_status(RunStatus::Finalized), Some(Stage::Finalize));
        assert_eq!(route_from_status(RunStatus::Failed), None);
        for status in RunStatus::ALL {
            if status.waiting_gate().is_some() {
                assert_eq!(route_from_status(status), Some(Stage::AwaitApproval));
            }
        }
    }

    #[test]
    fn await_approval_pauses_on_waiting_statuses() {
        for status in [
            RunStatus::WaitingApprovalPlan,
            RunStatus::WaitingApprovalPatch,
            RunStatus::WaitingApprovalFinal,
        ] {
            assert_eq!(route_after(Stage::AwaitApproval, status), None);
        }
        assert_eq!(
            route_after(Stage::AwaitApproval, RunStatus::ApprovedPlan),
            Some(Stage::ProposeChanges)
        );
    }

    #[test]
    fn failure_stops_every_stage() {
        for stage in Stage::ALL {
            assert_eq!(route_after(stage, RunStatus::Failed), None);
        }
    }

    #[test]
    fn test_outcome_and_fix_loop_branches() {
        assert_eq!(
            route_after(Stage::RunTests, RunStatus::TestsPassed),
            Some(Stage::RegressionRisk)
        );
        assert_eq!(
            route_after(Stage::RunTests, RunStatus::TestsFailed),
            Some(Stage::Diagnose)
        );
        assert_eq!(
            route_after(Stage::FixLoop, RunStatus::PatchProposed),
            Some(Stage::ProposeChanges)
        );
    }

    #[test]
    fn stage_names_serialize_in_screaming_case() {
        let json = serde_json::to_string(&Stage::RegressionRisk).expect("serialize");
        assert_eq!(json, "\"REGRESSION_RISK\"");
        assert_eq!(Stage::RegressionRisk.to_string(), "REGRESSION_RISK");
    }
}
