//! Human approval gates.
//!
//! Both operations load, mutate and save through the store, so a refused
//! decision leaves `run.json` untouched.

use anyhow::Result;
use tracing::info;

use crate::core::status::Gate;
use crate::core::types::{Run, now};
use crate::io::store::RunStore;

/// Recorded when the caller names no approver.
pub const DEFAULT_APPROVER: &str = "local";

pub fn approve_gate(
    store: &RunStore,
    run_id: &str,
    gate: Gate,
    approver: Option<&str>,
) -> Result<Run> {
    let approver = approver_name(approver);
    let run = store.update(run_id, |run| Ok(run.approve_gate(gate, approver, now())?))?;
    info!(run_id, gate = %gate, approver, "gate approved");
    Ok(run)
}

pub fn reject_gate(
    store: &RunStore,
    run_id: &str,
    gate: Gate,
    approver: Option<&str>,
    note: Option<&str>,
) -> Result<Run> {
    let approver = approver_name(approver);
    let run = store.update(run_id, |run| {
        Ok(run.reject_gate(gate, approver, note, now())?)
    })?;
    info!(run_id, gate = %gate, approver, "gate rejected");
    Ok(run)
}

fn approver_name(approver: Option<&str>) -> &str {
    approver
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_APPROVER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::StateError;
    use crate::core::status::RunStatus;
    use crate::core::types::{Decision, RunInputs};
    use crate::test_support::TestRepo;

    fn waiting_run(store: &RunStore, status: RunStatus) -> String {
        let run = store.init_run(RunInputs::default()).expect("init");
        store
            .update(&run.run_id, |run| {
                run.status = status;
                run.pending_gate = status.waiting_gate();
                Ok(())
            })
            .expect("update");
        run.run_id
    }

    #[test]
    fn approve_records_decision_and_clears_gate() {
        let repo = TestRepo::new();
        let store = repo.store();
        let run_id = waiting_run(&store, RunStatus::WaitingApprovalPlan);

        let run = approve_gate(&store, &run_id, Gate::Plan, Some("  ")).expect("approve");
        assert_eq!(run.status, RunStatus::ApprovedPlan);
        assert_eq!(run.pending_gate, None);
        assert_eq!(run.approvals.len(), 1);
        assert_eq!(run.approvals[0].approver, "local");
        assert_eq!(run.approvals[0].decision, Decision::Approved);
        assert_eq!(store.load(&run_id).expect("load"), run);
    }

    #[test]
    fn wrong_gate_leaves_run_unchanged() {
        let repo = TestRepo::new();
        let store = repo.store();
        let run_id = waiting_run(&store, RunStatus::WaitingApprovalPlan);
        let before = store.load(&run_id).expect("load");

        let err = approve_gate(&store, &run_id, Gate::Final, Some("lead")).expect_err("wrong gate");
        assert!(matches!(
            err.downcast_ref::<StateError>(),
            Some(StateError::WrongStatusForGate { .. })
        ));
        assert_eq!(store.load(&run_id).expect("load"), before);
    }

    #[test]
    fn reject_fails_run_with_note() {
        let repo = TestRepo::new();
        let store = repo.store();
        let run_id = waiting_run(&store, RunStatus::WaitingApprovalPatch);

        let run = reject_gate(&store, &run_id, Gate::Patch, Some("lead"), Some("too broad"))
            .expect("reject");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(
            run.failure_reason.as_deref(),
            Some("gate 'patch' rejected by lead: too broad")
        );
        assert_eq!(run.approvals[0].note.as_deref(), Some("too broad"));
    }
}
