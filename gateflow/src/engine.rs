//! Driver loop over the stage graph.
//!
//! A [`Pipeline`] owns the collaborators for one project root. `advance`
//! loads a run, resolves its entry stage from the persisted status, and keeps
//! executing stages until the run pauses at a gate, reaches a terminal
//! status, or exceeds the hop bound. The run is saved after every stage.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};

use crate::core::router::{Stage, route_after, route_from_status};
use crate::core::status::{Gate, RunStatus};
use crate::core::telemetry::NodeEvent;
use crate::core::types::{Run, RunInputs, now};
use crate::gates;
use crate::io::artifacts::{ArtifactRenderer, FINAL_SUMMARY};
use crate::io::config::{FlowConfig, ProjectPaths, load_config};
use crate::io::generator::{self, Generator};
use crate::io::git::Git;
use crate::io::guard::CommandGuard;
use crate::io::sandbox::Sandbox;
use crate::io::store::RunStore;
use crate::nodes::{NodeContext, run_stage};

pub const HOP_LIMIT_REASON: &str = "workflow exceeded max graph hops";

/// Why `advance` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Paused at a human gate.
    AwaitingApproval(Gate),
    Finalized,
    /// The run was already finalized and its summary exists; nothing ran.
    AlreadyFinalized,
    Failed,
    HopLimit,
}

#[derive(Debug, Clone)]
pub struct AdvanceOutcome {
    pub run: Run,
    /// Stages executed by this call, in order.
    pub stages: Vec<Stage>,
    pub stop: StopReason,
}

/// Collaborators bound to one project root.
pub struct Pipeline<G> {
    paths: ProjectPaths,
    config: FlowConfig,
    store: RunStore,
    guard: CommandGuard,
    git: Git,
    generator: G,
    artifacts: ArtifactRenderer,
}

impl Pipeline<Box<dyn Generator>> {
    /// Load `.gateflow/config.toml` under `root` (defaults when missing) and
    /// build the configured generator.
    pub fn open(root: &Path) -> Result<Self> {
        let paths = ProjectPaths::new(root);
        let config = load_config(&paths.config_path)?;
        let generator = generator::from_config(&config, root);
        Self::with_generator(root, config, generator)
    }
}

impl<G: Generator> Pipeline<G> {
    pub fn with_generator(root: &Path, config: FlowConfig, generator: G) -> Result<Self> {
        config.validate()?;
        let sandbox = Sandbox::new(
            root,
            &config.security.allowed_write_roots,
            &config.runs.outputs_dir,
            config.security.fs,
        )
        .with_context(|| format!("prepare sandbox for {}", root.display()))?;
        let root = sandbox.base().to_path_buf();
        let paths = ProjectPaths::new(&root);
        let store = RunStore::new(paths.outputs_dir(&config), sandbox);
        Ok(Self {
            guard: CommandGuard::from_config(&config),
            git: Git::new(&root),
            paths,
            config,
            store,
            generator,
            artifacts: ArtifactRenderer::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    fn node_context(&self) -> NodeContext<'_, G> {
        NodeContext {
            root: &self.paths.root,
            config: &self.config,
            store: &self.store,
            guard: &self.guard,
            git: &self.git,
            generator: &self.generator,
            artifacts: &self.artifacts,
        }
    }

    /// Create a run in CREATED.
    pub fn start(&self, inputs: RunInputs) -> Result<Run> {
        self.store.init_run(inputs)
    }

    pub fn approve(&self, run_id: &str, gate: Gate, approver: Option<&str>) -> Result<Run> {
        gates::approve_gate(&self.store, run_id, gate, approver)
    }

    pub fn reject(
        &self,
        run_id: &str,
        gate: Gate,
        approver: Option<&str>,
        note: Option<&str>,
    ) -> Result<Run> {
        gates::reject_gate(&self.store, run_id, gate, approver, note)
    }

    pub fn stage_patch(&self, run_id: &str, patch_text: &str) -> Result<Run> {
        self.store.stage_patch(run_id, patch_text)
    }

    /// Drive `run_id` forward until it pauses or stops.
    ///
    /// A handler error records a failed telemetry event, saves the run as it
    /// was before the stage, and propagates.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub fn advance(&self, run_id: &str) -> Result<AdvanceOutcome> {
        let mut run = self.store.load(run_id)?;
        let mut stages = Vec::new();

        if self.is_settled(&run) {
            debug!("run already finalized");
            return Ok(AdvanceOutcome {
                run,
                stages,
                stop: StopReason::AlreadyFinalized,
            });
        }
        let Some(mut stage) = route_from_status(run.status) else {
            return Ok(AdvanceOutcome {
                run,
                stages,
                stop: StopReason::Failed,
            });
        };

        let ctx = self.node_context();
        let max_hops = self.config.runs.max_hops as usize;
        loop {
            if stages.len() >= max_hops {
                error!(max_hops, stage = %stage, status = %run.status, "routing exceeded hop bound");
                run.fail(HOP_LIMIT_REASON)?;
                self.store.save(&mut run)?;
                return Ok(AdvanceOutcome {
                    run,
                    stages,
                    stop: StopReason::HopLimit,
                });
            }

            let status_before = run.status;
            let started_at = now();
            let snapshot = run.clone();
            debug!(stage = %stage, status = %status_before, "running stage");
            run = match run_stage(&ctx, stage, run) {
                Ok(next) => next,
                Err(err) => {
                    warn!(stage = %stage, err = %format!("{err:#}"), "stage failed");
                    let mut run = snapshot;
                    run.telemetry.record(NodeEvent::new(
                        stage,
                        started_at,
                        now(),
                        status_before,
                        status_before,
                        false,
                    ));
                    self.store.save(&mut run)?;
                    return Err(err.context(format!("stage {stage} failed")));
                }
            };
            run.telemetry.record(NodeEvent::new(
                stage,
                started_at,
                now(),
                status_before,
                run.status,
                run.status != RunStatus::Failed,
            ));
            self.store.save(&mut run)?;
            stages.push(stage);

            match route_after(stage, run.status) {
                Some(next) => stage = next,
                None => break,
            }
        }

        let stop = match (run.status, run.status.waiting_gate()) {
            (_, Some(gate)) => StopReason::AwaitingApproval(gate),
            (RunStatus::Finalized, _) => StopReason::Finalized,
            _ => StopReason::Failed,
        };
        info!(status = %run.status, stages = stages.len(), "advance stopped");
        Ok(AdvanceOutcome { run, stages, stop })
    }

    fn is_settled(&self, run: &Run) -> bool {
        run.status == RunStatus::Finalized
            && run.finalized_at.is_some()
            && self
                .store
                .artifact_path(&run.run_id, FINAL_SUMMARY)
                .is_ok_and(|path| path.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedGenerator, TestRepo};

    #[test]
    fn fresh_run_pauses_at_plan_gate() {
        let repo = TestRepo::new();
        let pipeline = repo.pipeline(ScriptedGenerator::disabled());
        let run = pipeline.start(RunInputs::default()).expect("start");

        let outcome = pipeline.advance(&run.run_id).expect("advance");
        assert_eq!(
            outcome.stages,
            vec![Stage::LoadContext, Stage::Plan, Stage::AwaitApproval]
        );
        assert_eq!(outcome.stop, StopReason::AwaitingApproval(Gate::Plan));
        assert_eq!(outcome.run.status, RunStatus::WaitingApprovalPlan);
        assert_eq!(outcome.run.telemetry.node_events.len(), 3);

        let again = pipeline.advance(&run.run_id).expect("advance again");
        assert_eq!(again.stages, vec![Stage::AwaitApproval]);
        assert_eq!(again.run.status, RunStatus::WaitingApprovalPlan);
    }

    #[test]
    fn hop_bound_forces_failure() {
        let repo = TestRepo::new();
        let mut config = repo.config();
        config.runs.max_hops = 2;
        let pipeline =
            Pipeline::with_generator(repo.root(), config, ScriptedGenerator::disabled())
                .expect("pipeline");
        let run = pipeline.start(RunInputs::default()).expect("start");

        let outcome = pipeline.advance(&run.run_id).expect("advance");
        assert_eq!(outcome.stop, StopReason::HopLimit);
        assert_eq!(outcome.stages.len(), 2);
        assert_eq!(outcome.run.status, RunStatus::Failed);
        assert_eq!(outcome.run.failure_reason.as_deref(), Some(HOP_LIMIT_REASON));
    }

    #[test]
    fn failed_run_does_not_advance() {
        let repo = TestRepo::new();
        let pipeline = repo.pipeline(ScriptedGenerator::disabled());
        let run = pipeline.start(RunInputs::default()).expect("start");
        pipeline.advance(&run.run_id).expect("advance");
        pipeline
            .reject(&run.run_id, Gate::Plan, Some("reviewer"), Some("wrong scope"))
            .expect("reject");

        let outcome = pipeline.advance(&run.run_id).expect("advance");
        assert!(outcome.stages.is_empty());
        assert_eq!(outcome.stop, StopReason::Failed);
    }
}
