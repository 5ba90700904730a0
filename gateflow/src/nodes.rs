//! Stage handlers.
//!
//! Each handler takes the run snapshot, performs its stage, and returns the
//! updated snapshot. Handlers never persist the run themselves; the engine
//! saves after every stage and records telemetry. Artifact writes go through
//! the store (and therefore the sandbox), and their operation events are
//! folded into `run.fs_events`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::core::analysis::{
    classify_risk, diagnose_failures, fallback_step, impacted_paths, is_safe_relative_path,
};
use crate::core::router::Stage;
use crate::core::status::RunStatus;
use crate::core::types::{
    CommandResult, Constraints, OpLog, PlanSource, RiskLevel, Run, TestRun, now,
};
use crate::io::artifacts::{
    ArtifactRenderer, CHANGE_REQUEST, FINAL_SUMMARY, METRICS, PR_COMMENT, RISK_REPORT, RUN_REPORT,
    TEST_PLAN, node_section,
};
use crate::io::config::FlowConfig;
use crate::io::contracts::validate_change_request_file;
use crate::io::generator::{Generator, PlanRequest, PlanResponse, ProposeRequest};
use crate::io::git::Git;
use crate::io::guard::CommandGuard;
use crate::io::metrics::export_metrics;
use crate::io::store::RunStore;

/// Test output embedded in the run report keeps only this many trailing bytes.
const REPORT_OUTPUT_TAIL_BYTES: usize = 4_000;

/// Directories never listed as repository context.
const SKIPPED_DIRS: [&str; 3] = [".git", "target", ".gateflow"];

/// Collaborators available to every stage.
pub struct NodeContext<'a, G: ?Sized> {
    /// Canonical project root; patches apply and tests run here.
    pub root: &'a Path,
    pub config: &'a FlowConfig,
    pub store: &'a RunStore,
    pub guard: &'a CommandGuard,
    pub git: &'a Git,
    pub generator: &'a G,
    pub artifacts: &'a ArtifactRenderer,
}

/// Run the handler for `stage`.
pub fn run_stage<G: Generator + ?Sized>(
    ctx: &NodeContext<'_, G>,
    stage: Stage,
    mut run: Run,
) -> Result<Run> {
    run.status_meta.stage = Some(stage);
    let mut log = OpLog::new();
    let result = match stage {
        Stage::LoadContext => load_context(ctx, &mut run, &mut log),
        Stage::Plan => plan(ctx, &mut run, &mut log),
        Stage::ProposeChanges => propose_changes(ctx, &mut run, &mut log),
        Stage::AwaitApproval => await_approval(&mut run),
        Stage::ApplyChanges => apply_changes(ctx, &mut run, &mut log),
        Stage::RunTests => run_tests(ctx, &mut run, &mut log),
        Stage::Diagnose => diagnose(ctx, &mut run, &mut log),
        Stage::FixLoop => fix_loop(ctx, &mut run, &mut log),
        Stage::RegressionRisk => regression_risk(ctx, &mut run, &mut log),
        Stage::Review => review(ctx, &mut run, &mut log),
        Stage::Finalize => finalize(ctx, &mut run, &mut log),
    };
    run.record_fs_events(log.into_events());
    result.map(|()| run)
}

/// Append a stage section to the run report.
///
/// A failed append is logged and recorded in the op log; the stage outcome
/// stands.
fn report<G: ?Sized>(
    ctx: &NodeContext<'_, G>,
    run: &Run,
    stage: Stage,
    body: &str,
    log: &mut OpLog,
) {
    if let Err(err) = ctx
        .store
        .append_artifact(&run.run_id, RUN_REPORT, &node_section(stage, body), log)
    {
        warn!(stage = %stage, err = %format!("{err:#}"), "run report not updated");
    }
}

#[instrument(skip_all, fields(run_id = %run.run_id))]
fn load_context<G: ?Sized>(ctx: &NodeContext<'_, G>, run: &mut Run, log: &mut OpLog) -> Result<()> {
    let limits = &ctx.config.context;
    let mut warnings = Vec::new();

    let repo_tree = list_repo_files(ctx.root, &ctx.config.runs.outputs_dir, limits.max_tree_entries);

    let mut key_files = std::collections::BTreeMap::new();
    for name in &limits.key_files {
        if !is_safe_relative_path(name) {
            warnings.push(format!("skipped key file with unsafe path: {name}"));
            continue;
        }
        let path = ctx.root.join(name);
        if !path.is_file() {
            continue;
        }
        match ctx.store.sandbox().read_to_string(&path, log) {
            Ok(text) => {
                key_files.insert(name.clone(), truncate_chars(text, limits.max_key_file_chars));
            }
            Err(err) => warnings.push(format!("skipped key file {name}: {err:#}")),
        }
    }

    let outputs = relative_outputs(ctx.root, &ctx.config.runs.outputs_dir);
    let working_changes = match ctx.git.status_porcelain() {
        Ok(entries) => entries
            .into_iter()
            .filter(|entry| {
                let path = Path::new(&entry.path);
                !path.starts_with(&outputs) && !path.starts_with(".gateflow")
            })
            .map(|entry| format!("{} {}", entry.code, entry.path))
            .collect(),
        Err(err) => {
            warnings.push(format!("git status unavailable: {err:#}"));
            Vec::new()
        }
    };

    let current_diff = match &run.inputs.diff_path {
        Some(diff_path) => ctx
            .store
            .sandbox()
            .read_to_string(&ctx.root.join(diff_path), log)
            .unwrap_or_else(|err| {
                warnings.push(format!("diff file unavailable: {err:#}"));
                String::new()
            }),
        None => ctx.git.current_diff().unwrap_or_else(|err| {
            warnings.push(format!("git diff unavailable: {err:#}"));
            String::new()
        }),
    };

    for warning in &warnings {
        warn!(warning = %warning, "context warning");
    }
    run.context.repo_tree = repo_tree;
    run.context.key_files = key_files;
    run.context.current_diff = current_diff;
    run.context.working_changes = working_changes;
    run.context.constraints = Constraints {
        allowed_write_roots: ctx
            .config
            .security
            .allowed_write_roots
            .iter()
            .map(|root| root.display().to_string())
            .collect(),
        allowed_commands: ctx.config.security.allowed_commands.clone(),
    };
    run.context.warnings = warnings;
    if run.status == RunStatus::Created {
        run.transition_to(RunStatus::Planned)?;
    }
    run.status_meta.message = Some("context loaded".to_string());

    let mut body = format!(
        "Files listed: {}\nKey files: {}\nWorking changes: {}",
        run.context.repo_tree.len(),
        join_or_none(run.context.key_files.keys().cloned()),
        run.context.working_changes.len()
    );
    for warning in &run.context.warnings {
        body.push_str(&format!("\n- warning: {warning}"));
    }
    report(ctx, run, Stage::LoadContext, &body, log);
    Ok(())
}

#[instrument(skip_all, fields(run_id = %run.run_id))]
fn plan<G: Generator + ?Sized>(ctx: &NodeContext<'_, G>, run: &mut Run, log: &mut OpLog) -> Result<()> {
    let request = PlanRequest {
        run_id: run.run_id.clone(),
        story: run.inputs.story.clone(),
        repo_tree: run.context.repo_tree.clone(),
        key_files: run.context.key_files.clone(),
        current_diff: run.context.current_diff.clone(),
        working_changes: run.context.working_changes.clone(),
        test_command: ctx.config.runs.test_command.clone(),
        constraints: run.context.constraints.clone(),
    };
    let fallback_note = match ctx.generator.plan(&request) {
        Ok(PlanResponse::Plan(output)) => {
            run.plan.change_request_md = output.change_request_md;
            run.plan.test_plan_md = output.test_plan_md;
            run.plan.source = PlanSource::Generated;
            run.plan.generator_note = None;
            None
        }
        Ok(PlanResponse::Refusal(reason)) => Some(format!("generator refused: {reason}")),
        Err(err) => Some(format!("{err:#}")),
    };
    if let Some(note) = fallback_note {
        info!(note = %note, "using fallback plan");
        let test_command = &ctx.config.runs.test_command;
        run.plan.change_request_md = ctx.artifacts.fallback_change_request(run, test_command)?;
        run.plan.test_plan_md = ctx.artifacts.fallback_test_plan(run, test_command)?;
        run.plan.source = PlanSource::Fallback;
        run.plan.generator_note = Some(note);
    }

    ctx.store
        .write_artifact(&run.run_id, CHANGE_REQUEST, &ensure_newline(&run.plan.change_request_md), log)?;
    ctx.store
        .write_artifact(&run.run_id, TEST_PLAN, &ensure_newline(&run.plan.test_plan_md), log)?;
    run.status_meta.message = Some("plan artifacts written".to_string());

    let mut body = format!("Plan source: {}", plan_source_name(run.plan.source));
    if let Some(note) = &run.plan.generator_note {
        body.push_str(&format!("\nGenerator note: {note}"));
    }
    report(ctx, run, Stage::Plan, &body, log);
    Ok(())
}

#[instrument(skip_all, fields(run_id = %run.run_id, loop_iters = run.loop_iters))]
fn propose_changes<G: Generator + ?Sized>(
    ctx: &NodeContext<'_, G>,
    run: &mut Run,
    log: &mut OpLog,
) -> Result<()> {
    let request = ProposeRequest {
        run_id: run.run_id.clone(),
        story: run.inputs.story.clone(),
        change_request_md: run.plan.change_request_md.clone(),
        current_diff: run.context.current_diff.clone(),
        applied_files: run.edits.applied_files.clone(),
        failures: run.tests.failures.clone(),
        loop_iters: run.loop_iters,
        constraints: run.context.constraints.clone(),
    };
    let proposal = ctx.generator.propose(&request).and_then(|output| {
        output.check()?;
        Ok(output)
    });
    match proposal {
        Ok(output) => {
            run.edits.proposed_steps = output.steps;
            run.edits.source = PlanSource::Generated;
        }
        Err(err) => {
            info!(err = %format!("{err:#}"), "using fallback proposal");
            run.edits.proposed_steps = vec![fallback_step(
                &run.edits.applied_files,
                &run.context.current_diff,
            )];
            run.edits.source = PlanSource::Fallback;
        }
    }
    run.edits.selected_step_id = run.edits.proposed_steps.first().map(|step| step.id.clone());
    if run.status != RunStatus::PatchProposed {
        run.transition_to(RunStatus::PatchProposed)?;
    }
    run.status_meta.message = Some("changes proposed".to_string());

    let body = run
        .edits
        .proposed_steps
        .iter()
        .map(|step| format!("- `{}`: {} ({})", step.file, step.intent, step.id))
        .collect::<Vec<_>>()
        .join("\n");
    report(ctx, run, Stage::ProposeChanges, &body, log);
    Ok(())
}

fn await_approval(run: &mut Run) -> Result<()> {
    let waiting = match run.status {
        RunStatus::Planned => Some(RunStatus::WaitingApprovalPlan),
        RunStatus::PatchProposed => Some(RunStatus::WaitingApprovalPatch),
        RunStatus::TestsPassed => Some(RunStatus::WaitingApprovalFinal),
        _ => None,
    };
    if let Some(waiting) = waiting {
        run.transition_to(waiting)?;
    }
    run.pending_gate = run.status.waiting_gate();
    if let Some(gate) = run.pending_gate {
        run.status_meta.message = Some(format!("waiting for {gate} approval"));
        debug!(run_id = %run.run_id, gate = %gate, "awaiting approval");
    }
    Ok(())
}

#[instrument(skip_all, fields(run_id = %run.run_id))]
fn apply_changes<G: ?Sized>(ctx: &NodeContext<'_, G>, run: &mut Run, log: &mut OpLog) -> Result<()> {
    let branch = run
        .inputs
        .branch
        .clone()
        .unwrap_or_else(|| format!("{}{}", ctx.config.runs.branch_prefix, run.run_id));
    let base = run
        .inputs
        .base_branch
        .as_deref()
        .unwrap_or(&ctx.config.runs.base_branch);
    if let Err(err) = ctx.git.ensure_branch(&branch, Some(base)) {
        warn!(branch = %branch, err = %format!("{err:#}"), "branch preparation failed");
        run.fail(format!("failed to ensure working branch: {err:#}"))?;
        return Ok(());
    }
    run.edits.branch_name = Some(branch);

    let mut applied = Vec::new();
    if !run.edits.patch_text.trim().is_empty() {
        let contract = validate_change_request_file(
            &ctx.store.artifact_path(&run.run_id, CHANGE_REQUEST)?,
        )?;
        run.contract_issues = contract.issues.clone();
        if !contract.ok {
            warn!(issues = contract.issues.len(), "change request failed contract");
            run.fail(format!(
                "change request contract failed: {}",
                contract.issues.join("; ")
            ))?;
            return Ok(());
        }
        match ctx
            .store
            .sandbox()
            .apply_patch(ctx.root, &run.edits.patch_text, log)
        {
            Ok(files) => applied = files,
            Err(err) => {
                run.fail(format!("patch application failed: {err:#}"))?;
                return Ok(());
            }
        }
        for file in &applied {
            if !run.edits.applied_files.contains(file) {
                run.edits.applied_files.push(file.clone());
            }
        }
        run.edits.patch_text.clear();
    }
    run.transition_to(RunStatus::TestsRunning)?;
    run.status_meta.message = Some("changes applied".to_string());

    let body = format!(
        "Branch: `{}`\nApplied files: {}",
        run.edits.branch_name.as_deref().unwrap_or_default(),
        join_or_none(applied.into_iter())
    );
    report(ctx, run, Stage::ApplyChanges, &body, log);
    Ok(())
}

#[instrument(skip_all, fields(run_id = %run.run_id))]
fn run_tests<G: ?Sized>(ctx: &NodeContext<'_, G>, run: &mut Run, log: &mut OpLog) -> Result<()> {
    let argv = ctx.config.runs.test_command.clone();
    let started = Instant::now();
    let result = ctx.guard.run(&argv, ctx.root, log).unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "test command could not run");
        CommandResult::refused(
            argv.clone(),
            now(),
            ctx.guard.timeout().as_secs(),
            format!("{err:#}"),
        )
    });
    let duration_sec = started.elapsed().as_secs_f64();
    let passed = result.succeeded();

    run.tests.command = argv;
    run.tests.duration_sec = duration_sec;
    run.tests.last_stdout = result.stdout.clone();
    run.tests.last_stderr = result.stderr.clone();
    run.tests.results.push(TestRun {
        exit_code: result.exit_code,
        passed,
        duration_sec,
    });
    let exit_code = result.exit_code;
    run.commands.push(result);
    run.transition_to(if passed {
        RunStatus::TestsPassed
    } else {
        RunStatus::TestsFailed
    })?;
    run.status_meta.message = Some(if passed { "tests passed" } else { "tests failed" }.to_string());
    info!(passed, exit_code = ?exit_code, "tests finished");

    let exit = exit_code.map_or_else(|| "none".to_string(), |code| code.to_string());
    let body = format!(
        "Command: `{}`\nExit code: {exit}\nDuration: {duration_sec:.2}s\nStdout:\n{}\nStderr:\n{}",
        run.tests.command.join(" "),
        tail_bytes(run.tests.last_stdout.trim_end(), REPORT_OUTPUT_TAIL_BYTES),
        tail_bytes(run.tests.last_stderr.trim_end(), REPORT_OUTPUT_TAIL_BYTES)
    );
    report(ctx, run, Stage::RunTests, &body, log);
    Ok(())
}

fn diagnose<G: ?Sized>(ctx: &NodeContext<'_, G>, run: &mut Run, log: &mut OpLog) -> Result<()> {
    run.tests.failures = diagnose_failures(&run.tests.last_stdout, &run.tests.last_stderr);
    run.status_meta.message = Some("test failures diagnosed".to_string());
    let body = run
        .tests
        .failures
        .iter()
        .map(|line| format!("- {line}"))
        .collect::<Vec<_>>()
        .join("\n");
    report(ctx, run, Stage::Diagnose, &body, log);
    Ok(())
}

fn fix_loop<G: ?Sized>(ctx: &NodeContext<'_, G>, run: &mut Run, log: &mut OpLog) -> Result<()> {
    let max_iters = ctx.config.runs.max_iters;
    if run.loop_iters >= max_iters {
        warn!(run_id = %run.run_id, loop_iters = run.loop_iters, "retry budget exhausted");
        run.fail("max iterations exceeded")?;
    } else {
        run.transition_to(RunStatus::PatchProposed)?;
        run.status_meta.message = Some(format!(
            "retrying change proposal ({}/{max_iters})",
            run.loop_iters
        ));
    }
    let body = format!("Loop iterations: {}/{max_iters}\nStatus: {}", run.loop_iters, run.status);
    report(ctx, run, Stage::FixLoop, &body, log);
    Ok(())
}

fn regression_risk<G: ?Sized>(ctx: &NodeContext<'_, G>, run: &mut Run, log: &mut OpLog) -> Result<()> {
    let diff = ctx
        .git
        .current_diff()
        .unwrap_or_else(|_| run.context.current_diff.clone());
    let impacted = impacted_paths(&run.edits.applied_files, &diff);
    let level = classify_risk(impacted.len());
    run.risk.notes = vec![
        match level {
            RiskLevel::Low | RiskLevel::Unknown => "No changed paths detected.",
            RiskLevel::Medium => "Small surface changed; verify related modules.",
            RiskLevel::High => "Multiple files changed; broad regression surface.",
        }
        .to_string(),
    ];
    run.risk.impacted_paths = impacted;
    run.risk.regression_level = level;
    run.risk.suggested_tests = vec![ctx.config.runs.test_command.join(" ")];
    run.status_meta.message = Some(format!("regression risk: {}", level.as_str()));

    let risk_report = ctx.artifacts.risk_report(run)?;
    ctx.store
        .write_artifact(&run.run_id, RISK_REPORT, &risk_report, log)?;
    let body = format!(
        "Level: {}\nImpacted paths: {}",
        level.as_str(),
        join_or_none(run.risk.impacted_paths.iter().cloned())
    );
    report(ctx, run, Stage::RegressionRisk, &body, log);
    Ok(())
}

fn review<G: ?Sized>(ctx: &NodeContext<'_, G>, run: &mut Run, log: &mut OpLog) -> Result<()> {
    let contract =
        validate_change_request_file(&ctx.store.artifact_path(&run.run_id, CHANGE_REQUEST)?)?;
    for issue in &contract.issues {
        let note = format!("contract warning: {issue}");
        if !run.risk.notes.contains(&note) {
            run.risk.notes.push(note);
        }
    }
    run.contract_issues = contract.issues;
    run.status_meta.message = Some(if run.contract_issues.is_empty() {
        "review passed".to_string()
    } else {
        "review completed with contract warnings".to_string()
    });
    if !run.contract_issues.is_empty() {
        let risk_report = ctx.artifacts.risk_report(run)?;
        ctx.store
            .write_artifact(&run.run_id, RISK_REPORT, &risk_report, log)?;
    }
    let body = if run.contract_issues.is_empty() {
        "Change request contract satisfied.".to_string()
    } else {
        run.contract_issues
            .iter()
            .map(|issue| format!("- contract warning: {issue}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    report(ctx, run, Stage::Review, &body, log);
    Ok(())
}

#[instrument(skip_all, fields(run_id = %run.run_id))]
fn finalize<G: ?Sized>(ctx: &NodeContext<'_, G>, run: &mut Run, log: &mut OpLog) -> Result<()> {
    let summary = ctx.artifacts.final_summary(run)?;
    ctx.store
        .write_artifact(&run.run_id, FINAL_SUMMARY, &summary, log)?;
    let comment = ctx.artifacts.pr_comment(run)?;
    ctx.store
        .write_artifact(&run.run_id, PR_COMMENT, &comment, log)?;
    let metrics_path = ctx.store.artifact_path(&run.run_id, METRICS)?;
    export_metrics(run, ctx.store.sandbox(), &metrics_path, log)?;
    if run.finalized_at.is_none() {
        run.finalized_at = Some(now());
    }
    run.status_meta.message = Some("run finalized".to_string());
    info!("run finalized");

    let body = format!(
        "Final status: `{}`\nLoop iterations: {}\nApplied files: {}\nRisk level: `{}`",
        run.status,
        run.loop_iters,
        join_or_none(run.edits.applied_files.iter().cloned()),
        run.risk.regression_level.as_str()
    );
    report(ctx, run, Stage::Finalize, &body, log);
    Ok(())
}

/// Repository files relative to `root`, sorted, skipping VCS, build and run output.
fn list_repo_files(root: &Path, outputs_dir: &Path, max_entries: usize) -> Vec<String> {
    let outputs = relative_outputs(root, outputs_dir);
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let skipped_name = entry.depth() > 0
                && entry.file_type().is_dir()
                && SKIPPED_DIRS
                    .iter()
                    .any(|name| entry.file_name() == *name);
            !skipped_name && !(entry.depth() > 0 && rel.starts_with(&outputs))
        })
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(root).ok()?;
            let parts: Vec<_> = rel.components().map(|c| c.as_os_str().to_str()).collect::<Option<_>>()?;
            Some(parts.join("/"))
        })
        .take(max_entries)
        .collect()
}

/// The outputs dir relative to `root` when it lives inside it.
fn relative_outputs(root: &Path, outputs_dir: &Path) -> PathBuf {
    if outputs_dir.is_absolute() {
        outputs_dir.strip_prefix(root).unwrap_or(outputs_dir).to_path_buf()
    } else {
        outputs_dir.to_path_buf()
    }
}

fn truncate_chars(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text,
    }
}

/// The last `max_bytes` of `text` at a char boundary, marked when cut.
fn tail_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[... {start} bytes omitted]\n{}", &text[start..])
}

fn ensure_newline(text: &str) -> String {
    let mut out = text.to_string();
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn join_or_none(items: impl Iterator<Item = String>) -> String {
    let joined = items.collect::<Vec<_>>().join(", ");
    if joined.is_empty() {
        "(none)".to_string()
    } else {
        joined
    }
}

fn plan_source_name(source: PlanSource) -> &'static str {
    match source {
        PlanSource::None => "none",
        PlanSource::Generated => "generated",
        PlanSource::Fallback => "fallback",
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn repo_listing_skips_vcs_build_and_outputs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        for file in [
            "README.md",
            "src/lib.rs",
            ".git/HEAD",
            "target/debug/x",
            ".gateflow/runs/r1/run.json",
            "out/runs/r1/run.json",
        ] {
            let path = root.join(file);
            fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            fs::write(path, "x").expect("write");
        }
        let listed = list_repo_files(root, Path::new("out/runs"), 250);
        assert_eq!(listed, vec!["README.md".to_string(), "src/lib.rs".to_string()]);
        assert_eq!(list_repo_files(root, Path::new("out/runs"), 1).len(), 1);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo".to_string(), 2), "hé");
        assert_eq!(truncate_chars("hi".to_string(), 5), "hi");
    }

    #[test]
    fn report_output_keeps_the_tail() {
        assert_eq!(tail_bytes("short", 10), "short");
        assert_eq!(tail_bytes("abcdefgh", 3), "[... 5 bytes omitted]\nfgh");
        assert_eq!(tail_bytes("aé", 1), "[... 3 bytes omitted]\n");
    }

    #[test]
    fn await_approval_is_idempotent() {
        let mut run = Run::new("r".to_string(), Default::default(), now());
        run.status = RunStatus::Planned;
        await_approval(&mut run).expect("wait");
        assert_eq!(run.status, RunStatus::WaitingApprovalPlan);
        assert_eq!(run.pending_gate, Some(crate::core::status::Gate::Plan));
        await_approval(&mut run).expect("wait again");
        assert_eq!(run.status, RunStatus::WaitingApprovalPlan);

        run.status = RunStatus::ApprovedPatch;
        await_approval(&mut run).expect("pass through");
        assert_eq!(run.status, RunStatus::ApprovedPatch);
        assert_eq!(run.pending_gate, None);
    }
}
