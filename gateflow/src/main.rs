//! Human-gated change pipeline CLI.
//!
//! Runs live under `.gateflow/runs/<run-id>/`. `run` creates a run and drives
//! it to the first gate; `approve`, `reject` and `patch` act at gates; `next`
//! resumes from the persisted status.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gateflow::core::status::{Gate, RunStatus};
use gateflow::core::types::{OpLog, Run, RunInputs};
use gateflow::engine::{AdvanceOutcome, Pipeline, StopReason};
use gateflow::exit_codes;
use gateflow::io::artifacts::{CHANGE_REQUEST, METRICS};
use gateflow::io::config::{FlowConfig, ProjectPaths, write_config};
use gateflow::io::contracts::validate_change_request_file;
use gateflow::io::metrics::export_metrics;
use gateflow::logging;

#[derive(Parser)]
#[command(name = "gateflow", version, about = "Human-gated change pipeline")]
struct Cli {
    /// Project root containing `.gateflow/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.gateflow/config.toml` with defaults if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Create a run and advance it to the first gate.
    Run {
        #[arg(long)]
        story: String,
        /// Diff file used as context instead of `git diff HEAD`.
        #[arg(long)]
        diff_path: Option<String>,
        /// Working branch (default: `<branch_prefix><run_id>`).
        #[arg(long)]
        branch: Option<String>,
    },
    /// Resume a run from its persisted status.
    Next { run_id: String },
    /// Approve a gate (plan, patch, final).
    Approve {
        run_id: String,
        gate: Gate,
        #[arg(long)]
        approver: Option<String>,
        /// Advance the run after approving.
        #[arg(long)]
        advance: bool,
    },
    /// Reject a gate; the run fails.
    Reject {
        run_id: String,
        gate: Gate,
        #[arg(long)]
        approver: Option<String>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Stage a unified diff for the next apply (`-` reads stdin).
    Patch { run_id: String, file: PathBuf },
    /// Print a run's status.
    Status {
        run_id: String,
        /// Print the full run record as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List run ids, oldest first.
    List,
    /// Check a change request against the contract.
    Validate {
        /// Change request file.
        #[arg(required_unless_present = "run")]
        path: Option<PathBuf>,
        /// Validate this run's change-request.md instead.
        #[arg(long, conflicts_with = "path")]
        run: Option<String>,
    },
    /// Export and print a run's metrics.
    Metrics { run_id: String },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::for_error(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.root;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run {
            story,
            diff_path,
            branch,
        } => {
            let pipeline = Pipeline::open(&root)?;
            let run = pipeline.start(RunInputs {
                story,
                diff_path,
                branch,
                base_branch: Some(pipeline.config().runs.base_branch.clone()),
            })?;
            println!("run_id: {}", run.run_id);
            report_outcome(&pipeline.advance(&run.run_id)?)
        }
        Command::Next { run_id } => report_outcome(&Pipeline::open(&root)?.advance(&run_id)?),
        Command::Approve {
            run_id,
            gate,
            approver,
            advance,
        } => {
            let pipeline = Pipeline::open(&root)?;
            let run = pipeline.approve(&run_id, gate, approver.as_deref())?;
            if advance {
                report_outcome(&pipeline.advance(&run_id)?)
            } else {
                print_run(&run);
                Ok(exit_codes::OK)
            }
        }
        Command::Reject {
            run_id,
            gate,
            approver,
            note,
        } => {
            let run = Pipeline::open(&root)?.reject(
                &run_id,
                gate,
                approver.as_deref(),
                note.as_deref(),
            )?;
            print_run(&run);
            Ok(exit_codes::OK)
        }
        Command::Patch { run_id, file } => {
            let text = read_patch(&file)?;
            let run = Pipeline::open(&root)?.stage_patch(&run_id, &text)?;
            println!("staged {} bytes for {}", text.len(), run.run_id);
            Ok(exit_codes::OK)
        }
        Command::Status { run_id, json } => {
            let run = Pipeline::open(&root)?.store().load(&run_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&run).context("serialize run")?);
            } else {
                print_run(&run);
            }
            Ok(exit_codes::OK)
        }
        Command::List => {
            let pipeline = Pipeline::open(&root)?;
            for run_id in pipeline.store().list_runs()? {
                let run = pipeline.store().load(&run_id)?;
                println!("{}\t{}", run.run_id, run.status);
            }
            Ok(exit_codes::OK)
        }
        Command::Validate { path, run } => cmd_validate(&root, path, run),
        Command::Metrics { run_id } => {
            let pipeline = Pipeline::open(&root)?;
            let store = pipeline.store();
            let run = store.load(&run_id)?;
            let path = store.artifact_path(&run_id, METRICS)?;
            let snapshot = export_metrics(&run, store.sandbox(), &path, &mut OpLog::new())?;
            println!(
                "{}",
                serde_json::to_string_pretty(&snapshot).context("serialize metrics")?
            );
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = ProjectPaths::new(root);
    if paths.config_path.exists() && !force {
        println!("{} already exists", paths.config_path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&paths.config_path, &FlowConfig::default())?;
    println!("wrote {}", paths.config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(root: &Path, path: Option<PathBuf>, run: Option<String>) -> Result<i32> {
    let path = match (path, run) {
        (Some(path), _) => path,
        (None, Some(run_id)) => {
            let pipeline = Pipeline::open(root)?;
            let store = pipeline.store();
            store.load(&run_id)?;
            store.artifact_path(&run_id, CHANGE_REQUEST)?
        }
        (None, None) => anyhow::bail!("pass a change request path or --run"),
    };
    let report = validate_change_request_file(&path)?;
    if report.ok {
        println!("ok");
        return Ok(exit_codes::OK);
    }
    for issue in &report.issues {
        println!("- {issue}");
    }
    Ok(exit_codes::INVALID)
}

fn read_patch(file: &Path) -> Result<String> {
    if file == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("read patch from stdin")?;
        return Ok(text);
    }
    fs::read_to_string(file).with_context(|| format!("read {}", file.display()))
}

fn report_outcome(outcome: &AdvanceOutcome) -> Result<i32> {
    let stages: Vec<&str> = outcome.stages.iter().map(|stage| stage.as_str()).collect();
    if !stages.is_empty() {
        println!("stages: {}", stages.join(" -> "));
    }
    print_run(&outcome.run);
    Ok(match outcome.stop {
        StopReason::Failed | StopReason::HopLimit => exit_codes::RUN_FAILED,
        StopReason::AwaitingApproval(_) | StopReason::Finalized | StopReason::AlreadyFinalized => {
            exit_codes::OK
        }
    })
}

fn print_run(run: &Run) {
    println!("status: {}", run.status);
    if let Some(gate) = run.pending_gate {
        println!("pending gate: {gate}");
    }
    println!("loop iterations: {}", run.loop_iters);
    if run.status == RunStatus::Failed {
        if let Some(reason) = &run.failure_reason {
            println!("failure: {reason}");
        }
    }
}
