//! Plan and edit generation.
//!
//! A generator is an external process that reads one JSON request on stdin
//! and prints one JSON object on stdout. Its output is untrusted: anything
//! that fails to parse or violates the bundled schema is reported as an
//! error, and the calling stage falls back to its deterministic output.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Result, anyhow};
use jsonschema::validator_for;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::analysis::is_safe_relative_path;
use crate::core::types::{Constraints, ProposedStep};
use crate::io::config::FlowConfig;
use crate::io::process::run_command_with_timeout;

const PLANNER_SCHEMA: &str = include_str!("schemas/planner.schema.json");
const PROPOSER_SCHEMA: &str = include_str!("schemas/proposer.schema.json");

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^```(?:json)?\s*(.*?)\s*```$").expect("valid code fence regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeneratorError {
    #[error("generator is disabled")]
    Disabled,

    #[error("generator returned an empty response")]
    EmptyResponse,

    #[error("generator response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("generator response violates schema: {0}")]
    SchemaViolation(String),

    #[error("generator proposed an unsafe path: {0:?}")]
    UnsafePath(String),

    #[error("generator proposed no steps")]
    NoSteps,

    #[error("generator timed out after {0}s")]
    TimedOut(u64),

    #[error("generator exited with status {0:?}")]
    Failed(Option<i32>),
}

/// Context handed to the planner.
#[derive(Debug, Clone, Serialize)]
pub struct PlanRequest {
    pub run_id: String,
    pub story: String,
    pub repo_tree: Vec<String>,
    pub key_files: BTreeMap<String, String>,
    pub current_diff: String,
    pub working_changes: Vec<String>,
    pub test_command: Vec<String>,
    pub constraints: Constraints,
}

/// Context handed to the change proposer.
#[derive(Debug, Clone, Serialize)]
pub struct ProposeRequest {
    pub run_id: String,
    pub story: String,
    pub change_request_md: String,
    pub current_diff: String,
    pub applied_files: Vec<String>,
    pub failures: Vec<String>,
    pub loop_iters: u32,
    pub constraints: Constraints,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlannerOutput {
    pub change_request_md: String,
    pub test_plan_md: String,
}

/// A planner either plans or explains why it will not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanResponse {
    Plan(PlannerOutput),
    Refusal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProposerOutput {
    pub steps: Vec<ProposedStep>,
}

impl ProposerOutput {
    /// Reject output with no steps or with a step outside the repository.
    pub fn check(&self) -> Result<(), GeneratorError> {
        if self.steps.is_empty() {
            return Err(GeneratorError::NoSteps);
        }
        match self.steps.iter().find(|step| !is_safe_relative_path(&step.file)) {
            Some(step) => Err(GeneratorError::UnsafePath(step.file.clone())),
            None => Ok(()),
        }
    }
}

pub trait Generator {
    fn plan(&self, request: &PlanRequest) -> Result<PlanResponse>;
    fn propose(&self, request: &ProposeRequest) -> Result<ProposerOutput>;
}

/// Generator used when none is configured. Every call errors, so stages
/// always take their fallback path.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledGenerator;

impl Generator for DisabledGenerator {
    fn plan(&self, _request: &PlanRequest) -> Result<PlanResponse> {
        Err(GeneratorError::Disabled.into())
    }

    fn propose(&self, _request: &ProposeRequest) -> Result<ProposerOutput> {
        Err(GeneratorError::Disabled.into())
    }
}

/// Generator backed by a configured subprocess.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    argv: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandGenerator {
    pub fn new(argv: Vec<String>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            argv,
            workdir: workdir.into(),
            timeout,
            output_limit_bytes: 1_000_000,
        }
    }

    #[instrument(skip_all, fields(kind = kind))]
    fn invoke(&self, kind: &str, request: &impl Serialize) -> Result<String> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(GeneratorError::Disabled.into());
        };
        let payload = serde_json::to_vec(&json!({ "kind": kind, "request": request }))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);
        let output =
            run_command_with_timeout(cmd, Some(&payload), self.timeout, self.output_limit_bytes)?;
        if output.timed_out {
            return Err(GeneratorError::TimedOut(self.timeout.as_secs()).into());
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), stderr = %String::from_utf8_lossy(&output.stderr), "generator failed");
            return Err(GeneratorError::Failed(output.status.code()).into());
        }
        debug!(bytes = output.stdout.len(), "generator responded");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Generator for CommandGenerator {
    fn plan(&self, request: &PlanRequest) -> Result<PlanResponse> {
        let raw = self.invoke("plan", request)?;
        parse_plan_response(&raw)
    }

    fn propose(&self, request: &ProposeRequest) -> Result<ProposerOutput> {
        let raw = self.invoke("propose", request)?;
        parse_proposer_output(&raw)
    }
}

/// Build the generator described by `cfg.generator`.
pub fn from_config(cfg: &FlowConfig, workdir: impl Into<PathBuf>) -> Box<dyn Generator> {
    if cfg.generator.command.is_empty() {
        Box::new(DisabledGenerator)
    } else {
        Box::new(CommandGenerator::new(
            cfg.generator.command.clone(),
            workdir,
            Duration::from_secs(cfg.generator.timeout_seconds),
        ))
    }
}

impl<G: Generator + ?Sized> Generator for Box<G> {
    fn plan(&self, request: &PlanRequest) -> Result<PlanResponse> {
        (**self).plan(request)
    }

    fn propose(&self, request: &ProposeRequest) -> Result<ProposerOutput> {
        (**self).propose(request)
    }
}

pub fn parse_plan_response(raw: &str) -> Result<PlanResponse> {
    let value = parse_generator_json(raw)?;
    validate_against(PLANNER_SCHEMA, &value)?;
    if let Some(refusal) = value.get("refusal").and_then(Value::as_str) {
        return Ok(PlanResponse::Refusal(refusal.trim().to_string()));
    }
    Ok(PlanResponse::Plan(from_value(value)?))
}

pub fn parse_proposer_output(raw: &str) -> Result<ProposerOutput> {
    let value = parse_generator_json(raw)?;
    validate_against(PROPOSER_SCHEMA, &value)?;
    let output: ProposerOutput = from_value(value)?;
    output.check()?;
    Ok(output)
}

/// Parse a JSON object from raw output or from a single fenced block.
pub fn parse_generator_json(raw: &str) -> Result<Value, GeneratorError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(GeneratorError::EmptyResponse);
    }
    let value = match serde_json::from_str::<Value>(text) {
        Ok(value) => value,
        Err(err) => {
            let fenced = CODE_FENCE
                .captures(text)
                .and_then(|caps| caps.get(1))
                .ok_or_else(|| GeneratorError::InvalidJson(err.to_string()))?;
            serde_json::from_str(fenced.as_str())
                .map_err(|err| GeneratorError::InvalidJson(err.to_string()))?
        }
    };
    if !value.is_object() {
        return Err(GeneratorError::InvalidJson("expected a JSON object".to_string()));
    }
    Ok(value)
}

fn validate_against(schema: &str, value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(schema)?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(GeneratorError::SchemaViolation(messages.join("; ")).into());
    }
    Ok(())
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|err| GeneratorError::SchemaViolation(err.to_string()).into())
}
