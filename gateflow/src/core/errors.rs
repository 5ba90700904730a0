//! Typed error taxonomy shared by the core and io layers.
//!
//! Every fallible operation in the crate returns `anyhow::Result`; these enums
//! travel inside it so orchestration code can recover the category with
//! `err.downcast_ref::<T>()`.

use thiserror::Error;

use crate::core::status::{Gate, RunStatus};

/// Caller misuse of the run lifecycle. Surfaced verbatim, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("cannot {action} gate '{gate}' from status '{current}'; expected status '{expected}'")]
    WrongStatusForGate {
        action: &'static str,
        gate: Gate,
        current: RunStatus,
        expected: RunStatus,
    },

    #[error("invalid gate '{0}'; expected one of: final, patch, plan")]
    UnknownGate(String),

    #[error("run is already in terminal status {0}")]
    Terminal(RunStatus),

    #[error("cannot stage a patch while run is in status {0}")]
    PatchNotExpected(RunStatus),
}

/// Structural problems with a unified diff. Fatal to the whole patch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("binary patches are not supported")]
    Binary,

    #[error("renames and copies are not supported: {0}")]
    Rename(String),

    #[error("malformed hunk header: {0}")]
    MalformedHunkHeader(String),

    #[error("missing +++ header after '--- {0}'")]
    MissingNewHeader(String),

    #[error("hunk found before any file header: {0}")]
    HunkWithoutFile(String),

    #[error("no file patches found")]
    NoFilePatches,

    #[error("both old and new paths are /dev/null")]
    BothPathsNull,

    #[error("modify paths differ ({old} -> {new}); renames are not supported")]
    PathMismatch { old: String, new: String },

    #[error("file appears more than once in diff: {0}")]
    DuplicateTarget(String),

    #[error("hunk line counts do not match header (-{old_start},{old_count} +{new_start},{new_count})")]
    LineCountMismatch {
        old_start: usize,
        old_count: usize,
        new_start: usize,
        new_count: usize,
    },

    #[error("hunk starting at old line {0} is outside the file")]
    HunkOutOfRange(usize),

    #[error("context mismatch at line {line}: expected {expected:?}")]
    ContextMismatch { line: usize, expected: String },

    #[error("removal mismatch at line {line}: expected {expected:?}")]
    RemovalMismatch { line: usize, expected: String },

    #[error("unknown hunk line tag in {0:?}")]
    UnknownTag(String),

    #[error("cannot add {0}: file already exists")]
    TargetExists(String),

    #[error("cannot patch {0}: file does not exist")]
    TargetMissing(String),

    #[error("delete patch for {0} does not remove the whole file")]
    DeleteLeavesContent(String),
}

/// Path and size policy violations raised by the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("path not allowed: {path} ({reason})")]
    PathNotAllowed { path: String, reason: String },

    #[error("file too large: {path} is {size} bytes (limit {limit})")]
    FileTooLarge { path: String, size: u64, limit: u64 },

    #[error("diff too large: {0}")]
    DiffTooLarge(String),
}

/// Refusals from the command guard.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command not allowed: {}", .0.join(" "))]
    NotAllowed(Vec<String>),

    #[error("command is empty")]
    Empty,
}

/// Run lookup failures in the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("run already exists: {0}")]
    RunExists(String),

    #[error("invalid run id: {0:?}")]
    InvalidRunId(String),
}
