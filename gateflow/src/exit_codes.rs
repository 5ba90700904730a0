//! Stable exit codes for gateflow CLI commands.

use crate::core::errors::{StateError, StoreError};

/// Command succeeded; the run is paused at a gate or finalized.
pub const OK: i32 = 0;
/// Invalid config, arguments, contract, or any unclassified error.
pub const INVALID: i32 = 1;
/// The requested action is not legal in the run's current status.
pub const STATE: i32 = 2;
/// The named run does not exist.
pub const NOT_FOUND: i32 = 3;
/// The run ended in FAILED.
pub const RUN_FAILED: i32 = 4;

/// Map an error to its exit code by the typed error it carries.
pub fn for_error(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<StateError>().is_some() {
        return STATE;
    }
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::RunNotFound(_)) => NOT_FOUND,
        _ => INVALID,
    }
}
