//! Human-gated change pipeline.
//!
//! A run moves a story through planning, patch proposal, sandboxed patch
//! application, allow-listed test execution and risk review, pausing at three
//! human gates (plan, patch, final). Every run is a directory of artifacts
//! plus a `run.json` record that any stage can resume from.
//!
//! - **[`core`]**: Pure, deterministic logic (status machine, routing, diff
//!   parsing, contract checks, telemetry). No I/O.
//! - **[`io`]**: Side-effecting operations (sandboxed filesystem, run store,
//!   subprocesses, git, generator, artifacts).
//!
//! Orchestration modules ([`nodes`], [`engine`], [`gates`]) combine the two to
//! implement CLI commands and the HTTP surface.

pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod gates;
pub mod io;
pub mod logging;
pub mod nodes;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
