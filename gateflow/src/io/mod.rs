//! Side-effecting adapters: filesystem, processes, git, and templates.

pub mod artifacts;
pub mod config;
pub mod contracts;
pub mod generator;
pub mod git;
pub mod guard;
pub mod metrics;
pub mod process;
pub mod sandbox;
pub mod store;
