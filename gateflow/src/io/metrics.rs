//! `metrics.json` export.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::telemetry::{MetricsSnapshot, compute_metrics};
use crate::core::types::{OpLog, Run};
use crate::io::sandbox::Sandbox;

/// Compute the run's metrics and write them to `path` through the sandbox.
pub fn export_metrics(
    run: &Run,
    sandbox: &Sandbox,
    path: &Path,
    log: &mut OpLog,
) -> Result<MetricsSnapshot> {
    let snapshot = compute_metrics(run);
    let mut buf = serde_json::to_string_pretty(&snapshot).context("serialize metrics")?;
    buf.push('\n');
    sandbox.write(path, &buf, log)?;
    debug!(path = %path.display(), run_id = %run.run_id, "metrics exported");
    Ok(snapshot)
}
