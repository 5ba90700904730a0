//! Per-stage timing ledger and derived metrics.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::router::Stage;
use crate::core::status::RunStatus;
use crate::core::types::Run;

/// One stage invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeEvent {
    pub event_id: String,
    pub node: Stage,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_sec: f64,
    pub status_before: RunStatus,
    pub status_after: RunStatus,
    pub ok: bool,
}

impl NodeEvent {
    pub fn new(
        node: Stage,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        status_before: RunStatus,
        status_after: RunStatus,
        ok: bool,
    ) -> Self {
        let micros = (finished_at - started_at).num_microseconds().unwrap_or(0).max(0);
        Self {
            event_id: event_id(node, started_at, finished_at, status_before, status_after),
            node,
            started_at,
            finished_at,
            duration_sec: round6(micros as f64 / 1_000_000.0),
            status_before,
            status_after,
            ok,
        }
    }
}

/// Content-derived id: first 20 hex chars of sha256 over the sorted-key JSON
/// of the identifying fields.
pub fn event_id(
    node: Stage,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    status_before: RunStatus,
    status_after: RunStatus,
) -> String {
    // Keys go in sorted order whichever map backs serde_json::Map.
    let mut payload = serde_json::Map::new();
    payload.insert("finished_at".into(), timestamp(finished_at).into());
    payload.insert("node".into(), node.as_str().into());
    payload.insert("started_at".into(), timestamp(started_at).into());
    payload.insert("status_after".into(), status_after.as_str().into());
    payload.insert("status_before".into(), status_before.as_str().into());
    let canonical = serde_json::Value::Object(payload).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(20);
    id
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeStats {
    pub count: u32,
    pub total_duration_sec: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryState {
    pub node_events: Vec<NodeEvent>,
    pub node_stats: BTreeMap<Stage, NodeStats>,
}

impl TelemetryState {
    /// Append `event` unless an event with the same id is already recorded.
    ///
    /// Returns whether the event was new.
    pub fn record(&mut self, event: NodeEvent) -> bool {
        if self
            .node_events
            .iter()
            .any(|existing| existing.event_id == event.event_id)
        {
            return false;
        }
        let stats = self.node_stats.entry(event.node).or_default();
        stats.count += 1;
        stats.total_duration_sec = round6(stats.total_duration_sec + event.duration_sec);
        self.node_events.push(event);
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageMetrics {
    pub count: u32,
    pub total_duration_sec: f64,
    /// `None` when the stage never ran.
    pub avg_duration_sec: Option<f64>,
}

/// On-demand summary of a run, exported as `metrics.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub total_duration_sec: f64,
    pub loop_iters: u32,
    pub test_failures: u32,
    pub run_failed: bool,
    pub total_failures: u32,
    pub has_node_telemetry: bool,
    pub stages: BTreeMap<Stage, StageMetrics>,
}

pub fn compute_metrics(run: &Run) -> MetricsSnapshot {
    let micros = (run.updated_at - run.created_at)
        .num_microseconds()
        .unwrap_or(0)
        .max(0);
    let test_failures = run.tests.results.iter().filter(|r| !r.passed).count() as u32;
    let run_failed = run.status == RunStatus::Failed;

    let stages = Stage::ALL
        .iter()
        .map(|stage| {
            let stats = run.telemetry.node_stats.get(stage).cloned().unwrap_or_default();
            let avg = (stats.count > 0)
                .then(|| round6(stats.total_duration_sec / f64::from(stats.count)));
            (
                *stage,
                StageMetrics {
                    count: stats.count,
                    total_duration_sec: stats.total_duration_sec,
                    avg_duration_sec: avg,
                },
            )
        })
        .collect();

    MetricsSnapshot {
        run_id: run.run_id.clone(),
        status: run.status,
        total_duration_sec: round6(micros as f64 / 1_000_000.0),
        loop_iters: run.loop_iters,
        test_failures,
        run_failed,
        total_failures: test_failures + u32::from(run_failed),
        has_node_telemetry: !run.telemetry.node_events.is_empty(),
        stages,
    }
}
