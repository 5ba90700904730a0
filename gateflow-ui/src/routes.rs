//! HTTP route handlers for the UI API.
//!
//! Every handler opens a fresh pipeline on a blocking worker, so config edits
//! apply to the next request and engine calls never block the runtime.

use anyhow::anyhow;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use gateflow::core::errors::{StateError, StoreError};
use gateflow::core::router::{Stage, route_from_status};
use gateflow::core::status::{Gate, RunStatus};
use gateflow::core::telemetry::{MetricsSnapshot, compute_metrics};
use gateflow::core::types::Run;
use gateflow::engine::{Pipeline, StopReason};
use gateflow::io::generator::Generator;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/graph", get(get_graph))
        .route("/runs/{run_id}/metrics", get(get_metrics))
        .route("/runs/{run_id}/approve", post(approve))
        .route("/runs/{run_id}/reject", post(reject))
        .route("/runs/{run_id}/advance", post(advance))
}

/// Error body `{"error": "..."}` with a status derived from the typed error.
#[derive(Debug)]
pub struct ApiError(anyhow::Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        if self.0.downcast_ref::<StateError>().is_some() {
            return StatusCode::CONFLICT;
        }
        match self.0.downcast_ref::<StoreError>() {
            Some(StoreError::RunNotFound(_) | StoreError::InvalidRunId(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %format!("{:#}", self.0), "request failed");
        }
        (status, Json(json!({ "error": format!("{:#}", self.0) }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run `f` against a freshly opened pipeline on the blocking pool.
async fn with_pipeline<T, F>(state: &AppState, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Pipeline<Box<dyn Generator>>) -> anyhow::Result<T> + Send + 'static,
{
    let root = state.project_dir.clone();
    let value = tokio::task::spawn_blocking(move || {
        let pipeline = Pipeline::open(&root)?;
        f(&pipeline)
    })
    .await
    .map_err(|err| anyhow!("worker task failed: {err}"))??;
    Ok(Json(value))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    run_id: String,
    status: RunStatus,
    pending_gate: Option<Gate>,
    loop_iters: u32,
    updated_at: String,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id.clone(),
            status: run.status,
            pending_gate: run.pending_gate,
            loop_iters: run.loop_iters,
            updated_at: run.updated_at.to_rfc3339(),
        }
    }
}

/// GET /api/runs - one summary per run, oldest first.
async fn list_runs(State(state): State<AppState>) -> ApiResult<Vec<RunSummary>> {
    with_pipeline(&state, |pipeline| {
        let store = pipeline.store();
        store
            .list_runs()?
            .iter()
            .map(|run_id| store.load(run_id).map(|run| RunSummary::from(&run)))
            .collect()
    })
    .await
}

/// GET /api/runs/{run_id} - the full run record.
async fn get_run(State(state): State<AppState>, Path(run_id): Path<String>) -> ApiResult<Run> {
    with_pipeline(&state, move |pipeline| pipeline.store().load(&run_id)).await
}

#[derive(Debug, Serialize)]
pub struct StageView {
    stage: Stage,
    count: u32,
    total_duration_sec: f64,
}

#[derive(Debug, Serialize)]
pub struct GraphView {
    run_id: String,
    status: RunStatus,
    pending_gate: Option<Gate>,
    /// Stage the next advance would start from; `None` once failed.
    next_stage: Option<Stage>,
    last_stage: Option<Stage>,
    stages: Vec<StageView>,
}

/// GET /api/runs/{run_id}/graph - per-stage visit counts and where the run resumes.
async fn get_graph(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<GraphView> {
    with_pipeline(&state, move |pipeline| {
        let run = pipeline.store().load(&run_id)?;
        Ok(graph_view(&run))
    })
    .await
}

fn graph_view(run: &Run) -> GraphView {
    let stages = Stage::ALL
        .iter()
        .map(|stage| {
            let stats = run.telemetry.node_stats.get(stage);
            StageView {
                stage: *stage,
                count: stats.map_or(0, |s| s.count),
                total_duration_sec: stats.map_or(0.0, |s| s.total_duration_sec),
            }
        })
        .collect();
    let settled = run.status == RunStatus::Finalized && run.finalized_at.is_some();
    GraphView {
        run_id: run.run_id.clone(),
        status: run.status,
        pending_gate: run.pending_gate,
        next_stage: if settled {
            None
        } else {
            route_from_status(run.status)
        },
        last_stage: run.telemetry.node_events.last().map(|event| event.node),
        stages,
    }
}

/// GET /api/runs/{run_id}/metrics - computed on read; nothing is written.
async fn get_metrics(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<MetricsSnapshot> {
    with_pipeline(&state, move |pipeline| {
        Ok(compute_metrics(&pipeline.store().load(&run_id)?))
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    gate: String,
    approver: Option<String>,
    note: Option<String>,
}

/// POST /api/runs/{run_id}/approve
async fn approve(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<DecisionRequest>,
) -> ApiResult<RunSummary> {
    with_pipeline(&state, move |pipeline| {
        let gate: Gate = body.gate.parse()?;
        let run = pipeline.approve(&run_id, gate, body.approver.as_deref())?;
        Ok(RunSummary::from(&run))
    })
    .await
}

/// POST /api/runs/{run_id}/reject
async fn reject(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<DecisionRequest>,
) -> ApiResult<RunSummary> {
    with_pipeline(&state, move |pipeline| {
        let gate: Gate = body.gate.parse()?;
        let run = pipeline.reject(
            &run_id,
            gate,
            body.approver.as_deref(),
            body.note.as_deref(),
        )?;
        Ok(RunSummary::from(&run))
    })
    .await
}

#[derive(Debug, Serialize)]
pub struct AdvanceView {
    run: RunSummary,
    stages: Vec<Stage>,
    stop: &'static str,
}

/// POST /api/runs/{run_id}/advance - drive the run to its next pause.
async fn advance(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<AdvanceView> {
    with_pipeline(&state, move |pipeline| {
        let outcome = pipeline.advance(&run_id)?;
        Ok(AdvanceView {
            run: RunSummary::from(&outcome.run),
            stages: outcome.stages,
            stop: stop_name(outcome.stop),
        })
    })
    .await
}

fn stop_name(stop: StopReason) -> &'static str {
    match stop {
        StopReason::AwaitingApproval(_) => "awaiting_approval",
        StopReason::Finalized => "finalized",
        StopReason::AlreadyFinalized => "already_finalized",
        StopReason::Failed => "failed",
        StopReason::HopLimit => "hop_limit",
    }
}
