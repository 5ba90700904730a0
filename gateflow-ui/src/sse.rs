//! Server-Sent Events stream and file watcher.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::path::Path;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::state::{AppState, ChangeEvent};

const RUN_FILE: &str = "run.json";

#[derive(Serialize)]
struct SsePayload {
    #[serde(rename = "type")]
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
}

impl From<&ChangeEvent> for SsePayload {
    fn from(event: &ChangeEvent) -> Self {
        match event {
            ChangeEvent::RunChanged { run_id } => SsePayload {
                event_type: "run_changed",
                run_id: Some(run_id.clone()),
            },
            ChangeEvent::ConfigChanged => SsePayload {
                event_type: "config_changed",
                run_id: None,
            },
        }
    }
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(change_event) => {
                    let payload = SsePayload::from(&change_event);
                    if let Ok(json) = serde_json::to_string(&payload) {
                        yield Ok(Event::default().event(payload.event_type).data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Start the file watcher in a background task.
pub fn start_file_watcher(state: AppState) {
    tokio::spawn(async move {
        if let Err(e) = run_file_watcher(state).await {
            warn!(error = %e, "file watcher failed");
        }
    });
}

async fn run_file_watcher(state: AppState) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(100)),
    )?;

    // Runs created after startup land under the outputs dir, so it must exist
    // before it can be watched.
    tokio::fs::create_dir_all(&state.outputs_dir).await?;
    watcher.watch(&state.outputs_dir, RecursiveMode::Recursive)?;
    info!(path = %state.outputs_dir.display(), "watching runs directory");

    let config_path = state.config_path();
    if config_path.exists() {
        watcher.watch(&config_path, RecursiveMode::NonRecursive)?;
        info!(path = %config_path.display(), "watching config");
    }

    let mut pending_events: Vec<NotifyEvent> = Vec::new();
    let mut flush_tick = tokio::time::interval(Duration::from_millis(100));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                pending_events.push(event);
            }
            _ = flush_tick.tick() => {
                if pending_events.is_empty() {
                    continue;
                }
                process_events(&state, &pending_events);
                pending_events.clear();
            }
        }
    }
}

/// Collapse a batch of filesystem events into one broadcast per changed run.
fn process_events(state: &AppState, events: &[NotifyEvent]) {
    let config_path = state.config_path();
    let mut config_changed = false;
    let mut changed_runs = BTreeSet::new();

    for event in events {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }
        for path in &event.paths {
            if path == &config_path {
                config_changed = true;
            } else if let Some(run_id) = run_id_for(&state.outputs_dir, path) {
                changed_runs.insert(run_id);
            }
        }
    }

    if config_changed {
        debug!("broadcasting config change");
        let _ = state.event_tx.send(ChangeEvent::ConfigChanged);
    }
    for run_id in changed_runs {
        debug!(run_id = %run_id, "broadcasting run change");
        let _ = state.event_tx.send(ChangeEvent::RunChanged { run_id });
    }
}

/// `<outputs_dir>/<run_id>/run.json` -> `run_id`.
fn run_id_for(outputs_dir: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(outputs_dir).ok()?;
    let mut components = rel.components();
    let run_id = components.next()?.as_os_str().to_str()?.to_string();
    let file = components.next()?.as_os_str().to_str()?;
    (file == RUN_FILE && components.next().is_none()).then_some(run_id)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn modify_event(path: PathBuf) -> NotifyEvent {
        NotifyEvent {
            kind: EventKind::Modify(notify::event::ModifyKind::Any),
            paths: vec![path],
            attrs: Default::default(),
        }
    }

    fn state() -> AppState {
        let project_dir = std::env::temp_dir()
            .join("gateflow-ui-tests")
            .join(format!("pid-{}", std::process::id()));
        let outputs_dir = project_dir.join(".gateflow").join("runs");
        AppState::new(project_dir, outputs_dir)
    }

    fn drain(rx: &mut broadcast::Receiver<ChangeEvent>) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn run_json_writes_emit_one_event_per_run() {
        let state = state();
        let mut rx = state.event_tx.subscribe();
        let run_a = state.outputs_dir.join("run-a").join("run.json");
        let run_b = state.outputs_dir.join("run-b").join("run.json");

        process_events(
            &state,
            &[
                modify_event(run_b),
                modify_event(run_a.clone()),
                modify_event(run_a),
                modify_event(state.outputs_dir.join("run-a").join("run-report.md")),
            ],
        );

        assert_eq!(
            drain(&mut rx),
            vec![
                ChangeEvent::RunChanged {
                    run_id: "run-a".to_string()
                },
                ChangeEvent::RunChanged {
                    run_id: "run-b".to_string()
                },
            ]
        );
    }

    #[test]
    fn config_write_emits_config_changed() {
        let state = state();
        let mut rx = state.event_tx.subscribe();
        process_events(&state, &[modify_event(state.config_path())]);
        assert_eq!(drain(&mut rx), vec![ChangeEvent::ConfigChanged]);
    }

    #[test]
    fn run_id_requires_run_file_directly_under_run_dir() {
        let outputs = Path::new("/p/.gateflow/runs");
        assert_eq!(
            run_id_for(outputs, Path::new("/p/.gateflow/runs/r1/run.json")).as_deref(),
            Some("r1")
        );
        assert_eq!(run_id_for(outputs, Path::new("/p/.gateflow/runs/r1/x/run.json")), None);
        assert_eq!(run_id_for(outputs, Path::new("/p/other/r1/run.json")), None);
    }
}
