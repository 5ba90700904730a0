//! Shared application state for the UI server.

use std::path::PathBuf;
use std::sync::Arc;

use gateflow::io::config::ProjectPaths;
use tokio::sync::broadcast;

/// Events broadcast to SSE clients when files change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A run's `run.json` was written.
    RunChanged { run_id: String },
    ConfigChanged,
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Project root (contains .gateflow/).
    pub project_dir: PathBuf,
    /// Directory holding one subdirectory per run.
    pub outputs_dir: PathBuf,
    /// Broadcast sender for file change events.
    pub event_tx: Arc<broadcast::Sender<ChangeEvent>>,
}

impl AppState {
    pub fn new(project_dir: PathBuf, outputs_dir: PathBuf) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            project_dir,
            outputs_dir,
            event_tx: Arc::new(event_tx),
        }
    }

    /// Path to .gateflow/config.toml.
    pub fn config_path(&self) -> PathBuf {
        ProjectPaths::new(&self.project_dir).config_path
    }
}
