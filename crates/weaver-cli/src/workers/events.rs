//! Events published on a pool's broker.

use super::worker::{WorkerPhase, WorkerStatus};

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A worker was registered and its process launched.
    Spawned {
        worker_id: String,
        session_id: Option<String>,
    },
    /// Assistant text the UI should surface.
    Output { worker_id: String, output: String },
    /// The worker's process reported an error event.
    Error {
        worker_id: String,
        error: String,
        /// The error was a context-window exhaustion; recovery replaces
        /// the worker instead of nudging it.
        context_exceeded: bool,
    },
    /// Status or phase transition.
    StatusChange {
        worker_id: String,
        status: WorkerStatus,
        phase: WorkerPhase,
    },
    /// A user- or coordinator-authored message logged against the worker.
    /// Purely informational; worker state is untouched.
    IncomingMessage { worker_id: String, message: String },
}

impl WorkerEvent {
    pub fn worker_id(&self) -> &str {
        match self {
            WorkerEvent::Spawned { worker_id, .. }
            | WorkerEvent::Output { worker_id, .. }
            | WorkerEvent::Error { worker_id, .. }
            | WorkerEvent::StatusChange { worker_id, .. }
            | WorkerEvent::IncomingMessage { worker_id, .. } => worker_id,
        }
    }
}
