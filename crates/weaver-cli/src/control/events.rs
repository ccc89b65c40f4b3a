//! Events on the cross-workflow bus the dashboard renders from.

use crate::health::HealthEvent;

#[derive(Debug, Clone)]
pub enum ControlEvent {
    WorkflowCreated {
        key: String,
    },
    WorkflowRemoved {
        key: String,
    },
    WorkflowPaused {
        key: String,
    },
    WorkerNudged {
        key: String,
        worker_id: String,
    },
    WorkerReplaced {
        key: String,
        old_worker_id: String,
        new_worker_id: String,
    },
    /// The beads database changed; caches were flushed and the active mode
    /// should reload.
    ModeRefreshRequested,
    ShutdownInitiated {
        reason: String,
    },
    Health(HealthEvent),
}

impl ControlEvent {
    pub fn workflow_key(&self) -> Option<&str> {
        match self {
            ControlEvent::WorkflowCreated { key }
            | ControlEvent::WorkflowRemoved { key }
            | ControlEvent::WorkflowPaused { key }
            | ControlEvent::WorkerNudged { key, .. }
            | ControlEvent::WorkerReplaced { key, .. } => Some(key),
            ControlEvent::Health(health) => Some(&health.workflow_key),
            ControlEvent::ModeRefreshRequested | ControlEvent::ShutdownInitiated { .. } => None,
        }
    }
}
