//! Turns health events into concrete remediations.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{HealthEvent, RecoveryAction};
use crate::broker::Broker;
use crate::control::events::ControlEvent;
use crate::control::registry::Registry;
use crate::control::supervisor::Supervisor;

pub struct RecoveryExecutor {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryExecutor {
    /// Subscribe to the cross-workflow bus and act on health events that
    /// carry an action. Remediation failures are logged, never fatal.
    pub fn start(
        registry: Arc<dyn Registry>,
        supervisor: Arc<Supervisor>,
        bus: Arc<Broker<ControlEvent>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut events = bus.subscribe(cancel.clone());
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let ControlEvent::Health(health) = event.payload else {
                    continue;
                };
                let Some(action) = health.action else {
                    continue;
                };
                if registry.get(&health.workflow_key).is_err() {
                    warn!(workflow = %health.workflow_key, "health event for unknown workflow");
                    continue;
                }
                // Jitter keeps simultaneous remediations from aligning.
                let jitter = rand::rng().random_range(0..50u64);
                tokio::time::sleep(Duration::from_millis(jitter)).await;

                let result = Self::remediate(&registry, &supervisor, &health, action).await;
                match result {
                    Ok(()) => info!(
                        workflow = %health.workflow_key,
                        action = ?action,
                        "remediation applied"
                    ),
                    Err(err) => warn!(
                        workflow = %health.workflow_key,
                        action = ?action,
                        %err,
                        "remediation failed"
                    ),
                }
            }
        });
        Self {
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    async fn remediate(
        registry: &Arc<dyn Registry>,
        supervisor: &Arc<Supervisor>,
        health: &HealthEvent,
        action: RecoveryAction,
    ) -> eyre::Result<()> {
        match action {
            RecoveryAction::Nudge => {
                supervisor
                    .nudge_workflow(&health.workflow_key, health.worker_id.as_deref())
                    .await?;
            },
            RecoveryAction::Replace { fresh_session } => {
                supervisor
                    .replace_in_workflow(
                        &health.workflow_key,
                        health.worker_id.as_deref(),
                        fresh_session,
                    )
                    .await?;
            },
            RecoveryAction::Pause => {
                supervisor.pause_workflow(&health.workflow_key)?;
                registry.set_paused(&health.workflow_key, true)?;
            },
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn stopped(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
