//! Workflow-scoped spawning and remediation over per-workflow pools.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::events::ControlEvent;
use super::provider::{AgentProvider, UnknownProvider};
use crate::broker::{Broker, EventKind};
use crate::headless::client::{ClientRegistry, SpawnConfig};
use crate::health::HealthMonitor;
use crate::workers::events::WorkerEvent;
use crate::workers::pool::{PoolError, WorkerPool};
use crate::workers::worker::{Worker, WorkerStatus};

/// Sent to a quiet worker before re-driving it.
pub const NUDGE_PROMPT: &str =
    "You have been quiet for a while. Summarize where you are and continue the task.";
/// Initial prompt for a replacement worker.
pub const REPLACE_PROMPT: &str =
    "The previous attempt on this task stalled. Review the current state of the working tree and continue.";

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("workflow has no pool: {0}")]
    PoolNotFound(String),
    #[error("workflow has no active worker: {0}")]
    NoActiveWorker(String),
    #[error(transparent)]
    UnknownProvider(#[from] UnknownProvider),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Everything the supervisor needs to spawn workers for one workflow.
pub struct WorkflowRuntime {
    pub provider: AgentProvider,
    pub workdir: PathBuf,
    pub beads_dir: Option<PathBuf>,
}

struct PoolEntry {
    pool: Arc<WorkerPool>,
    runtime: Arc<WorkflowRuntime>,
    wiring: CancellationToken,
}

pub struct Supervisor {
    clients: Arc<ClientRegistry>,
    bus: Arc<Broker<ControlEvent>>,
    monitor: Arc<HealthMonitor>,
    max_workers_per_pool: usize,
    pools: Mutex<HashMap<String, PoolEntry>>,
}

impl Supervisor {
    pub fn new(
        clients: Arc<ClientRegistry>,
        bus: Arc<Broker<ControlEvent>>,
        monitor: Arc<HealthMonitor>,
        max_workers_per_pool: usize,
    ) -> Self {
        Self {
            clients,
            bus,
            monitor,
            max_workers_per_pool,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Create the pool for a workflow and wire its events into the health
    /// monitor.
    pub async fn create_pool(
        &self,
        key: &str,
        runtime: WorkflowRuntime,
    ) -> Result<Arc<WorkerPool>, SupervisorError> {
        let client = runtime.provider.client(&self.clients).await?;
        let pool = Arc::new(WorkerPool::new(client, self.max_workers_per_pool));
        let wiring = CancellationToken::new();
        self.wire_health(key, &pool, wiring.clone());

        self.pools.lock().unwrap().insert(
            key.to_string(),
            PoolEntry {
                pool: pool.clone(),
                runtime: Arc::new(runtime),
                wiring,
            },
        );
        info!(workflow = key, "pool created");
        Ok(pool)
    }

    fn wire_health(&self, key: &str, pool: &Arc<WorkerPool>, token: CancellationToken) {
        let mut events = pool.subscribe(token.clone());
        let monitor = self.monitor.clone();
        let pool = pool.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                monitor.record_heartbeat(&key);
                match &event.payload {
                    WorkerEvent::Output { .. } => monitor.record_progress(&key),
                    WorkerEvent::Error {
                        worker_id,
                        context_exceeded: true,
                        ..
                    } => monitor.record_context_exhausted(&key, Some(worker_id.clone())),
                    WorkerEvent::StatusChange {
                        status: WorkerStatus::Retired,
                        ..
                    } => {
                        if pool.active_workers().is_empty() {
                            monitor.set_running(&key, false);
                        }
                    },
                    _ => {},
                }
            }
        });
    }

    pub fn pool(&self, key: &str) -> Option<Arc<WorkerPool>> {
        self.pools.lock().unwrap().get(key).map(|e| e.pool.clone())
    }

    fn entry(&self, key: &str) -> Result<(Arc<WorkerPool>, Arc<WorkflowRuntime>), SupervisorError> {
        self.pools
            .lock()
            .unwrap()
            .get(key)
            .map(|e| (e.pool.clone(), e.runtime.clone()))
            .ok_or_else(|| SupervisorError::PoolNotFound(key.to_string()))
    }

    /// Spawn a fresh worker processing `prompt`.
    pub async fn spawn_worker(&self, key: &str, prompt: &str) -> Result<Arc<Worker>, SupervisorError> {
        let (pool, runtime) = self.entry(key)?;
        let config = spawn_config(&runtime, prompt, None);
        Ok(pool.spawn_worker(&config).await?)
    }

    /// Nudge a quiet worker: log the message against it, and if it is idle
    /// re-drive it with a resume process on the same session.
    pub async fn nudge_workflow(
        &self,
        key: &str,
        worker_id: Option<&str>,
    ) -> Result<(), SupervisorError> {
        let (pool, runtime) = self.entry(key)?;
        let worker = pick_worker(&pool, worker_id)
            .ok_or_else(|| SupervisorError::NoActiveWorker(key.to_string()))?;

        pool.emit_incoming_message(worker.id(), NUDGE_PROMPT);
        if worker.status() == WorkerStatus::Ready {
            let client = runtime.provider.client(&self.clients).await?;
            let config = spawn_config(&runtime, NUDGE_PROMPT, worker.session_id());
            let process = client.spawn(&config).await.map_err(PoolError::from)?;
            pool.resume_worker(worker.id(), process)?;
        }

        self.bus.publish(
            EventKind::Updated,
            ControlEvent::WorkerNudged {
                key: key.to_string(),
                worker_id: worker.id().to_string(),
            },
        );
        Ok(())
    }

    /// Replace a worker: cancel it and spawn a successor, carrying the
    /// session over unless a fresh one was requested. The task id moves to
    /// the replacement.
    pub async fn replace_in_workflow(
        &self,
        key: &str,
        worker_id: Option<&str>,
        fresh_session: bool,
    ) -> Result<Arc<Worker>, SupervisorError> {
        let (pool, runtime) = self.entry(key)?;
        let worker = pick_worker(&pool, worker_id)
            .ok_or_else(|| SupervisorError::NoActiveWorker(key.to_string()))?;

        let session = if fresh_session { None } else { worker.session_id() };
        let task_id = worker.task_id();
        worker.cancel();

        let config = spawn_config(&runtime, REPLACE_PROMPT, session);
        let replacement = pool.spawn_worker(&config).await?;
        if let Some(task_id) = task_id {
            replacement.set_task_id(task_id);
        }

        info!(
            workflow = key,
            old = worker.id(),
            new = replacement.id(),
            fresh_session,
            "worker replaced"
        );
        self.bus.publish(
            EventKind::Updated,
            ControlEvent::WorkerReplaced {
                key: key.to_string(),
                old_worker_id: worker.id().to_string(),
                new_worker_id: replacement.id().to_string(),
            },
        );
        Ok(replacement)
    }

    /// Stop all activity in a workflow without tearing the pool down.
    pub fn pause_workflow(&self, key: &str) -> Result<(), SupervisorError> {
        let (pool, _) = self.entry(key)?;
        pool.retire_all();
        self.bus.publish(
            EventKind::Updated,
            ControlEvent::WorkflowPaused {
                key: key.to_string(),
            },
        );
        Ok(())
    }

    /// Tear down one workflow's pool.
    pub fn close_workflow(&self, key: &str) -> Result<(), SupervisorError> {
        let entry = self
            .pools
            .lock()
            .unwrap()
            .remove(key)
            .ok_or_else(|| SupervisorError::PoolNotFound(key.to_string()))?;
        entry.wiring.cancel();
        entry.pool.close();
        Ok(())
    }

    /// Tear down every pool; best-effort, part of shutdown.
    pub fn close_all(&self) {
        let entries: Vec<_> = {
            let mut pools = self.pools.lock().unwrap();
            pools.drain().collect()
        };
        for (key, entry) in entries {
            entry.wiring.cancel();
            entry.pool.close();
            info!(workflow = %key, "pool closed");
        }
    }

    pub fn workflow_keys(&self) -> Vec<String> {
        self.pools.lock().unwrap().keys().cloned().collect()
    }
}

fn pick_worker(pool: &WorkerPool, worker_id: Option<&str>) -> Option<Arc<Worker>> {
    match worker_id {
        Some(id) => pool.get(id).filter(|w| w.status() != WorkerStatus::Retired),
        None => {
            let mut active = pool.active_workers();
            active.sort_by(|a, b| a.id().cmp(b.id()));
            if active.is_empty() {
                warn!("no active worker to remediate");
            }
            active.into_iter().next()
        },
    }
}

fn spawn_config(
    runtime: &WorkflowRuntime,
    prompt: &str,
    session_ref: Option<String>,
) -> SpawnConfig {
    let mut config = SpawnConfig::new(&runtime.workdir, prompt, runtime.provider.kind());
    config.extensions = runtime.provider.extensions().clone();
    config.extra = runtime.provider.extra().clone();
    config.beads_dir = runtime.beads_dir.clone();
    config.session_ref = session_ref;
    config
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::headless::client::{HeadlessClient, ProviderKind};
    use crate::headless::event::{ErrorInfo, ErrorReason, OutputEvent, OutputEventKind};
    use crate::headless::process::ProcessStatus;
    use crate::health::{HealthEventKind, HealthPolicy, RecoveryAction};
    use crate::workers::testing::{FakeClient, eventually};

    struct Harness {
        client: Arc<FakeClient>,
        bus: Arc<Broker<ControlEvent>>,
        monitor: Arc<HealthMonitor>,
        supervisor: Arc<Supervisor>,
    }

    async fn harness() -> Harness {
        let client = Arc::new(FakeClient::new());
        let mut clients = ClientRegistry::new();
        clients.register(client.clone() as Arc<dyn HeadlessClient>);
        let bus = Arc::new(Broker::new());
        let monitor = HealthMonitor::start(
            HealthPolicy::default(),
            bus.clone(),
            Duration::from_secs(60),
        );
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(clients),
            bus.clone(),
            monitor.clone(),
            4,
        ));
        Harness {
            client,
            bus,
            monitor,
            supervisor,
        }
    }

    fn runtime() -> WorkflowRuntime {
        WorkflowRuntime {
            provider: AgentProvider::new(ProviderKind::Claude),
            workdir: PathBuf::from("."),
            beads_dir: None,
        }
    }

    #[tokio::test]
    async fn test_create_pool_and_spawn_worker() {
        let h = harness().await;
        h.supervisor.create_pool("wf", runtime()).await.unwrap();
        h.monitor.register("wf");

        let worker = h.supervisor.spawn_worker("wf", "build the thing").await.unwrap();
        assert_eq!(worker.status(), WorkerStatus::Working);
        assert_eq!(h.client.spawn_count(), 1);
        assert_eq!(h.client.configs()[0].prompt, "build the thing");
    }

    #[tokio::test]
    async fn test_context_exhaustion_flows_to_bus() {
        let h = harness().await;
        let token = CancellationToken::new();
        let mut events = h.bus.subscribe(token);

        h.supervisor.create_pool("wf", runtime()).await.unwrap();
        h.monitor.register("wf");
        h.supervisor.spawn_worker("wf", "go").await.unwrap();

        let (_, events_tx) = h.client.take(0);
        let mut event = OutputEvent::new(OutputEventKind::Result);
        event.is_error_result = true;
        event.error = Some(ErrorInfo {
            message: "Prompt is too long".to_string(),
            code: "invalid_request_error".to_string(),
            reason: ErrorReason::ContextExceeded,
        });
        events_tx.send(event).await.unwrap();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let ControlEvent::Health(health) = event.payload {
                assert_eq!(health.kind, HealthEventKind::ContextExhausted);
                assert_eq!(
                    health.action,
                    Some(RecoveryAction::Replace { fresh_session: true })
                );
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_replace_carries_session_unless_fresh() {
        let h = harness().await;
        h.supervisor.create_pool("wf", runtime()).await.unwrap();
        let worker = h.supervisor.spawn_worker("wf", "go").await.unwrap();

        // Give the first worker a session via its init event.
        {
            let (_, events_tx) = h.client.take(0);
            let mut init = OutputEvent::new(OutputEventKind::System);
            init.subkind = Some("init".to_string());
            init.session_ref = Some("sess-old".to_string());
            events_tx.send(init).await.unwrap();
            eventually(|| worker.session_id().is_some()).await;
        }

        let replacement = h
            .supervisor
            .replace_in_workflow("wf", Some(worker.id()), false)
            .await
            .unwrap();
        assert_ne!(replacement.id(), worker.id());
        assert_eq!(worker.status(), WorkerStatus::Retired);
        let configs = h.client.configs();
        assert_eq!(configs[1].session_ref.as_deref(), Some("sess-old"));

        let fresh = h
            .supervisor
            .replace_in_workflow("wf", Some(replacement.id()), true)
            .await
            .unwrap();
        assert!(h.client.configs()[2].session_ref.is_none());
        assert_eq!(fresh.status(), WorkerStatus::Working);
    }

    #[tokio::test]
    async fn test_replace_moves_task_id() {
        let h = harness().await;
        h.supervisor.create_pool("wf", runtime()).await.unwrap();
        let worker = h.supervisor.spawn_worker("wf", "go").await.unwrap();

        {
            let (process, events_tx) = h.client.take(0);
            drop(events_tx);
            process.finish(ProcessStatus::Completed);
        }
        eventually(|| worker.status() == WorkerStatus::Ready).await;
        worker.assign_task("task-9").unwrap();

        let replacement = h
            .supervisor
            .replace_in_workflow("wf", Some(worker.id()), false)
            .await
            .unwrap();
        assert_eq!(replacement.task_id().as_deref(), Some("task-9"));
    }

    #[tokio::test]
    async fn test_nudge_ready_worker_resumes() {
        let h = harness().await;
        h.supervisor.create_pool("wf", runtime()).await.unwrap();
        let worker = h.supervisor.spawn_worker("wf", "go").await.unwrap();

        {
            let (process, events_tx) = h.client.take(0);
            drop(events_tx);
            process.finish(ProcessStatus::Completed);
        }
        eventually(|| worker.status() == WorkerStatus::Ready).await;

        h.supervisor.nudge_workflow("wf", None).await.unwrap();
        assert_eq!(h.client.spawn_count(), 2);
        assert_eq!(h.client.configs()[1].prompt, NUDGE_PROMPT);
        assert_eq!(worker.status(), WorkerStatus::Working);
    }

    #[tokio::test]
    async fn test_pause_retires_all_workers() {
        let h = harness().await;
        h.supervisor.create_pool("wf", runtime()).await.unwrap();
        let worker = h.supervisor.spawn_worker("wf", "go").await.unwrap();

        h.supervisor.pause_workflow("wf").unwrap();
        assert_eq!(worker.status(), WorkerStatus::Retired);
        assert!(h.supervisor.pool("wf").is_some());
    }

    #[tokio::test]
    async fn test_close_all_tears_down_pools() {
        let h = harness().await;
        h.supervisor.create_pool("wf-a", runtime()).await.unwrap();
        h.supervisor.create_pool("wf-b", runtime()).await.unwrap();

        h.supervisor.close_all();
        assert!(h.supervisor.pool("wf-a").is_none());
        assert!(h.supervisor.pool("wf-b").is_none());
        assert!(h.supervisor.workflow_keys().is_empty());
    }
}
