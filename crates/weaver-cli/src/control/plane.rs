//! The object the dashboard and the API server both talk to.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::events::ControlEvent;
use super::provider::AgentProvider;
use super::registry::{Registry, RegistryError, WorkflowRecord, project_key};
use super::supervisor::{Supervisor, SupervisorError, WorkflowRuntime};
use crate::broker::{Broker, EventKind};
use crate::headless::client::ClientRegistry;
use crate::health::{HealthMonitor, HealthPolicy, RecoveryExecutor};
use crate::workers::worker::Worker;

#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

pub struct ControlPlaneConfig {
    pub max_workers_per_pool: usize,
    pub health_policy: HealthPolicy,
    pub health_tick: Duration,
    pub beads_dir: Option<PathBuf>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            max_workers_per_pool: 4,
            health_policy: HealthPolicy::default(),
            health_tick: Duration::from_secs(5),
            beads_dir: None,
        }
    }
}

/// Composition root: registry + supervisor + event bus + health monitor
/// + recovery executor.
pub struct ControlPlane {
    registry: Arc<dyn Registry>,
    supervisor: Arc<Supervisor>,
    bus: Arc<Broker<ControlEvent>>,
    monitor: Arc<HealthMonitor>,
    executor: RecoveryExecutor,
    beads_dir: Option<PathBuf>,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<dyn Registry>,
        clients: Arc<ClientRegistry>,
        config: ControlPlaneConfig,
    ) -> Arc<Self> {
        let bus = Arc::new(Broker::new());
        let monitor = HealthMonitor::start(config.health_policy, bus.clone(), config.health_tick);
        let supervisor = Arc::new(Supervisor::new(
            clients,
            bus.clone(),
            monitor.clone(),
            config.max_workers_per_pool,
        ));
        let executor = RecoveryExecutor::start(registry.clone(), supervisor.clone(), bus.clone());

        Arc::new(Self {
            registry,
            supervisor,
            bus,
            monitor,
            executor,
            beads_dir: config.beads_dir,
        })
    }

    pub fn bus(&self) -> Arc<Broker<ControlEvent>> {
        self.bus.clone()
    }

    pub fn registry(&self) -> Arc<dyn Registry> {
        self.registry.clone()
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        self.supervisor.clone()
    }

    /// Register a workflow and stand up its pool. The key derives from the
    /// project identity (working directory + VCS remote).
    pub async fn create_workflow(
        &self,
        name: &str,
        workdir: &Path,
        remote: Option<&str>,
        provider: AgentProvider,
    ) -> Result<WorkflowRecord, ControlPlaneError> {
        let key = project_key(workdir, remote);
        let record = WorkflowRecord::new(&key, name, &workdir.display().to_string(), provider.kind());
        self.registry.create(record.clone())?;

        let runtime = WorkflowRuntime {
            provider,
            workdir: workdir.to_path_buf(),
            beads_dir: self.beads_dir.clone(),
        };
        if let Err(err) = self.supervisor.create_pool(&key, runtime).await {
            // Keep registry and supervisor in step.
            let _ = self.registry.remove(&key);
            return Err(err.into());
        }
        self.monitor.register(&key);

        info!(workflow = %key, name, "workflow created");
        self.bus
            .publish(EventKind::Created, ControlEvent::WorkflowCreated { key });
        Ok(record)
    }

    pub async fn start_worker(
        &self,
        key: &str,
        prompt: &str,
    ) -> Result<Arc<Worker>, ControlPlaneError> {
        Ok(self.supervisor.spawn_worker(key, prompt).await?)
    }

    pub fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, ControlPlaneError> {
        Ok(self.registry.list()?)
    }

    pub fn get_workflow(&self, key: &str) -> Result<WorkflowRecord, ControlPlaneError> {
        Ok(self.registry.get(key)?)
    }

    /// Stop a workflow's workers and drop its pool; the record survives.
    pub fn cancel_workflow(&self, key: &str) -> Result<(), ControlPlaneError> {
        self.supervisor.close_workflow(key)?;
        self.monitor.unregister(key);
        Ok(())
    }

    pub fn remove_workflow(&self, key: &str) -> Result<(), ControlPlaneError> {
        if let Err(err) = self.supervisor.close_workflow(key) {
            // The pool may already be gone; the record is authoritative.
            warn!(workflow = key, %err, "closing pool during removal");
        }
        self.monitor.unregister(key);
        self.registry.remove(key)?;
        self.bus.publish(
            EventKind::Deleted,
            ControlEvent::WorkflowRemoved {
                key: key.to_string(),
            },
        );
        Ok(())
    }

    /// Best-effort shutdown: cancel workflows, close pools, stop the
    /// monitor and executor. Gives up when `deadline` elapses.
    pub async fn shutdown(&self, deadline: Duration) {
        self.bus.publish(
            EventKind::Custom("shutdown".to_string()),
            ControlEvent::ShutdownInitiated {
                reason: "control plane shutdown".to_string(),
            },
        );

        let teardown = async {
            self.supervisor.close_all();
            self.monitor.stop();
            self.executor.stop();
            self.executor.stopped().await;
        };
        if tokio::time::timeout(deadline, teardown).await.is_err() {
            warn!("shutdown deadline elapsed before all components released");
        }
        self.bus.close();
        info!("control plane shut down");
    }
}

#[async_trait::async_trait]
impl super::api::WorkflowCreator for ControlPlane {
    async fn create(
        &self,
        request: super::api::CreateWorkflowRequest,
    ) -> eyre::Result<WorkflowRecord> {
        let provider = AgentProvider::new(request.provider);
        let record = self
            .create_workflow(
                &request.name,
                Path::new(&request.workdir),
                request.remote.as_deref(),
                provider,
            )
            .await?;
        Ok(record)
    }
}
