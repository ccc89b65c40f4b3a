//! Bounded registry of spawned assistants.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::events::WorkerEvent;
use super::worker::{Worker, WorkerOpError, WorkerPhase, WorkerStatus};
use crate::broker::{Broker, Event, EventKind};
use crate::headless::client::{HeadlessClient, SpawnConfig};
use crate::headless::process::{HeadlessProcess, ProcessError};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is closed")]
    PoolClosed,
    #[error("maximum worker count reached")]
    MaxWorkers,
    #[error("worker not found: {0}")]
    WorkerNotFound(String),
    #[error("worker already exists: {0}")]
    DuplicateWorker(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Worker(#[from] WorkerOpError),
}

struct PoolInner {
    workers: HashMap<String, Arc<Worker>>,
    next_id: u64,
    closed: bool,
}

pub struct WorkerPool {
    inner: Mutex<PoolInner>,
    max_workers: usize,
    client: Arc<dyn HeadlessClient>,
    broker: Arc<Broker<WorkerEvent>>,
}

impl WorkerPool {
    pub fn new(client: Arc<dyn HeadlessClient>, max_workers: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                workers: HashMap::new(),
                next_id: 0,
                closed: false,
            }),
            max_workers,
            client,
            broker: Arc::new(Broker::new()),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn subscribe(&self, token: CancellationToken) -> mpsc::Receiver<Event<WorkerEvent>> {
        self.broker.subscribe(token)
    }

    pub fn broker(&self) -> Arc<Broker<WorkerEvent>> {
        self.broker.clone()
    }

    pub fn get(&self, worker_id: &str) -> Option<Arc<Worker>> {
        self.inner.lock().unwrap().workers.get(worker_id).cloned()
    }

    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.inner.lock().unwrap().workers.values().cloned().collect()
    }

    /// Workers that have not been retired.
    pub fn active_workers(&self) -> Vec<Arc<Worker>> {
        self.workers()
            .into_iter()
            .filter(|w| w.status() != WorkerStatus::Retired)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub async fn spawn_worker(&self, config: &SpawnConfig) -> Result<Arc<Worker>, PoolError> {
        let id = self.issue_id()?;
        self.spawn_worker_with_id(id, config).await
    }

    pub async fn spawn_worker_with_id(
        &self,
        id: impl Into<String>,
        config: &SpawnConfig,
    ) -> Result<Arc<Worker>, PoolError> {
        let id = id.into();
        self.check_capacity(Some(&id))?;

        let process = self.client.spawn(config).await?;
        let worker = Arc::new(Worker::new(id.clone(), self.broker.clone()));
        worker.mark_spawn_announced();
        worker.clone().attach(process);

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                worker.cancel();
                return Err(PoolError::PoolClosed);
            }
            let active = inner
                .workers
                .values()
                .filter(|w| w.status() != WorkerStatus::Retired)
                .count();
            if active >= self.max_workers {
                worker.cancel();
                return Err(PoolError::MaxWorkers);
            }
            if inner.workers.contains_key(&id) {
                worker.cancel();
                return Err(PoolError::DuplicateWorker(id));
            }
            inner.workers.insert(id.clone(), worker.clone());
        }

        info!(worker_id = %id, provider = %self.client.kind(), "worker spawned");
        self.broker.publish(
            EventKind::Created,
            WorkerEvent::Spawned {
                worker_id: id,
                session_id: None,
            },
        );
        Ok(worker)
    }

    /// Rebind an existing worker to a freshly spawned process, typically
    /// for the next turn of the same task. Task id and phase survive.
    pub fn resume_worker(
        &self,
        worker_id: &str,
        process: Arc<dyn HeadlessProcess>,
    ) -> Result<Arc<Worker>, PoolError> {
        let worker = self
            .get(worker_id)
            .ok_or_else(|| PoolError::WorkerNotFound(worker_id.to_string()))?;
        worker.clone().resume(process)?;
        Ok(worker)
    }

    pub fn assign_task_to_worker(&self, worker_id: &str, task_id: &str) -> Result<(), PoolError> {
        self.with_worker(worker_id, |worker| Ok(worker.assign_task(task_id)?))
    }

    pub fn set_worker_phase(&self, worker_id: &str, phase: WorkerPhase) -> Result<(), PoolError> {
        self.with_worker(worker_id, |worker| {
            worker.set_phase(phase);
            Ok(())
        })
    }

    pub fn set_worker_task_id(&self, worker_id: &str, task_id: &str) -> Result<(), PoolError> {
        self.with_worker(worker_id, |worker| {
            worker.set_task_id(task_id);
            Ok(())
        })
    }

    pub fn cancel_worker(&self, worker_id: &str) -> Result<(), PoolError> {
        self.with_worker(worker_id, |worker| {
            worker.cancel();
            Ok(())
        })
    }

    pub fn retire_worker(&self, worker_id: &str) -> Result<(), PoolError> {
        self.with_worker(worker_id, |worker| {
            worker.retire();
            Ok(())
        })
    }

    pub fn retire_all(&self) {
        for worker in self.workers() {
            worker.retire();
        }
    }

    /// Log a message against a worker without touching its state.
    pub fn emit_incoming_message(&self, worker_id: &str, message: impl Into<String>) {
        self.broker.publish(
            EventKind::Custom("incoming".to_string()),
            WorkerEvent::IncomingMessage {
                worker_id: worker_id.to_string(),
                message: message.into(),
            },
        );
    }

    /// Idempotent. Retires every live worker (cancelling their processes),
    /// closes the broker, and makes subsequent spawns fail.
    pub fn close(&self) {
        let workers: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.workers.values().cloned().collect()
        };
        for worker in workers {
            worker.cancel();
        }
        self.broker.close();
        info!("worker pool closed");
    }

    fn issue_id(&self) -> Result<String, PoolError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(PoolError::PoolClosed);
        }
        loop {
            inner.next_id += 1;
            let id = format!("worker-{}", inner.next_id);
            if !inner.workers.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    fn check_capacity(&self, _id: Option<&str>) -> Result<(), PoolError> {
        let inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(PoolError::PoolClosed);
        }
        let active = inner
            .workers
            .values()
            .filter(|w| w.status() != WorkerStatus::Retired)
            .count();
        if active >= self.max_workers {
            return Err(PoolError::MaxWorkers);
        }
        Ok(())
    }

    fn with_worker<R>(
        &self,
        worker_id: &str,
        f: impl FnOnce(&Arc<Worker>) -> Result<R, PoolError>,
    ) -> Result<R, PoolError> {
        let worker = self
            .get(worker_id)
            .ok_or_else(|| PoolError::WorkerNotFound(worker_id.to_string()))?;
        f(&worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::client::ProviderKind;
    use crate::headless::process::ProcessStatus;
    use crate::workers::testing::{FakeClient, eventually, spawn_config};

    #[tokio::test]
    async fn test_spawn_up_to_cap_then_err_max_workers() {
        let client = Arc::new(FakeClient::new());
        let pool = WorkerPool::new(client.clone(), 2);

        pool.spawn_worker(&spawn_config()).await.unwrap();
        pool.spawn_worker(&spawn_config()).await.unwrap();
        assert!(matches!(
            pool.spawn_worker(&spawn_config()).await,
            Err(PoolError::MaxWorkers)
        ));
        assert_eq!(pool.active_workers().len(), 2);
    }

    #[tokio::test]
    async fn test_retiring_frees_capacity() {
        let client = Arc::new(FakeClient::new());
        let pool = WorkerPool::new(client.clone(), 2);

        let first = pool.spawn_worker(&spawn_config()).await.unwrap();
        pool.spawn_worker(&spawn_config()).await.unwrap();
        assert!(matches!(
            pool.spawn_worker(&spawn_config()).await,
            Err(PoolError::MaxWorkers)
        ));

        pool.retire_worker(first.id()).unwrap();
        pool.spawn_worker(&spawn_config()).await.unwrap();
        assert_eq!(pool.active_workers().len(), 2);
    }

    #[tokio::test]
    async fn test_pool_ids_unique_across_lifetime() {
        let client = Arc::new(FakeClient::new());
        let pool = WorkerPool::new(client.clone(), 10);

        let a = pool.spawn_worker(&spawn_config()).await.unwrap();
        let b = pool.spawn_worker(&spawn_config()).await.unwrap();
        pool.retire_worker(a.id()).unwrap();
        let c = pool.spawn_worker(&spawn_config()).await.unwrap();

        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_ne!(b.id(), c.id());
    }

    #[tokio::test]
    async fn test_spawn_after_close_fails() {
        let client = Arc::new(FakeClient::new());
        let pool = WorkerPool::new(client.clone(), 2);
        pool.close();
        assert!(matches!(
            pool.spawn_worker(&spawn_config()).await,
            Err(PoolError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_cascades_and_is_idempotent() {
        let client = Arc::new(FakeClient::new());
        let pool = WorkerPool::new(client.clone(), 2);
        let worker = pool.spawn_worker(&spawn_config()).await.unwrap();

        pool.close();
        pool.close();

        assert_eq!(worker.status(), WorkerStatus::Retired);
        let process = client.processes()[0].clone();
        eventually(|| process.status() == ProcessStatus::Cancelled).await;
        assert!(pool.broker().is_closed());
    }

    #[tokio::test]
    async fn test_task_id_preserved_across_resume() {
        let client = Arc::new(FakeClient::new());
        let pool = WorkerPool::new(client.clone(), 2);
        let worker = pool.spawn_worker(&spawn_config()).await.unwrap();

        // First turn completes cleanly; the worker becomes ready.
        {
            let (process, events_tx) = client.take(0);
            drop(events_tx);
            process.finish(ProcessStatus::Completed);
        }
        eventually(|| worker.status() == WorkerStatus::Ready).await;

        pool.assign_task_to_worker(worker.id(), "task-1").unwrap();
        for phase in [
            WorkerPhase::Implementing,
            WorkerPhase::AwaitingReview,
            WorkerPhase::Committing,
        ] {
            pool.set_worker_phase(worker.id(), phase).unwrap();
            assert_eq!(worker.task_id().as_deref(), Some("task-1"));
        }

        // Next turn on a fresh process; task survives the restart.
        let (process, events_tx) = crate::workers::testing::FakeProcess::new();
        pool.resume_worker(worker.id(), process.clone()).unwrap();
        assert_eq!(worker.status(), WorkerStatus::Working);

        drop(events_tx);
        process.finish(ProcessStatus::Completed);
        eventually(|| worker.status() == WorkerStatus::Ready).await;
        assert_eq!(worker.task_id().as_deref(), Some("task-1"));
    }

    #[tokio::test]
    async fn test_emit_incoming_message_only_publishes() {
        let client = Arc::new(FakeClient::new());
        let pool = WorkerPool::new(client.clone(), 2);
        let worker = pool.spawn_worker(&spawn_config()).await.unwrap();

        let token = CancellationToken::new();
        let mut events = pool.subscribe(token);
        pool.emit_incoming_message(worker.id(), "please rebase");

        let status_before = worker.status();
        loop {
            let event = events.recv().await.unwrap();
            if let WorkerEvent::IncomingMessage { worker_id, message } = event.payload {
                assert_eq!(worker_id, worker.id());
                assert_eq!(message, "please rebase");
                break;
            }
        }
        assert_eq!(worker.status(), status_before);
    }

    #[tokio::test]
    async fn test_subscriber_sees_publish_order() {
        let client = Arc::new(FakeClient::new());
        let pool = WorkerPool::new(client.clone(), 4);
        let token = CancellationToken::new();
        let mut events = pool.subscribe(token);

        for i in 0..3 {
            pool.emit_incoming_message("w", format!("m{i}"));
        }
        for i in 0..3 {
            match events.recv().await.unwrap().payload {
                WorkerEvent::IncomingMessage { message, .. } => {
                    assert_eq!(message, format!("m{i}"));
                },
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_client_kind_exposed() {
        let client = Arc::new(FakeClient::new());
        assert_eq!(client.kind(), ProviderKind::Claude);
    }
}
