//! Test doubles shared by the worker, pool, supervisor and health tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::headless::client::{HeadlessClient, ProviderKind, SpawnConfig};
use crate::headless::event::OutputEvent;
use crate::headless::process::{
    EVENTS_CHANNEL_CAPACITY,
    ERRORS_CHANNEL_CAPACITY,
    HeadlessProcess,
    ProcessError,
    ProcessStatus,
};

/// In-memory stand-in for a spawned provider process. Tests feed events
/// through the returned sender and resolve the exit via [`FakeProcess::finish`].
pub struct FakeProcess {
    status_tx: watch::Sender<ProcessStatus>,
    session: Mutex<Option<String>>,
    events_rx: Mutex<Option<mpsc::Receiver<OutputEvent>>>,
    errors_rx: Mutex<Option<mpsc::Receiver<ProcessError>>>,
    token: CancellationToken,
    working_dir: PathBuf,
}

impl FakeProcess {
    pub fn new() -> (Arc<Self>, mpsc::Sender<OutputEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENTS_CHANNEL_CAPACITY);
        let (_errors_tx, errors_rx) = mpsc::channel(ERRORS_CHANNEL_CAPACITY);
        let (status_tx, _) = watch::channel(ProcessStatus::Running);
        let process = Arc::new(Self {
            status_tx,
            session: Mutex::new(None),
            events_rx: Mutex::new(Some(events_rx)),
            errors_rx: Mutex::new(Some(errors_rx)),
            token: CancellationToken::new(),
            working_dir: PathBuf::from("."),
        });
        (process, events_tx)
    }

    pub fn finish(&self, status: ProcessStatus) {
        self.status_tx.send_replace(status);
    }

    pub fn set_session(&self, session: &str) {
        *self.session.lock().unwrap() = Some(session.to_string());
    }
}

#[async_trait]
impl HeadlessProcess for FakeProcess {
    fn provider(&self) -> &str {
        "fake"
    }

    fn status(&self) -> ProcessStatus {
        *self.status_tx.borrow()
    }

    fn session_ref(&self) -> Option<String> {
        self.session.lock().unwrap().clone()
    }

    fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn take_events(&self) -> Option<mpsc::Receiver<OutputEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    fn take_errors(&self) -> Option<mpsc::Receiver<ProcessError>> {
        self.errors_rx.lock().unwrap().take()
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn cancel(&self) {
        if self.status().is_terminal() {
            return;
        }
        self.status_tx.send_replace(ProcessStatus::Cancelled);
        self.token.cancel();
    }

    async fn wait(&self) -> ProcessStatus {
        let mut rx = self.status_tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if rx.changed().await.is_err() {
                return current;
            }
        }
    }
}

/// Client that records every spawn and hands back fakes.
pub struct FakeClient {
    spawned: Mutex<Vec<(Arc<FakeProcess>, mpsc::Sender<OutputEvent>)>>,
    configs: Mutex<Vec<SpawnConfig>>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            spawned: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn configs(&self) -> Vec<SpawnConfig> {
        self.configs.lock().unwrap().clone()
    }

    pub fn processes(&self) -> Vec<Arc<FakeProcess>> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .map(|(process, _)| process.clone())
            .collect()
    }

    /// Remove and return a spawned pair; dropping the sender closes the
    /// process's events channel.
    pub fn take(&self, index: usize) -> (Arc<FakeProcess>, mpsc::Sender<OutputEvent>) {
        self.spawned.lock().unwrap().remove(index)
    }
}

#[async_trait]
impl HeadlessClient for FakeClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    async fn spawn(&self, config: &SpawnConfig) -> Result<Arc<dyn HeadlessProcess>, ProcessError> {
        self.configs.lock().unwrap().push(config.clone());
        let (process, events_tx) = FakeProcess::new();
        self.spawned.lock().unwrap().push((process.clone(), events_tx));
        Ok(process)
    }
}

pub fn spawn_config() -> SpawnConfig {
    SpawnConfig::new(".", "initial prompt", ProviderKind::Claude)
}

/// Poll until `condition` holds; panics after ~2s.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within deadline");
}
