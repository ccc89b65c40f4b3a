//! Debounced watcher over the beads database directory.
//!
//! Raw notify events are filtered down to writes/creates of the database
//! file or its WAL; each relevant event re-arms the debounce timer, and a
//! single `DbChanged` is published when it fires. Watcher faults are
//! published as events and the loop keeps going.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Event as NotifyEvent, EventKind as NotifyEventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::{Broker, Event, EventKind};

pub const DB_BASENAME: &str = "beads.db";
pub const DB_WAL_BASENAME: &str = "beads.db-wal";
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub enum WatchEvent {
    DbChanged,
    WatcherError(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error(transparent)]
    Notify(#[from] notify::Error),
}

pub struct DbWatcher {
    broker: Arc<Broker<WatchEvent>>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DbWatcher {
    /// Watch the directory containing `db_path`. Non-recursive; only the
    /// database file and its WAL are interesting.
    pub fn start(db_path: &Path, debounce: Duration) -> Result<Self, WatcherError> {
        let dir = db_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| match res {
                Ok(event) => {
                    if is_relevant(&event) {
                        let _ = raw_tx.send(Ok(()));
                    }
                },
                Err(err) => {
                    let _ = raw_tx.send(Err(err.to_string()));
                },
            })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(dir = %dir.display(), "watching beads database directory");

        let broker = Arc::new(Broker::new());
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            watcher,
            raw_rx,
            broker.clone(),
            stop.clone(),
            debounce,
        ));

        Ok(Self {
            broker,
            stop,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn subscribe(&self, token: CancellationToken) -> mpsc::Receiver<Event<WatchEvent>> {
        self.broker.subscribe(token)
    }

    pub fn broker(&self) -> Arc<Broker<WatchEvent>> {
        self.broker.clone()
    }

    /// Idempotent; releases the OS watch and the loop task.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub async fn stopped(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for DbWatcher {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run_loop(
    watcher: RecommendedWatcher,
    mut raw_rx: mpsc::UnboundedReceiver<Result<(), String>>,
    broker: Arc<Broker<WatchEvent>>,
    stop: CancellationToken,
    debounce: Duration,
) {
    let mut deadline: Option<tokio::time::Instant> = None;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            raw = raw_rx.recv() => match raw {
                None => break,
                Some(Ok(())) => {
                    // Every relevant write re-arms the timer.
                    deadline = Some(tokio::time::Instant::now() + debounce);
                },
                Some(Err(message)) => {
                    debug!(%message, "watcher backend error");
                    broker.publish(
                        EventKind::Custom("error".to_string()),
                        WatchEvent::WatcherError(message),
                    );
                },
            },
            _ = sleep_until_or_never(deadline), if deadline.is_some() => {
                deadline = None;
                broker.publish(EventKind::Updated, WatchEvent::DbChanged);
            },
        }
    }
    drop(watcher);
    broker.close();
}

async fn sleep_until_or_never(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn is_relevant(event: &NotifyEvent) -> bool {
    let interesting_kind = matches!(
        event.kind,
        NotifyEventKind::Create(_) | NotifyEventKind::Modify(_)
    );
    if !interesting_kind {
        return false;
    }
    event.paths.iter().any(|path| {
        matches!(
            path.file_name().and_then(|n| n.to_str()),
            Some(DB_BASENAME) | Some(DB_WAL_BASENAME)
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    async fn next_event(
        rx: &mut mpsc::Receiver<Event<WatchEvent>>,
        within: Duration,
    ) -> Option<WatchEvent> {
        timeout(within, rx.recv()).await.ok().flatten().map(|e| e.payload)
    }

    #[tokio::test]
    async fn test_burst_of_writes_debounces_to_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join(DB_BASENAME);
        std::fs::write(&db_path, b"seed").unwrap();

        let watcher = DbWatcher::start(&db_path, Duration::from_millis(50)).unwrap();
        let mut events = watcher.subscribe(CancellationToken::new());

        for i in 0..10u8 {
            std::fs::write(&db_path, [i]).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let first = next_event(&mut events, Duration::from_millis(500)).await;
        assert!(matches!(first, Some(WatchEvent::DbChanged)), "expected DbChanged");
        // Quiet period: no further event.
        assert!(next_event(&mut events, Duration::from_millis(150)).await.is_none());

        watcher.stop();
        watcher.stopped().await;
    }

    #[tokio::test]
    async fn test_wal_writes_are_relevant() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join(DB_BASENAME);

        let watcher = DbWatcher::start(&db_path, Duration::from_millis(30)).unwrap();
        let mut events = watcher.subscribe(CancellationToken::new());

        std::fs::write(dir.path().join(DB_WAL_BASENAME), b"wal").unwrap();

        let event = next_event(&mut events, Duration::from_millis(500)).await;
        assert!(matches!(event, Some(WatchEvent::DbChanged)));
        watcher.stop();
    }

    #[tokio::test]
    async fn test_unrelated_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join(DB_BASENAME);

        let watcher = DbWatcher::start(&db_path, Duration::from_millis(30)).unwrap();
        let mut events = watcher.subscribe(CancellationToken::new());

        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        assert!(next_event(&mut events, Duration::from_millis(200)).await.is_none());
        watcher.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_broker() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join(DB_BASENAME);

        let watcher = DbWatcher::start(&db_path, DEFAULT_DEBOUNCE).unwrap();
        let mut events = watcher.subscribe(CancellationToken::new());

        watcher.stop();
        watcher.stop();
        watcher.stopped().await;

        assert!(events.recv().await.is_none());
    }
}
