//! Shared subprocess lifecycle: pipes, reader tasks and status resolution.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::event::OutputEvent;
use super::parser::EventParser;

/// Bounded capacity of the normalized events channel.
pub const EVENTS_CHANNEL_CAPACITY: usize = 100;
/// Bounded capacity of the errors channel; overflow is dropped.
pub const ERRORS_CHANNEL_CAPACITY: usize = 10;
/// Stdout lines longer than this are discarded.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;
/// Upper bound on captured stderr lines kept in memory.
pub const MAX_STDERR_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ProcessStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed | ProcessStatus::Failed | ProcessStatus::Cancelled
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("executable not set")]
    MissingExecutable,
    #[error("parser not set")]
    MissingParser,
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("failed to spawn {executable}: {source}")]
    Spawn {
        executable: String,
        source: std::io::Error,
    },
    #[error("{0} pipe unavailable")]
    Stdio(&'static str),
    #[error("process timed out")]
    Timeout,
    #[error("process exited with code {code}{detail}")]
    Exited { code: i32, detail: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Invoked for every `system/init` event before it is delivered.
pub type InitHook = Arc<dyn Fn(&OutputEvent) + Send + Sync>;

/// The consumable side of a spawned provider process.
///
/// `take_events`/`take_errors` hand out the single receiver each; the
/// channels close when the corresponding reader task exits.
#[async_trait]
pub trait HeadlessProcess: Send + Sync {
    fn provider(&self) -> &str;
    fn status(&self) -> ProcessStatus;
    fn session_ref(&self) -> Option<String>;
    fn working_dir(&self) -> &Path;
    fn take_events(&self) -> Option<mpsc::Receiver<OutputEvent>>;
    fn take_errors(&self) -> Option<mpsc::Receiver<ProcessError>>;
    fn cancellation_token(&self) -> CancellationToken;
    fn cancel(&self);
    async fn wait(&self) -> ProcessStatus;
}

pub struct BaseProcess {
    provider: &'static str,
    working_dir: PathBuf,
    status: Mutex<ProcessStatus>,
    session_ref: Mutex<Option<String>>,
    stderr_lines: Mutex<Vec<String>>,
    capture_stderr: bool,
    cancel_token: CancellationToken,
    timed_out: AtomicBool,
    events_rx: Mutex<Option<mpsc::Receiver<OutputEvent>>>,
    errors_rx: Mutex<Option<mpsc::Receiver<ProcessError>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pid: Mutex<Option<u32>>,
}

impl BaseProcess {
    /// A process starts `pending`: constructed, but no child spawned yet.
    pub(super) fn pending(
        provider: &'static str,
        working_dir: PathBuf,
        capture_stderr: bool,
        cancel_token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            working_dir,
            status: Mutex::new(ProcessStatus::Pending),
            session_ref: Mutex::new(None),
            stderr_lines: Mutex::new(Vec::new()),
            capture_stderr,
            cancel_token,
            timed_out: AtomicBool::new(false),
            events_rx: Mutex::new(None),
            errors_rx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            pid: Mutex::new(None),
        })
    }

    /// Wire up the spawned child: events/errors channels plus the three
    /// reader tasks (stdout parser, stderr reader, waiter). Moves the
    /// status from `pending` to `running`; a cancel that landed before the
    /// child existed is preserved and the waiter reaps immediately.
    pub(super) fn activate(
        self: Arc<Self>,
        child: Child,
        stdout: ChildStdout,
        stderr: ChildStderr,
        parser: Arc<dyn EventParser>,
        on_init: Option<InitHook>,
        timeout: Option<Duration>,
    ) {
        let (events_tx, events_rx) = mpsc::channel(EVENTS_CHANNEL_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(ERRORS_CHANNEL_CAPACITY);
        *self.pid.lock().unwrap() = child.id();
        *self.events_rx.lock().unwrap() = Some(events_rx);
        *self.errors_rx.lock().unwrap() = Some(errors_rx);
        {
            let mut status = self.status.lock().unwrap();
            if *status == ProcessStatus::Pending {
                *status = ProcessStatus::Running;
            }
        }

        let stdout_task = tokio::spawn(Self::run_stdout(
            self.clone(),
            stdout,
            parser,
            on_init,
            events_tx,
        ));
        let stderr_task = tokio::spawn(Self::run_stderr(self.clone(), stderr));
        let waiter_task = tokio::spawn(Self::run_waiter(self.clone(), child, errors_tx, timeout));
        self.tasks
            .lock()
            .unwrap()
            .extend([stdout_task, stderr_task, waiter_task]);
    }

    async fn run_stdout(
        self: Arc<Self>,
        stdout: ChildStdout,
        parser: Arc<dyn EventParser>,
        on_init: Option<InitHook>,
        events_tx: mpsc::Sender<OutputEvent>,
    ) {
        let mut frames = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        while let Some(next) = frames.next().await {
            let line = match next {
                Ok(line) => line,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    debug!(provider = self.provider, "stdout line over budget, discarding");
                    continue;
                },
                Err(LinesCodecError::Io(err)) => {
                    debug!(provider = self.provider, %err, "stdout read failed");
                    break;
                },
            };
            if line.trim().is_empty() {
                continue;
            }

            let mut event = match parser.parse_event(line.as_bytes()) {
                Ok(event) => event,
                Err(err) => {
                    debug!(provider = self.provider, %err, "skipping malformed output line");
                    continue;
                },
            };
            event.raw = Bytes::from(line.into_bytes());
            event.timestamp = Utc::now();

            if let Some(session) = parser.extract_session_ref(&event, &event.raw) {
                self.set_session_ref_if_empty(session);
            }
            if event.is_init() {
                if let Some(hook) = &on_init {
                    hook(&event);
                }
            }

            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                sent = events_tx.send(event) => {
                    if sent.is_err() {
                        break;
                    }
                },
            }
        }
    }

    async fn run_stderr(self: Arc<Self>, stderr: ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if self.capture_stderr {
                let mut captured = self.stderr_lines.lock().unwrap();
                if captured.len() < MAX_STDERR_LINES {
                    captured.push(line);
                }
            } else {
                debug!(provider = self.provider, %line, "subprocess stderr");
            }
        }
    }

    async fn run_waiter(
        self: Arc<Self>,
        mut child: Child,
        errors_tx: mpsc::Sender<ProcessError>,
        timeout: Option<Duration>,
    ) {
        let watchdog = {
            let cancel = self.cancel_token.clone();
            let process = self.clone();
            async move {
                match timeout {
                    Some(limit) => tokio::select! {
                        _ = cancel.cancelled() => {},
                        _ = tokio::time::sleep(limit) => {
                            process.timed_out.store(true, Ordering::SeqCst);
                        },
                    },
                    None => cancel.cancelled().await,
                }
                kill_process_group(process.pid());
            }
        };
        tokio::pin!(watchdog);

        let exit = tokio::select! {
            exit = child.wait() => exit,
            _ = &mut watchdog => {
                let _ = child.start_kill();
                child.wait().await
            },
        };

        {
            let mut status = self.status.lock().unwrap();
            if status.is_terminal() {
                // cancel() already claimed the terminal state
            } else if self.timed_out.load(Ordering::SeqCst) {
                *status = ProcessStatus::Failed;
                send_error(&errors_tx, ProcessError::Timeout);
            } else {
                match exit {
                    Ok(exit) if exit.success() => {
                        *status = ProcessStatus::Completed;
                    },
                    Ok(exit) => {
                        *status = ProcessStatus::Failed;
                        let code = exit.code().unwrap_or(-1);
                        let detail = self.stderr_detail();
                        send_error(&errors_tx, ProcessError::Exited { code, detail });
                    },
                    Err(err) => {
                        *status = ProcessStatus::Failed;
                        send_error(&errors_tx, ProcessError::Io(err));
                    },
                }
            }
        }
        // errors_tx drops here, closing the channel for range-readers
    }

    fn stderr_detail(&self) -> String {
        if !self.capture_stderr {
            return String::new();
        }
        let captured = self.stderr_lines.lock().unwrap();
        if captured.is_empty() {
            String::new()
        } else {
            format!(": {}", captured.join("\n"))
        }
    }

    fn set_session_ref_if_empty(&self, session: String) {
        if session.is_empty() {
            return;
        }
        let mut current = self.session_ref.lock().unwrap();
        if current.is_none() {
            *current = Some(session);
        }
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap()
    }

    pub fn stderr_lines(&self) -> Vec<String> {
        self.stderr_lines.lock().unwrap().clone()
    }
}

#[async_trait]
impl HeadlessProcess for BaseProcess {
    fn provider(&self) -> &str {
        self.provider
    }

    fn status(&self) -> ProcessStatus {
        *self.status.lock().unwrap()
    }

    fn session_ref(&self) -> Option<String> {
        self.session_ref.lock().unwrap().clone()
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
        self.cancel_token.clone()
    }

    /// No-op on a terminal process. Otherwise the status becomes
    /// `cancelled` *before* the token fires: any task woken by the token
    /// must observe `cancelled`, never `running`.
    fn cancel(&self) {
        {
            let mut status = self.status.lock().unwrap();
            if status.is_terminal() {
                return;
            }
            *status = ProcessStatus::Cancelled;
        }
        self.cancel_token.cancel();
    }

    /// Blocks until all three reader tasks have returned. Afterwards the
    /// status is terminal and both channels are closed.
    async fn wait(&self) -> ProcessStatus {
        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(provider = self.provider, %err, "process task panicked");
            }
        }
        self.status()
    }
}

fn send_error(errors_tx: &mpsc::Sender<ProcessError>, error: ProcessError) {
    if let Err(mpsc::error::TrySendError::Full(dropped)) = errors_tx.try_send(error) {
        debug!(%dropped, "errors channel full, dropping");
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        let group = Pid::from_raw(-(pid as i32));
        if let Err(err) = kill(group, Signal::SIGTERM) {
            debug!(%err, "failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_process() -> Arc<BaseProcess> {
        BaseProcess::pending(
            "claude",
            PathBuf::from("."),
            false,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_process_starts_pending() {
        let process = pending_process();
        assert_eq!(process.status(), ProcessStatus::Pending);
        assert!(process.pid().is_none());
        assert!(process.take_events().is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_activation() {
        let process = pending_process();
        process.cancel();
        assert_eq!(process.status(), ProcessStatus::Cancelled);
        assert!(process.cancellation_token().is_cancelled());

        // Terminal; a second cancel is a no-op.
        process.cancel();
        assert_eq!(process.status(), ProcessStatus::Cancelled);
    }

    #[test]
    fn test_terminal_set() {
        assert!(!ProcessStatus::Pending.is_terminal());
        assert!(!ProcessStatus::Running.is_terminal());
        assert!(ProcessStatus::Completed.is_terminal());
        assert!(ProcessStatus::Failed.is_terminal());
        assert!(ProcessStatus::Cancelled.is_terminal());
    }
}
