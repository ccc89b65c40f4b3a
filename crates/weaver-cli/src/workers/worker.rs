//! Per-assistant state machine driven by the process's events channel.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::events::WorkerEvent;
use crate::broker::{Broker, EventKind};
use crate::headless::event::OutputEvent;
use crate::headless::process::{HeadlessProcess, ProcessStatus};

/// Lines of output retained per worker.
pub const OUTPUT_RING_CAPACITY: usize = 200;
/// Tool results longer than this are truncated before hitting the ring.
pub const TOOL_RESULT_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Ready,
    Working,
    Retired,
}

/// Step in the review-driven task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Idle,
    Implementing,
    AwaitingReview,
    Reviewing,
    AddressingFeedback,
    Committing,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerOpError {
    #[error("worker is not ready (status: {0})")]
    NotReady(WorkerStatus),
    #[error("worker is not working (status: {0})")]
    NotWorking(WorkerStatus),
    #[error("worker is retired")]
    Retired,
}

struct WorkerState {
    task_id: Option<String>,
    session_id: Option<String>,
    status: WorkerStatus,
    phase: WorkerPhase,
    last_error: Option<String>,
    spawn_announced: bool,
}

pub struct Worker {
    id: String,
    started_at: DateTime<Utc>,
    state: Mutex<WorkerState>,
    output: Mutex<VecDeque<String>>,
    process: Mutex<Option<Arc<dyn HeadlessProcess>>>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    broker: Arc<Broker<WorkerEvent>>,
}

impl Worker {
    /// A fresh worker is `working`: it is processing its initial prompt.
    pub fn new(id: impl Into<String>, broker: Arc<Broker<WorkerEvent>>) -> Self {
        Self {
            id: id.into(),
            started_at: Utc::now(),
            state: Mutex::new(WorkerState {
                task_id: None,
                session_id: None,
                status: WorkerStatus::Working,
                phase: WorkerPhase::Idle,
                last_error: None,
                spawn_announced: false,
            }),
            output: Mutex::new(VecDeque::with_capacity(OUTPUT_RING_CAPACITY)),
            process: Mutex::new(None),
            loop_task: Mutex::new(None),
            broker,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn status(&self) -> WorkerStatus {
        self.state.lock().unwrap().status
    }

    pub fn phase(&self) -> WorkerPhase {
        self.state.lock().unwrap().phase
    }

    pub fn task_id(&self) -> Option<String> {
        self.state.lock().unwrap().task_id.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().unwrap().session_id.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().unwrap().last_error.clone()
    }

    pub fn output_lines(&self) -> Vec<String> {
        self.output.lock().unwrap().iter().cloned().collect()
    }

    pub fn process(&self) -> Option<Arc<dyn HeadlessProcess>> {
        self.process.lock().unwrap().clone()
    }

    /// Suppress the event-loop's own `Spawned` announcement; used when the
    /// pool already published one for this worker.
    pub(super) fn mark_spawn_announced(&self) {
        self.state.lock().unwrap().spawn_announced = true;
    }

    /// Bind a process and start consuming its events. The loop runs until
    /// the events channel closes, then resolves the worker's state from
    /// the process exit.
    pub fn attach(self: Arc<Self>, process: Arc<dyn HeadlessProcess>) {
        let events = process.take_events();
        *self.process.lock().unwrap() = Some(process.clone());
        if let Some(events) = events {
            let task = tokio::spawn(self.clone().run_event_loop(events, process));
            *self.loop_task.lock().unwrap() = Some(task);
        }
    }

    /// Rebind to a new process for the next turn; task id and phase are
    /// preserved. Rejected once retired.
    pub fn resume(self: Arc<Self>, process: Arc<dyn HeadlessProcess>) -> Result<(), WorkerOpError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.status == WorkerStatus::Retired {
                return Err(WorkerOpError::Retired);
            }
            state.status = WorkerStatus::Working;
        }
        self.publish_status();
        self.attach(process);
        Ok(())
    }

    async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<OutputEvent>,
        process: Arc<dyn HeadlessProcess>,
    ) {
        // Events are drained and delivered even for a retired worker so
        // late results are not lost.
        while let Some(event) = events.recv().await {
            self.handle_output_event(&event);
        }
        let exit = process.wait().await;
        match exit {
            ProcessStatus::Completed => self.set_status(WorkerStatus::Ready),
            _ => self.set_status(WorkerStatus::Retired),
        }
    }

    fn handle_output_event(&self, event: &OutputEvent) {
        if event.is_init() {
            let announce = {
                let mut state = self.state.lock().unwrap();
                if state.session_id.is_none() {
                    state.session_id = event.session_ref.clone();
                }
                !std::mem::replace(&mut state.spawn_announced, true)
            };
            if announce {
                self.broker.publish(
                    EventKind::Created,
                    WorkerEvent::Spawned {
                        worker_id: self.id.clone(),
                        session_id: event.session_ref.clone(),
                    },
                );
            }
            return;
        }

        if event.is_error() {
            let message = event
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .filter(|m| !m.is_empty())
                .or_else(|| event.subkind.clone())
                .unwrap_or_else(|| "unknown error".to_string());
            let context_exceeded = event
                .error
                .as_ref()
                .is_some_and(|e| e.reason == crate::headless::event::ErrorReason::ContextExceeded);
            self.state.lock().unwrap().last_error = Some(message.clone());
            self.broker.publish(
                EventKind::Custom("error".to_string()),
                WorkerEvent::Error {
                    worker_id: self.id.clone(),
                    error: message,
                    context_exceeded,
                },
            );
            return;
        }

        if let Some(text) = event.assistant_text() {
            self.push_output(text.clone());
            self.broker.publish(
                EventKind::Custom("output".to_string()),
                WorkerEvent::Output {
                    worker_id: self.id.clone(),
                    output: text,
                },
            );
            return;
        }

        if let Some(tool) = &event.tool {
            if let Some(output) = &tool.output {
                // Logged for context only; the preceding assistant event
                // carries the UI relevance.
                let name = if tool.name.is_empty() { "tool" } else { &tool.name };
                self.push_output(truncate_chars(
                    &format!("[{name}] {output}"),
                    TOOL_RESULT_MAX_CHARS,
                ));
            }
        }
    }

    fn push_output(&self, line: String) {
        let mut output = self.output.lock().unwrap();
        if output.len() == OUTPUT_RING_CAPACITY {
            output.pop_front();
        }
        output.push_back(line);
    }

    /// Requires `ready`; the worker moves to `working` on `implementing`.
    pub fn assign_task(&self, task_id: impl Into<String>) -> Result<(), WorkerOpError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.status != WorkerStatus::Ready {
                return Err(WorkerOpError::NotReady(state.status));
            }
            state.task_id = Some(task_id.into());
            state.phase = WorkerPhase::Implementing;
            state.status = WorkerStatus::Working;
        }
        self.publish_status();
        Ok(())
    }

    /// Phase transitions never touch the task id: the UI relies on
    /// `(task id, phase)` staying coherent across process restarts.
    pub fn set_phase(&self, phase: WorkerPhase) {
        self.state.lock().unwrap().phase = phase;
        self.publish_status();
    }

    pub fn set_task_id(&self, task_id: impl Into<String>) {
        self.state.lock().unwrap().task_id = Some(task_id.into());
    }

    /// Moves `working` to `ready`. The task id is preserved so the UI can keep
    /// showing which task just finished.
    pub fn complete_task(&self) -> Result<(), WorkerOpError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.status != WorkerStatus::Working {
                return Err(WorkerOpError::NotWorking(state.status));
            }
            state.status = WorkerStatus::Ready;
        }
        self.publish_status();
        Ok(())
    }

    /// Terminate the underlying process (if any) and retire.
    pub fn cancel(&self) {
        if let Some(process) = self.process() {
            process.cancel();
        }
        self.set_status(WorkerStatus::Retired);
    }

    /// Mark retired without killing the process; pending events keep
    /// draining. Absorbing.
    pub fn retire(&self) {
        self.set_status(WorkerStatus::Retired);
    }

    fn set_status(&self, new_status: WorkerStatus) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            if state.status == new_status || state.status == WorkerStatus::Retired {
                false
            } else {
                state.status = new_status;
                true
            }
        };
        if changed {
            self.publish_status();
        } else {
            debug!(worker_id = %self.id, status = %new_status, "status transition ignored");
        }
    }

    fn publish_status(&self) {
        let (status, phase) = {
            let state = self.state.lock().unwrap();
            (state.status, state.phase)
        };
        self.broker.publish(
            EventKind::Updated,
            WorkerEvent::StatusChange {
                worker_id: self.id.clone(),
                status,
                phase,
            },
        );
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::event::{ErrorInfo, ErrorReason, OutputEventKind, ToolContent};
    use crate::workers::testing::{FakeProcess, eventually};

    fn init_event(session: &str) -> OutputEvent {
        let mut event = OutputEvent::new(OutputEventKind::System);
        event.subkind = Some("init".to_string());
        event.session_ref = Some(session.to_string());
        event
    }

    fn assistant_event(text: &str) -> OutputEvent {
        let mut event = OutputEvent::new(OutputEventKind::Assistant);
        event.message = Some(crate::headless::event::MessageContent {
            role: "assistant".to_string(),
            model: String::new(),
            blocks: vec![crate::headless::event::ContentBlock::Text(text.to_string())],
        });
        event
    }

    fn tool_result_event(name: &str, output: &str) -> OutputEvent {
        let mut event = OutputEvent::new(OutputEventKind::ToolResult);
        event.tool = Some(ToolContent {
            id: "t".to_string(),
            name: name.to_string(),
            input: serde_json::Value::Null,
            output: Some(output.to_string()),
        });
        event
    }

    #[tokio::test]
    async fn test_event_loop_records_session_and_output() {
        let broker = Arc::new(Broker::new());
        let worker = Arc::new(Worker::new("w-1", broker.clone()));
        let (process, events_tx) = FakeProcess::new();
        worker.clone().attach(process.clone());

        events_tx.send(init_event("sess-9")).await.unwrap();
        events_tx.send(assistant_event("hello")).await.unwrap();
        events_tx.send(tool_result_event("bash", "ran ok")).await.unwrap();

        eventually(|| worker.output_lines().len() == 2).await;
        assert_eq!(worker.session_id().as_deref(), Some("sess-9"));
        assert_eq!(worker.output_lines(), vec!["hello", "[bash] ran ok"]);

        drop(events_tx);
        process.finish(ProcessStatus::Completed);
        eventually(|| worker.status() == WorkerStatus::Ready).await;
    }

    #[tokio::test]
    async fn test_error_event_records_last_error() {
        let broker = Arc::new(Broker::new());
        let worker = Arc::new(Worker::new("w-1", broker.clone()));
        let (process, events_tx) = FakeProcess::new();
        worker.clone().attach(process);

        let mut event = OutputEvent::new(OutputEventKind::Result);
        event.is_error_result = true;
        event.error = Some(ErrorInfo {
            message: "Prompt is too long".to_string(),
            code: "invalid_request_error".to_string(),
            reason: ErrorReason::ContextExceeded,
        });
        events_tx.send(event).await.unwrap();

        eventually(|| worker.last_error().is_some()).await;
        assert_eq!(worker.last_error().as_deref(), Some("Prompt is too long"));
    }

    #[tokio::test]
    async fn test_tool_result_truncated_at_limit() {
        let broker = Arc::new(Broker::new());
        let worker = Arc::new(Worker::new("w-1", broker.clone()));
        let (process, events_tx) = FakeProcess::new();
        worker.clone().attach(process);

        let long = "x".repeat(2 * TOOL_RESULT_MAX_CHARS);
        events_tx.send(tool_result_event("read", &long)).await.unwrap();

        eventually(|| !worker.output_lines().is_empty()).await;
        let line = worker.output_lines().pop().unwrap();
        assert_eq!(line.chars().count(), TOOL_RESULT_MAX_CHARS + 3);
        assert!(line.ends_with("..."));
    }

    #[tokio::test]
    async fn test_assign_requires_ready() {
        let broker = Arc::new(Broker::new());
        let worker = Worker::new("w-1", broker);
        // Fresh workers are processing their initial prompt.
        assert_eq!(worker.status(), WorkerStatus::Working);
        assert!(matches!(
            worker.assign_task("task-1"),
            Err(WorkerOpError::NotReady(WorkerStatus::Working))
        ));
    }

    #[tokio::test]
    async fn test_phase_transitions_keep_task_id() {
        let broker = Arc::new(Broker::new());
        let worker = Worker::new("w-1", broker);
        worker.complete_task().unwrap();
        worker.assign_task("task-1").unwrap();

        for phase in [
            WorkerPhase::Implementing,
            WorkerPhase::AwaitingReview,
            WorkerPhase::Reviewing,
            WorkerPhase::AddressingFeedback,
            WorkerPhase::Committing,
        ] {
            worker.set_phase(phase);
            assert_eq!(worker.task_id().as_deref(), Some("task-1"));
        }

        worker.complete_task().unwrap();
        assert_eq!(worker.status(), WorkerStatus::Ready);
        assert_eq!(worker.task_id().as_deref(), Some("task-1"));
    }

    #[tokio::test]
    async fn test_retire_is_absorbing() {
        let broker = Arc::new(Broker::new());
        let worker = Worker::new("w-1", broker);
        worker.retire();
        assert_eq!(worker.status(), WorkerStatus::Retired);
        worker.complete_task().unwrap_err();
        assert_eq!(worker.status(), WorkerStatus::Retired);
    }

    #[tokio::test]
    async fn test_retired_worker_still_drains_events() {
        let broker = Arc::new(Broker::new());
        let worker = Arc::new(Worker::new("w-1", broker.clone()));
        let (process, events_tx) = FakeProcess::new();
        worker.clone().attach(process.clone());

        worker.retire();
        events_tx.send(assistant_event("late result")).await.unwrap();

        eventually(|| !worker.output_lines().is_empty()).await;
        assert_eq!(worker.output_lines(), vec!["late result"]);

        drop(events_tx);
        process.finish(ProcessStatus::Completed);
        eventually(|| worker.status() == WorkerStatus::Retired).await;
    }

    #[tokio::test]
    async fn test_failed_process_retires_worker() {
        let broker = Arc::new(Broker::new());
        let worker = Arc::new(Worker::new("w-1", broker.clone()));
        let (process, events_tx) = FakeProcess::new();
        worker.clone().attach(process.clone());

        drop(events_tx);
        process.finish(ProcessStatus::Failed);
        eventually(|| worker.status() == WorkerStatus::Retired).await;
    }
}
