//! Heartbeat/progress watchdog over registered workflows.
//!
//! A single background loop converts silence into health events on the
//! cross-workflow bus. It never panics and never remediates directly;
//! that is the recovery executor's job.

pub mod recovery;

pub use recovery::RecoveryExecutor;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{Broker, EventKind};
use crate::control::events::ControlEvent;

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// Silence on the event bus longer than this marks a workflow
    /// unresponsive.
    pub heartbeat_timeout: Duration,
    /// No visible progress (assistant output) for this long while the
    /// process runs marks a workflow stalled.
    pub progress_timeout: Duration,
    /// Recoveries within `recovery_backoff` before the monitor gives up.
    pub max_recoveries: u32,
    pub recovery_backoff: Duration,
    pub enable_auto_nudge: bool,
    pub max_nudges: u32,
    pub enable_auto_replace: bool,
    pub enable_auto_pause: bool,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            progress_timeout: Duration::from_secs(120),
            max_recoveries: 3,
            recovery_backoff: Duration::from_secs(300),
            enable_auto_nudge: true,
            max_nudges: 2,
            enable_auto_replace: true,
            enable_auto_pause: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum HealthEventKind {
    Unresponsive,
    Stalled,
    ContextExhausted,
    GivingUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Nudge,
    Replace { fresh_session: bool },
    Pause,
}

#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub workflow_key: String,
    pub worker_id: Option<String>,
    pub kind: HealthEventKind,
    pub detail: String,
    /// The remediation the monitor selected, if any remains enabled.
    pub action: Option<RecoveryAction>,
}

struct WorkflowHealth {
    last_heartbeat: Instant,
    last_progress: Instant,
    nudge_count: u32,
    recoveries: VecDeque<Instant>,
    running: bool,
    gave_up: bool,
}

impl WorkflowHealth {
    fn fresh() -> Self {
        let now = Instant::now();
        Self {
            last_heartbeat: now,
            last_progress: now,
            nudge_count: 0,
            recoveries: VecDeque::new(),
            running: true,
            gave_up: false,
        }
    }
}

pub struct HealthMonitor {
    policy: HealthPolicy,
    state: Mutex<HashMap<String, WorkflowHealth>>,
    bus: Arc<Broker<ControlEvent>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn start(
        policy: HealthPolicy,
        bus: Arc<Broker<ControlEvent>>,
        tick: Duration,
    ) -> Arc<Self> {
        let monitor = Arc::new(Self {
            policy,
            state: Mutex::new(HashMap::new()),
            bus,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        });
        let task = {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = monitor.cancel.cancelled() => break,
                        _ = interval.tick() => monitor.sweep(),
                    }
                }
            })
        };
        *monitor.task.lock().unwrap() = Some(task);
        monitor
    }

    pub fn register(&self, key: &str) {
        self.state
            .lock()
            .unwrap()
            .insert(key.to_string(), WorkflowHealth::fresh());
    }

    pub fn unregister(&self, key: &str) {
        self.state.lock().unwrap().remove(key);
    }

    pub fn record_heartbeat(&self, key: &str) {
        if let Some(entry) = self.state.lock().unwrap().get_mut(key) {
            entry.last_heartbeat = Instant::now();
            entry.running = true;
        }
    }

    /// Progress implies a heartbeat.
    pub fn record_progress(&self, key: &str) {
        if let Some(entry) = self.state.lock().unwrap().get_mut(key) {
            let now = Instant::now();
            entry.last_heartbeat = now;
            entry.last_progress = now;
            entry.running = true;
        }
    }

    pub fn set_running(&self, key: &str, running: bool) {
        if let Some(entry) = self.state.lock().unwrap().get_mut(key) {
            entry.running = running;
        }
    }

    /// Context exhaustion skips the nudge rung: the executor replaces the
    /// worker with a fresh session instead.
    pub fn record_context_exhausted(&self, key: &str, worker_id: Option<String>) {
        let event = {
            let mut state = self.state.lock().unwrap();
            let Some(entry) = state.get_mut(key) else {
                return;
            };
            if entry.gave_up {
                return;
            }
            if self.recovery_budget_spent(entry) {
                entry.gave_up = true;
                Self::giving_up_event(key, HealthEventKind::ContextExhausted)
            } else {
                let action = if self.policy.enable_auto_replace {
                    entry.recoveries.push_back(Instant::now());
                    Some(RecoveryAction::Replace { fresh_session: true })
                } else if self.policy.enable_auto_pause {
                    entry.recoveries.push_back(Instant::now());
                    Some(RecoveryAction::Pause)
                } else {
                    None
                };
                HealthEvent {
                    workflow_key: key.to_string(),
                    worker_id,
                    kind: HealthEventKind::ContextExhausted,
                    detail: "context window exhausted".to_string(),
                    action,
                }
            }
        };
        self.publish(event);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for (key, entry) in state.iter_mut() {
                if entry.gave_up {
                    continue;
                }
                let kind = if now.duration_since(entry.last_heartbeat)
                    > self.policy.heartbeat_timeout
                {
                    Some(HealthEventKind::Unresponsive)
                } else if entry.running
                    && now.duration_since(entry.last_progress) > self.policy.progress_timeout
                {
                    Some(HealthEventKind::Stalled)
                } else {
                    None
                };
                if let Some(kind) = kind {
                    events.push(self.escalate(key, entry, kind, now));
                }
            }
        }
        for event in events {
            self.publish(event);
        }
    }

    fn escalate(
        &self,
        key: &str,
        entry: &mut WorkflowHealth,
        kind: HealthEventKind,
        now: Instant,
    ) -> HealthEvent {
        // A remediation buys the workflow a fresh observation window.
        entry.last_heartbeat = now;
        entry.last_progress = now;

        if self.recovery_budget_spent(entry) {
            entry.gave_up = true;
            return Self::giving_up_event(key, kind);
        }

        let action = if self.policy.enable_auto_nudge && entry.nudge_count < self.policy.max_nudges
        {
            entry.nudge_count += 1;
            Some(RecoveryAction::Nudge)
        } else if self.policy.enable_auto_replace {
            Some(RecoveryAction::Replace { fresh_session: false })
        } else if self.policy.enable_auto_pause {
            Some(RecoveryAction::Pause)
        } else {
            None
        };
        if action.is_some() {
            entry.recoveries.push_back(now);
        }

        HealthEvent {
            workflow_key: key.to_string(),
            worker_id: None,
            kind,
            detail: format!("no {} within the configured window", match kind {
                HealthEventKind::Unresponsive => "heartbeat",
                _ => "progress",
            }),
            action,
        }
    }

    fn recovery_budget_spent(&self, entry: &mut WorkflowHealth) -> bool {
        let now = Instant::now();
        while let Some(front) = entry.recoveries.front() {
            if now.duration_since(*front) >= self.policy.recovery_backoff {
                entry.recoveries.pop_front();
            } else {
                break;
            }
        }
        entry.recoveries.len() >= self.policy.max_recoveries as usize
    }

    fn giving_up_event(key: &str, after: HealthEventKind) -> HealthEvent {
        warn!(workflow = key, %after, "recovery budget exhausted, giving up");
        HealthEvent {
            workflow_key: key.to_string(),
            worker_id: None,
            kind: HealthEventKind::GivingUp,
            detail: format!("recovery budget exhausted after {after}"),
            action: None,
        }
    }

    fn publish(&self, event: HealthEvent) {
        info!(
            workflow = %event.workflow_key,
            kind = %event.kind,
            action = ?event.action,
            "health event"
        );
        self.bus
            .publish(EventKind::Custom("health".to_string()), ControlEvent::Health(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    fn fast_policy() -> HealthPolicy {
        HealthPolicy {
            heartbeat_timeout: Duration::from_millis(50),
            progress_timeout: Duration::from_millis(80),
            max_recoveries: 2,
            recovery_backoff: Duration::from_secs(60),
            ..HealthPolicy::default()
        }
    }

    async fn next_health(
        rx: &mut tokio::sync::mpsc::Receiver<crate::broker::Event<ControlEvent>>,
    ) -> HealthEvent {
        loop {
            let event = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for health event")
                .expect("bus closed");
            if let ControlEvent::Health(health) = event.payload {
                return health;
            }
        }
    }

    #[tokio::test]
    async fn test_silence_escalates_nudge_then_replace() {
        let bus = Arc::new(Broker::new());
        let mut events = bus.subscribe(CancellationToken::new());
        let monitor = HealthMonitor::start(fast_policy(), bus.clone(), Duration::from_millis(10));
        monitor.register("wf-1");

        let first = next_health(&mut events).await;
        assert_eq!(first.kind, HealthEventKind::Unresponsive);
        assert_eq!(first.action, Some(RecoveryAction::Nudge));

        let second = next_health(&mut events).await;
        assert_eq!(second.action, Some(RecoveryAction::Nudge));

        // Nudge budget (2) spent; the ladder moves to replace, but the
        // recovery budget (2) is also spent, so the monitor gives up.
        let third = next_health(&mut events).await;
        assert_eq!(third.kind, HealthEventKind::GivingUp);
        assert!(third.action.is_none());

        monitor.stop();
    }

    #[tokio::test]
    async fn test_heartbeats_keep_workflow_quiet() {
        let bus = Arc::new(Broker::new());
        let mut events = bus.subscribe(CancellationToken::new());
        let monitor = HealthMonitor::start(fast_policy(), bus.clone(), Duration::from_millis(10));
        monitor.register("wf-1");

        for _ in 0..8 {
            monitor.record_progress("wf-1");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(
            timeout(Duration::from_millis(10), events.recv()).await.is_err(),
            "no health event expected while progress flows"
        );
        monitor.stop();
    }

    #[tokio::test]
    async fn test_context_exhaustion_prefers_fresh_replace() {
        let bus = Arc::new(Broker::new());
        let mut events = bus.subscribe(CancellationToken::new());
        let monitor = HealthMonitor::start(
            HealthPolicy::default(),
            bus.clone(),
            Duration::from_secs(60),
        );
        monitor.register("wf-1");

        monitor.record_context_exhausted("wf-1", Some("worker-1".to_string()));

        let event = next_health(&mut events).await;
        assert_eq!(event.kind, HealthEventKind::ContextExhausted);
        assert_eq!(event.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(
            event.action,
            Some(RecoveryAction::Replace { fresh_session: true })
        );
        monitor.stop();
    }

    #[tokio::test]
    async fn test_replace_rung_when_nudges_disabled() {
        let bus = Arc::new(Broker::new());
        let mut events = bus.subscribe(CancellationToken::new());
        let policy = HealthPolicy {
            enable_auto_nudge: false,
            ..fast_policy()
        };
        let monitor = HealthMonitor::start(policy, bus.clone(), Duration::from_millis(10));
        monitor.register("wf-1");

        let event = next_health(&mut events).await;
        assert_eq!(
            event.action,
            Some(RecoveryAction::Replace { fresh_session: false })
        );
        monitor.stop();
    }

    #[tokio::test]
    async fn test_pause_rung_when_replace_disabled() {
        let bus = Arc::new(Broker::new());
        let mut events = bus.subscribe(CancellationToken::new());
        let policy = HealthPolicy {
            enable_auto_nudge: false,
            enable_auto_replace: false,
            ..fast_policy()
        };
        let monitor = HealthMonitor::start(policy, bus.clone(), Duration::from_millis(10));
        monitor.register("wf-1");

        let event = next_health(&mut events).await;
        assert_eq!(event.action, Some(RecoveryAction::Pause));
        monitor.stop();
    }

    #[tokio::test]
    async fn test_unregistered_workflow_is_ignored() {
        let bus = Arc::new(Broker::new());
        let mut events = bus.subscribe(CancellationToken::new());
        let monitor = HealthMonitor::start(fast_policy(), bus.clone(), Duration::from_millis(10));

        monitor.record_context_exhausted("ghost", None);
        assert!(timeout(Duration::from_millis(100), events.recv()).await.is_err());
        monitor.stop();
    }
}
