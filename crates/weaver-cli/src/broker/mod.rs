//! Typed in-process pub/sub used by the worker pool, the control plane and
//! the database watcher.
//!
//! Fan-out never blocks the publisher: a subscriber whose channel is full
//! loses that delivery (logged at debug). Within a single subscriber,
//! delivery order always matches publish order.

mod continuous;

pub use continuous::ContinuousListener;

use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default per-subscriber channel capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// What happened to the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Custom(String),
}

/// Envelope delivered to every live subscriber.
#[derive(Debug, Clone)]
pub struct Event<T> {
    pub kind: EventKind,
    pub payload: T,
}

struct Subscriber<T> {
    tx: mpsc::Sender<Event<T>>,
    token: CancellationToken,
}

struct Inner<T> {
    subscribers: Vec<Subscriber<T>>,
    closed: bool,
}

pub struct Broker<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

impl<T: Clone> Broker<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                closed: false,
            }),
            capacity,
        }
    }

    /// Register a subscriber. The subscription lives until `token` is
    /// cancelled or the broker is closed; after either, the receiver drains
    /// whatever was already buffered and then yields `None`.
    pub fn subscribe(&self, token: CancellationToken) -> mpsc::Receiver<Event<T>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut inner = self.inner.lock().unwrap();
        if !inner.closed {
            inner.subscribers.push(Subscriber { tx, token });
        }
        rx
    }

    /// Deliver `payload` to every live subscriber. Subscribers with a full
    /// channel miss this delivery; the publisher never blocks. Publishing
    /// to a closed broker is a no-op.
    pub fn publish(&self, kind: EventKind, payload: T) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.subscribers.retain(|sub| {
            if sub.token.is_cancelled() || sub.tx.is_closed() {
                return false;
            }
            match sub.tx.try_send(Event {
                kind: kind.clone(),
                payload: payload.clone(),
            }) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("broker subscriber full, dropping delivery");
                    true
                },
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Close the broker. All subscriber channels are released; subsequent
    /// publishes are dropped. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|sub| !sub.token.is_cancelled() && !sub.tx.is_closed());
        inner.subscribers.len()
    }
}

impl<T: Clone> Default for Broker<T> {
    fn default() -> Self {
        Self::new()
    }
}
