//! One-event-per-call wrapper over a broker subscription.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Broker, Event};

/// Wraps a subscription so an outer update loop can pull exactly one event
/// per tick. The underlying subscription keeps buffering between calls, so
/// nothing published in the gaps is lost (up to the channel capacity).
pub struct ContinuousListener<T> {
    rx: mpsc::Receiver<Event<T>>,
    token: CancellationToken,
}

impl<T: Clone> ContinuousListener<T> {
    pub fn new(broker: &Broker<T>, token: CancellationToken) -> Self {
        let rx = broker.subscribe(token.clone());
        Self { rx, token }
    }

    /// Yield the next event only. Returns `None` once the broker closes or
    /// the listener's token is cancelled.
    pub async fn listen(&mut self) -> Option<Event<T>> {
        tokio::select! {
            _ = self.token.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    /// Non-blocking variant for callers polled from a render loop.
    pub fn try_listen(&mut self) -> Option<Event<T>> {
        if self.token.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EventKind;

    #[tokio::test]
    async fn test_listen_yields_one_event_per_call() {
        let broker = Broker::new();
        let mut listener = ContinuousListener::new(&broker, CancellationToken::new());

        broker.publish(EventKind::Created, 1);
        broker.publish(EventKind::Created, 2);
        broker.publish(EventKind::Created, 3);

        assert_eq!(listener.listen().await.unwrap().payload, 1);
        assert_eq!(listener.listen().await.unwrap().payload, 2);
        assert_eq!(listener.listen().await.unwrap().payload, 3);
    }

    #[tokio::test]
    async fn test_events_buffer_between_calls() {
        let broker = Broker::new();
        let mut listener = ContinuousListener::new(&broker, CancellationToken::new());

        broker.publish(EventKind::Created, "a");
        assert_eq!(listener.listen().await.unwrap().payload, "a");

        // Published while nobody is listening; must not be lost.
        broker.publish(EventKind::Created, "b");
        broker.publish(EventKind::Created, "c");

        assert_eq!(listener.listen().await.unwrap().payload, "b");
        assert_eq!(listener.listen().await.unwrap().payload, "c");
    }

    #[tokio::test]
    async fn test_cancelled_listener_returns_none() {
        let broker: Broker<u32> = Broker::new();
        let token = CancellationToken::new();
        let mut listener = ContinuousListener::new(&broker, token.clone());

        token.cancel();
        assert!(listener.listen().await.is_none());
    }

    #[tokio::test]
    async fn test_listener_ends_when_broker_closes() {
        let broker: Broker<u32> = Broker::new();
        let mut listener = ContinuousListener::new(&broker, CancellationToken::new());

        broker.close();
        assert!(listener.listen().await.is_none());
    }
}
