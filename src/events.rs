use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::queue::QueueName;

/// Which engine raised a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Inbox,
    Outbox,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Inbox => f.write_str("inbox"),
            EngineKind::Outbox => f.write_str("outbox"),
        }
    }
}

/// Lifecycle notifications published by the engines.
///
/// Events flow one way, engine to subscriber, over a broadcast channel;
/// the core never depends on anyone listening. Monitoring and tests
/// subscribe through [`Bus::events`](crate::Bus::events).
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A worker found its work queue empty and is about to idle-sleep.
    ThreadWaiting { engine: EngineKind, worker: usize },
    /// A message completed its pipeline and was acknowledged.
    MessageProcessed { engine: EngineKind, id: Uuid },
    /// A message was relocated to the deferred queue.
    MessageDeferred { id: Uuid, until: DateTime<Utc> },
    /// A due deferred message was returned to the work queue.
    MessageReturned { id: Uuid },
    /// A message exhausted its retry budget and was quarantined.
    MessagePoisoned {
        engine: EngineKind,
        id: Uuid,
        failure_count: u32,
    },
    /// The outbox enqueued a copy of a message on a destination queue.
    MessageDispatched { id: Uuid, recipient: QueueName },
}

/// Publisher side of the lifecycle channel.
///
/// Sending never blocks; lagging or absent subscribers are ignored.
#[derive(Clone)]
pub(crate) struct EventPublisher {
    sender: broadcast::Sender<BusEvent>,
}

impl EventPublisher {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub(crate) fn publish(&self, event: BusEvent) {
        // A send with no subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let publisher = EventPublisher::new(8);
        publisher.publish(BusEvent::MessageReturned { id: Uuid::new_v4() });
    }

    #[tokio::test]
    async fn subscribers_observe_events() {
        let publisher = EventPublisher::new(8);
        let mut receiver = publisher.subscribe();

        publisher.publish(BusEvent::ThreadWaiting {
            engine: EngineKind::Inbox,
            worker: 0,
        });

        match receiver.recv().await.unwrap() {
            BusEvent::ThreadWaiting { engine, worker } => {
                assert_eq!(engine, EngineKind::Inbox);
                assert_eq!(worker, 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
