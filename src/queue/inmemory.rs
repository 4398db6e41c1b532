use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::queue::{AckToken, Queue, QueueCatalog, QueueError, QueueName, ReceivedMessage};

/// In-memory queue for testing or single-process usage.
///
/// Messages live in a FIFO buffer; a receive moves the message into an
/// in-flight ledger keyed by acknowledgement token, and the acknowledge
/// drops it from the ledger. The ledger is what gives the backend its
/// receive-hides / ack-finalizes semantics without a broker.
///
/// Cloning shares the underlying buffers, so a clone observes the same
/// queue.
#[derive(Clone)]
pub struct InMemoryQueue {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    ready: VecDeque<(Uuid, Vec<u8>)>,
    in_flight: HashMap<AckToken, (Uuid, Vec<u8>)>,
}

impl InMemoryQueue {
    /// Create a new empty queue.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Number of receivable messages. Primarily for assertions in tests.
    pub async fn len(&self) -> usize {
        self.state.lock().await.ready.len()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(&self, id: Uuid, payload: Vec<u8>) -> Result<(), QueueError> {
        self.state.lock().await.ready.push_back((id, payload));
        Ok(())
    }

    async fn receive_one(&self) -> Result<Option<ReceivedMessage>, QueueError> {
        let mut state = self.state.lock().await;

        let Some((id, payload)) = state.ready.pop_front() else {
            return Ok(None);
        };

        let token = AckToken::next();
        state.in_flight.insert(token, (id, payload.clone()));

        Ok(Some(ReceivedMessage { id, payload, token }))
    }

    async fn acknowledge(&self, token: AckToken) -> Result<(), QueueError> {
        self.state
            .lock()
            .await
            .in_flight
            .remove(&token)
            .map(|_| ())
            .ok_or_else(|| QueueError::unknown_token(token))
    }

    async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.state.lock().await.ready.is_empty())
    }

    async fn purge(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.ready.clear();
        state.in_flight.clear();
        Ok(())
    }
}

/// Named registry of in-memory queues.
///
/// Stands in for a broker's queue administration: tests and single-process
/// setups create queues here and the engines resolve destinations through
/// the [`QueueCatalog`] implementation.
#[derive(Clone, Default)]
pub struct InMemoryCatalog {
    queues: Arc<std::sync::Mutex<HashMap<QueueName, Arc<InMemoryQueue>>>>,
}

impl InMemoryCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue under the given name, or return the existing one.
    pub fn create(&self, name: QueueName) -> Arc<InMemoryQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(queues.entry(name).or_insert_with(|| Arc::new(InMemoryQueue::new())))
    }

    /// Look up a queue without creating it.
    pub fn queue(&self, name: &QueueName) -> Option<Arc<InMemoryQueue>> {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.get(name).cloned()
    }

    /// Drop a queue and everything on it. Setup and test use only.
    pub fn drop_queue(&self, name: &QueueName) {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.remove(name);
    }
}

impl QueueCatalog for InMemoryCatalog {
    fn get(&self, name: &QueueName) -> Option<Arc<dyn Queue>> {
        self.queue(name).map(|q| q as Arc<dyn Queue>)
    }
}
