//! The poll-process-ack loop shared by both engines.
//!
//! A worker owns one pipeline instance and one cycle: receive a message
//! from the work queue, drive it through the pipeline, decide its
//! disposition, acknowledge. Workers share nothing with each other beyond
//! the queues themselves; a stop request is honored between cycles, never
//! in the middle of one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::TransportMessage;
use crate::events::{BusEvent, EngineKind, EventPublisher};
use crate::pipeline::{Disposition, Pipeline, PipelineContext};
use crate::queue::{AckToken, Queue, ReceivedMessage};
use crate::serializer::MessageSerializer;

/// Observable lifecycle of one worker.
///
/// Owned exclusively by the worker task; the engine and tests only read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Polling or sleeping between polls.
    Idle = 0,
    /// Driving a message through the pipeline.
    Processing = 1,
    /// Stop observed, finishing up.
    Stopping = 2,
    /// The worker task has exited.
    Stopped = 3,
}

impl WorkerState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Processing,
            2 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

pub(crate) struct Worker {
    pub(crate) engine: EngineKind,
    pub(crate) index: usize,
    pub(crate) work_queue: Arc<dyn Queue>,
    pub(crate) error_queue: Arc<dyn Queue>,
    pub(crate) deferred_queue: Option<Arc<dyn Queue>>,
    pub(crate) serializer: Arc<dyn MessageSerializer>,
    pub(crate) pipeline: Pipeline,
    pub(crate) idle_durations: Vec<Duration>,
    pub(crate) ignore_durations: Vec<Duration>,
    pub(crate) maximum_failure_count: u32,
    pub(crate) events: EventPublisher,
    pub(crate) state: Arc<AtomicU8>,
}

impl Worker {
    /// Run the poll-process-ack cycle until cancelled.
    ///
    /// Per-message errors are contained by the failure policy and queue
    /// port errors are absorbed with the normal idle delay; nothing that
    /// happens to one message terminates the worker.
    #[tracing::instrument(skip(self, cancel), fields(engine = %self.engine, worker = self.index))]
    pub(crate) async fn run(self, cancel: CancellationToken) {
        tracing::debug!("worker started");

        let mut idle_index = 0usize;

        loop {
            if cancel.is_cancelled() {
                self.set_state(WorkerState::Stopping);
                break;
            }

            match self.work_queue.receive_one().await {
                Ok(Some(received)) => {
                    idle_index = 0;
                    self.set_state(WorkerState::Processing);
                    self.process(received).await;
                    self.set_state(WorkerState::Idle);
                }
                Ok(None) => {
                    if self.return_due_deferred().await {
                        // A deferred message came back; poll again at once.
                        continue;
                    }

                    self.set_state(WorkerState::Idle);
                    self.events.publish(BusEvent::ThreadWaiting {
                        engine: self.engine,
                        worker: self.index,
                    });
                    self.pipeline.idle(self.engine).await;

                    idle_index = self.idle_sleep(idle_index, &cancel).await;
                }
                Err(error) => {
                    tracing::warn!(%error, "work queue receive failed");
                    idle_index = self.idle_sleep(idle_index, &cancel).await;
                }
            }
        }

        self.set_state(WorkerState::Stopped);
        tracing::debug!("worker stopped");
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Sleep the current rung of the idle ladder, advancing for next time.
    async fn idle_sleep(&self, idle_index: usize, cancel: &CancellationToken) -> usize {
        let clamped = idle_index.min(self.idle_durations.len() - 1);

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.idle_durations[clamped]) => {}
        }

        (clamped + 1).min(self.idle_durations.len() - 1)
    }

    /// Drive one received message through the pipeline and settle it.
    ///
    /// The receive is always acknowledged once the disposition is decided;
    /// it is never left dangling for the transport to redeliver.
    async fn process(&self, received: ReceivedMessage) {
        let ReceivedMessage { id, payload, token } = received;

        let mut ctx = PipelineContext::new(payload);

        match self.pipeline.execute(&mut ctx).await {
            Ok(()) => {
                match ctx.disposition() {
                    Disposition::Deferred => {
                        if let Some(message) = ctx.message() {
                            if let Some(until) = message.defer_until {
                                self.events.publish(BusEvent::MessageDeferred {
                                    id: message.id,
                                    until,
                                });
                            }
                        }
                    }
                    Disposition::Completed if ctx.is_aborted() => {
                        tracing::debug!(message_id = %id, "pipeline aborted");
                    }
                    Disposition::Completed => {
                        self.events.publish(BusEvent::MessageProcessed {
                            engine: self.engine,
                            id: ctx.message().map_or(id, |m| m.id),
                        });
                    }
                }
                self.acknowledge(token).await;
            }
            Err(error) => {
                self.settle_failure(id, &mut ctx, error.to_string()).await;
                self.acknowledge(token).await;
            }
        }
    }

    /// Apply the failure policy: bounded retry with backoff, then poison.
    async fn settle_failure(&self, received_id: Uuid, ctx: &mut PipelineContext, error: String) {
        let Some(mut message) = ctx.take_message() else {
            // The envelope never decoded; it cannot carry a failure count,
            // so it is quarantined verbatim.
            tracing::warn!(message_id = %received_id, %error, "undecodable message quarantined");
            self.move_to_error_queue(received_id, ctx.raw().to_vec(), 0).await;
            return;
        };

        message.register_failure(&error);

        if message.failure_count >= self.maximum_failure_count {
            tracing::warn!(
                message_id = %message.id,
                failure_count = message.failure_count,
                %error,
                "retry budget exhausted, message poisoned"
            );

            let failure_count = message.failure_count;
            let payload = self.serialize_or_raw(&message, ctx);
            self.move_to_error_queue(message.id, payload, failure_count).await;
            return;
        }

        if let Some(ignore) = self.ignore_duration(message.failure_count) {
            message.defer_until = Some(Utc::now() + ignore);
        }

        tracing::debug!(
            message_id = %message.id,
            failure_count = message.failure_count,
            %error,
            "message requeued for retry"
        );

        let id = message.id;
        let payload = self.serialize_or_raw(&message, ctx);
        if let Err(error) = self.work_queue.enqueue(id, payload).await {
            tracing::error!(message_id = %id, %error, "requeue failed, quarantining");
            self.move_to_error_queue(id, ctx.raw().to_vec(), message.failure_count)
                .await;
        }
    }

    /// Backoff selected by failure count, clamped to the last entry.
    fn ignore_duration(&self, failure_count: u32) -> Option<chrono::Duration> {
        if self.ignore_durations.is_empty() {
            return None;
        }

        let index = (failure_count.saturating_sub(1) as usize).min(self.ignore_durations.len() - 1);
        chrono::Duration::from_std(self.ignore_durations[index]).ok()
    }

    fn serialize_or_raw(&self, message: &TransportMessage, ctx: &PipelineContext) -> Vec<u8> {
        match self.serializer.serialize(message) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::error!(message_id = %message.id, %error, "re-serialization failed");
                ctx.raw().to_vec()
            }
        }
    }

    async fn move_to_error_queue(&self, id: Uuid, payload: Vec<u8>, failure_count: u32) {
        match self.error_queue.enqueue(id, payload).await {
            Ok(()) => self.events.publish(BusEvent::MessagePoisoned {
                engine: self.engine,
                id,
                failure_count,
            }),
            Err(error) => {
                // The receive stays acknowledged either way; losing the error
                // queue is a transport outage, logged loudly.
                tracing::error!(message_id = %id, %error, "error queue enqueue failed");
            }
        }
    }

    /// Poll the deferred queue for a due message and move it back.
    ///
    /// Returns `true` when a message was returned to the work queue, in
    /// which case the idle sleep is skipped for this cycle. A message that
    /// is not yet due goes straight back onto the deferred queue; without a
    /// blocking peek primitive this receive-inspect-requeue round trip is
    /// what keeps it from being lost.
    async fn return_due_deferred(&self) -> bool {
        let Some(deferred) = &self.deferred_queue else {
            return false;
        };

        let received = match deferred.receive_one().await {
            Ok(Some(received)) => received,
            Ok(None) => return false,
            Err(error) => {
                tracing::warn!(%error, "deferred queue receive failed");
                return false;
            }
        };

        match self.serializer.deserialize(&received.payload) {
            Ok(message) if message.is_due(Utc::now()) => {
                match self
                    .work_queue
                    .enqueue(received.id, received.payload)
                    .await
                {
                    Ok(()) => {
                        self.ack_deferred(received.token).await;
                        tracing::debug!(message_id = %message.id, "deferred message returned");
                        self.events
                            .publish(BusEvent::MessageReturned { id: message.id });
                        true
                    }
                    Err(error) => {
                        tracing::warn!(message_id = %message.id, %error, "deferred return failed");
                        false
                    }
                }
            }
            Ok(message) => {
                // Not yet due: put it back unchanged.
                if let Err(error) = deferred.enqueue(received.id, received.payload).await {
                    tracing::warn!(message_id = %message.id, %error, "deferred requeue failed");
                    return false;
                }
                self.ack_deferred(received.token).await;
                false
            }
            Err(error) => {
                tracing::warn!(message_id = %received.id, %error, "undecodable deferred message");
                self.move_to_error_queue(received.id, received.payload, 0).await;
                self.ack_deferred(received.token).await;
                false
            }
        }
    }

    async fn ack_deferred(&self, token: AckToken) {
        if let Some(queue) = &self.deferred_queue {
            if let Err(error) = queue.acknowledge(token).await {
                tracing::warn!(%error, "deferred acknowledge failed");
            }
        }
    }

    async fn acknowledge(&self, token: AckToken) {
        if let Err(error) = self.work_queue.acknowledge(token).await {
            tracing::warn!(%error, "acknowledge failed");
        }
    }
}
