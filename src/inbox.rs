//! Inbox engine: a worker pool draining the inbound work queue.
//!
//! Each worker owns a private pipeline (deserialize, defer-check, dispatch
//! to handler) and applies the failure policy from its configuration:
//! bounded retry with a backoff ladder, then quarantine on the error queue.
//! Deferred redelivery is part of the same loop — whenever the work queue
//! runs empty a worker checks the deferred queue for a due message before
//! idle-sleeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::InboxConfig;
use crate::events::{EngineKind, EventPublisher};
use crate::handler::HandlerRegistry;
use crate::pipeline::{Disposition, Pipeline, PipelineContext, PipelineModule, Stage};
use crate::queue::Queue;
use crate::serializer::MessageSerializer;
use crate::stages::DeserializeEnvelope;
use crate::worker::{Worker, WorkerState};

pub(crate) struct InboxEngine {
    handles: Vec<JoinHandle<()>>,
    states: Vec<Arc<AtomicU8>>,
}

impl InboxEngine {
    /// Spawn the configured number of workers over the work queue.
    pub(crate) fn start(
        config: &InboxConfig,
        serializer: Arc<dyn MessageSerializer>,
        handlers: HandlerRegistry,
        modules: Vec<Arc<dyn PipelineModule>>,
        events: EventPublisher,
        cancel: CancellationToken,
    ) -> Self {
        tracing::info!(workers = config.worker_count, "starting inbox engine");

        let mut handles = Vec::with_capacity(config.worker_count);
        let mut states = Vec::with_capacity(config.worker_count);

        for index in 0..config.worker_count {
            let stages: Vec<Arc<dyn Stage>> = vec![
                Arc::new(DeserializeEnvelope::new(Arc::clone(&serializer))),
                Arc::new(DeferEnvelope {
                    deferred_queue: config.deferred_queue.clone(),
                }),
                Arc::new(DispatchToHandler {
                    handlers: handlers.clone(),
                }),
            ];

            let state = Arc::new(AtomicU8::new(WorkerState::Idle as u8));
            states.push(Arc::clone(&state));

            let worker = Worker {
                engine: EngineKind::Inbox,
                index,
                work_queue: Arc::clone(&config.work_queue),
                error_queue: Arc::clone(&config.error_queue),
                deferred_queue: config.deferred_queue.clone(),
                serializer: Arc::clone(&serializer),
                pipeline: Pipeline::new(stages, modules.clone()),
                idle_durations: config.durations_to_sleep_when_idle.clone(),
                ignore_durations: config.durations_to_ignore_on_failure.clone(),
                maximum_failure_count: config.maximum_failure_count,
                events: events.clone(),
                state,
            };

            handles.push(tokio::spawn(worker.run(cancel.clone())));
        }

        Self { handles, states }
    }

    /// Wait for every worker to reach [`WorkerState::Stopped`].
    ///
    /// The owning facade cancels the shared token first; workers finish
    /// their in-flight message before exiting.
    pub(crate) async fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        tracing::info!("inbox engine stopped");
    }

    pub(crate) fn worker_states(&self) -> Vec<WorkerState> {
        self.states
            .iter()
            .map(|s| WorkerState::from_u8(s.load(Ordering::SeqCst)))
            .collect()
    }
}

/// Relocate a not-yet-due message to the deferred queue.
///
/// A complete stage in its own right: when it moves a message it records
/// the `Deferred` disposition and aborts, so later stages never see a
/// message that is not due. Without a configured deferred queue every
/// message is treated as immediately due.
struct DeferEnvelope {
    deferred_queue: Option<Arc<dyn Queue>>,
}

#[async_trait::async_trait]
impl Stage for DeferEnvelope {
    fn name(&self) -> &'static str {
        "defer-envelope"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<(), tower::BoxError> {
        let Some(queue) = &self.deferred_queue else {
            return Ok(());
        };

        let Some(message) = ctx.message() else {
            return Ok(());
        };

        if message.is_due(Utc::now()) {
            return Ok(());
        }

        // Relocate the received bytes verbatim; the envelope is not touched.
        queue.enqueue(message.id, ctx.raw().to_vec()).await?;

        ctx.set_disposition(Disposition::Deferred);
        ctx.abort();
        Ok(())
    }
}

/// Invoke the handler registered for the message's declared type.
struct DispatchToHandler {
    handlers: HandlerRegistry,
}

#[async_trait::async_trait]
impl Stage for DispatchToHandler {
    fn name(&self) -> &'static str {
        "dispatch-to-handler"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<(), tower::BoxError> {
        let Some(message) = ctx.message() else {
            return Err("no envelope on the context".into());
        };

        let handler = self
            .handlers
            .resolve(&message.message_type)
            .ok_or_else(|| {
                format!(
                    "no handler registered for message type '{}'",
                    message.message_type
                )
            })?;

        handler.handle(message).await
    }
}
