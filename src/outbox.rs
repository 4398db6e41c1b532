//! Outbox engine: a worker pool dispatching outbound messages.
//!
//! The loop mirrors the inbox exactly; only the stages differ. Instead of
//! invoking a handler, an outbound message has its recipients resolved
//! (explicit recipients win, otherwise the routing collaborator decides)
//! and one copy enqueued on each destination through the dispatch layer.
//! The same bounded-retry/poison policy applies, so a picked-up message is
//! eventually either fully dispatched or quarantined on the error queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::OutboxConfig;
use crate::dispatch::{CatalogSender, Dispatch, SenderService};
use crate::events::{EngineKind, EventPublisher};
use crate::pipeline::{Pipeline, PipelineContext, PipelineModule, Stage};
use crate::queue::{QueueCatalog, QueueName};
use crate::serializer::MessageSerializer;
use crate::stages::DeserializeEnvelope;
use crate::worker::{Worker, WorkerState};

/// Routing collaborator resolving logical message names to destinations.
///
/// Consulted only for messages that carry no explicit recipients.
#[async_trait::async_trait]
pub trait MessageRouter: Send + Sync {
    /// Destinations for a message type, in dispatch order.
    async fn resolve_destinations(
        &self,
        message_type: &str,
    ) -> Result<Vec<QueueName>, tower::BoxError>;
}

/// Fixed route table.
///
/// The simplest [`MessageRouter`]: routes are declared up front and never
/// change. Unknown message types resolve to no destinations.
#[derive(Clone, Default)]
pub struct StaticRouter {
    routes: HashMap<String, Vec<QueueName>>,
}

impl StaticRouter {
    /// Create an empty route table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a destination for a message type.
    pub fn route(mut self, message_type: impl Into<String>, destination: QueueName) -> Self {
        self.routes
            .entry(message_type.into())
            .or_default()
            .push(destination);
        self
    }
}

#[async_trait::async_trait]
impl MessageRouter for StaticRouter {
    async fn resolve_destinations(
        &self,
        message_type: &str,
    ) -> Result<Vec<QueueName>, tower::BoxError> {
        Ok(self.routes.get(message_type).cloned().unwrap_or_default())
    }
}

pub(crate) struct OutboxEngine {
    handles: Vec<JoinHandle<()>>,
    states: Vec<Arc<AtomicU8>>,
}

impl OutboxEngine {
    /// Spawn the configured number of workers over the outbound work queue.
    pub(crate) fn start(
        config: &OutboxConfig,
        serializer: Arc<dyn MessageSerializer>,
        catalog: Arc<dyn QueueCatalog>,
        router: Arc<dyn MessageRouter>,
        modules: Vec<Arc<dyn PipelineModule>>,
        events: EventPublisher,
        cancel: CancellationToken,
    ) -> Self {
        tracing::info!(workers = config.worker_count, "starting outbox engine");

        let mut handles = Vec::with_capacity(config.worker_count);
        let mut states = Vec::with_capacity(config.worker_count);

        for index in 0..config.worker_count {
            let dispatch = Dispatch::new(CatalogSender::new(
                Arc::clone(&catalog),
                Arc::clone(&serializer),
                events.clone(),
            ));

            let stages: Vec<Arc<dyn Stage>> = vec![
                Arc::new(DeserializeEnvelope::new(Arc::clone(&serializer))),
                Arc::new(ResolveRecipients {
                    router: Arc::clone(&router),
                }),
                Arc::new(DispatchEnvelope { dispatch }),
            ];

            let state = Arc::new(AtomicU8::new(WorkerState::Idle as u8));
            states.push(Arc::clone(&state));

            let worker = Worker {
                engine: EngineKind::Outbox,
                index,
                work_queue: Arc::clone(&config.work_queue),
                error_queue: Arc::clone(&config.error_queue),
                deferred_queue: None,
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
    pub(crate) async fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        tracing::info!("outbox engine stopped");
    }

    pub(crate) fn worker_states(&self) -> Vec<WorkerState> {
        self.states
            .iter()
            .map(|s| WorkerState::from_u8(s.load(Ordering::SeqCst)))
            .collect()
    }
}

/// Fill in recipients for messages that do not name their own.
///
/// Explicit recipients skip routing entirely. A message that resolves to no
/// destination at all is a processing failure; the retry policy will
/// eventually quarantine it where it can be inspected.
struct ResolveRecipients {
    router: Arc<dyn MessageRouter>,
}

#[async_trait::async_trait]
impl Stage for ResolveRecipients {
    fn name(&self) -> &'static str {
        "resolve-recipients"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<(), tower::BoxError> {
        let Some(message) = ctx.message() else {
            return Err("no envelope on the context".into());
        };

        if !message.recipients.is_empty() {
            return Ok(());
        }

        let resolved = self
            .router
            .resolve_destinations(&message.message_type)
            .await?;

        if resolved.is_empty() {
            return Err(format!(
                "no route for message type '{}'",
                message.message_type
            )
            .into());
        }

        if let Some(message) = ctx.message_mut() {
            message.recipients = resolved;
        }

        Ok(())
    }
}

/// Enqueue one copy of the envelope on each recipient queue.
struct DispatchEnvelope {
    dispatch: Dispatch<SenderService<CatalogSender>>,
}

#[async_trait::async_trait]
impl Stage for DispatchEnvelope {
    fn name(&self) -> &'static str {
        "dispatch-envelope"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<(), tower::BoxError> {
        let Some(message) = ctx.message() else {
            return Err("no envelope on the context".into());
        };

        self.dispatch.send(message.clone()).await?;
        Ok(())
    }
}
