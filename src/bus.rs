//! Bus facade: lifecycle coordination and application-facing entry points.
//!
//! The [`Bus`] owns the engines one-directionally: it constructs and starts
//! them, signals them to stop, and waits for their workers to finish.
//! Notifications flow the other way over the broadcast event channel, so
//! neither engine holds a pointer back to the facade.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::TransportMessage;
use crate::config::{ConfigError, InboxConfig, OutboxConfig};
use crate::dispatch::{CatalogSender, Dispatch, DispatchError};
use crate::events::{BusEvent, EngineKind, EventPublisher};
use crate::handler::{HandlerRegistry, MessageHandler};
use crate::inbox::InboxEngine;
use crate::outbox::{MessageRouter, OutboxEngine, StaticRouter};
use crate::pipeline::PipelineModule;
use crate::queue::{QueueCatalog, QueueError};
use crate::serializer::{JsonSerializer, MessageSerializer, SerializerError};
use crate::worker::WorkerState;

/// Service bus over one inbox and/or one outbox engine.
///
/// Built through [`Bus::builder`], started once, stopped cooperatively.
/// `send` never waits for delivery: it places the envelope on the outbound
/// work queue (or directly on the addressed queues when no outbox is
/// configured) and returns.
pub struct Bus {
    serializer: Arc<dyn MessageSerializer>,
    catalog: Option<Arc<dyn QueueCatalog>>,
    router: Arc<dyn MessageRouter>,
    handlers: HandlerRegistry,
    modules: Vec<Arc<dyn PipelineModule>>,
    inbox: Option<InboxConfig>,
    outbox: Option<OutboxConfig>,
    events: EventPublisher,
    cancel: CancellationToken,
    inbox_engine: Option<InboxEngine>,
    outbox_engine: Option<OutboxEngine>,
    started: bool,
}

impl Bus {
    /// Start building a bus.
    pub fn builder() -> BusBuilder {
        BusBuilder::default()
    }

    /// Subscribe to lifecycle events.
    ///
    /// Subscriptions are independent; a slow subscriber only loses its own
    /// backlog.
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Validate configuration and start the configured engines.
    ///
    /// Fatal on any configuration invariant violation. Starting an already
    /// started bus is an error. Must be called within a Tokio runtime.
    pub fn start(&mut self) -> Result<(), BusError> {
        if self.started {
            return Err(BusError::already_started());
        }

        if let Some(config) = &self.inbox {
            config.validate()?;
        }

        if let Some(config) = &self.outbox {
            config.validate()?;
            if self.catalog.is_none() {
                return Err(BusError::missing_catalog());
            }
        }

        if let Some(config) = &self.inbox {
            self.inbox_engine = Some(InboxEngine::start(
                config,
                Arc::clone(&self.serializer),
                self.handlers.clone(),
                self.modules.clone(),
                self.events.clone(),
                self.cancel.clone(),
            ));
        }

        if let Some(config) = &self.outbox {
            // Presence checked above.
            let catalog = self.catalog.clone().ok_or_else(BusError::missing_catalog)?;
            self.outbox_engine = Some(OutboxEngine::start(
                config,
                Arc::clone(&self.serializer),
                catalog,
                Arc::clone(&self.router),
                self.modules.clone(),
                self.events.clone(),
                self.cancel.clone(),
            ));
        }

        self.started = true;
        tracing::info!("bus started");
        Ok(())
    }

    /// Signal all workers to stop and wait until they have.
    ///
    /// Workers finish their in-flight message first; no message is
    /// abandoned mid-pipeline. After `stop` returns the bus can be started
    /// again.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        if let Some(engine) = &mut self.inbox_engine {
            engine.stop().await;
        }
        if let Some(engine) = &mut self.outbox_engine {
            engine.stop().await;
        }

        self.cancel = CancellationToken::new();
        self.started = false;
        tracing::info!("bus stopped");
    }

    /// Observable states of an engine's workers.
    pub fn worker_states(&self, engine: EngineKind) -> Vec<WorkerState> {
        match engine {
            EngineKind::Inbox => self
                .inbox_engine
                .as_ref()
                .map(InboxEngine::worker_states)
                .unwrap_or_default(),
            EngineKind::Outbox => self
                .outbox_engine
                .as_ref()
                .map(OutboxEngine::worker_states)
                .unwrap_or_default(),
        }
    }

    /// Enqueue an envelope for delivery.
    ///
    /// With an outbox configured the envelope lands on the outbound work
    /// queue and the outbox workers take it from there. Without one, the
    /// recipients (explicit, or resolved through the router) are enqueued
    /// directly. Either way the call returns as soon as the enqueue
    /// succeeds.
    #[tracing::instrument(skip_all, fields(message_id = %message.id, message_type = %message.message_type))]
    pub async fn send(&self, mut message: TransportMessage) -> Result<(), BusError> {
        if let Some(outbox) = &self.outbox {
            let payload = self.serializer.serialize(&message)?;
            outbox.work_queue.enqueue(message.id, payload).await?;
            tracing::debug!("message enqueued on outbox work queue");
            return Ok(());
        }

        if message.recipients.is_empty() {
            message.recipients = self
                .router
                .resolve_destinations(&message.message_type)
                .await
                .map_err(BusError::routing)?;
        }

        if message.recipients.is_empty() {
            return Err(BusError::no_destination(&message.message_type));
        }

        let catalog = self.catalog.clone().ok_or_else(BusError::missing_catalog)?;
        let dispatch = Dispatch::new(CatalogSender::new(
            catalog,
            Arc::clone(&self.serializer),
            self.events.clone(),
        ));

        dispatch.send(message).await?;
        Ok(())
    }

    /// Build an envelope from a typed payload and [`send`](Bus::send) it.
    pub async fn send_message<T: serde::Serialize>(
        &self,
        message_type: impl Into<String>,
        message: &T,
    ) -> Result<(), BusError> {
        let envelope = TransportMessage::for_message(message_type, message)
            .map_err(|e| BusError::serializer_raw(Box::new(e)))?;
        self.send(envelope).await
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        // Best effort: workers observe the cancellation between cycles.
        if self.started {
            self.cancel.cancel();
        }
    }
}

/// Builder wiring collaborators, handlers and engine configurations.
pub struct BusBuilder {
    serializer: Arc<dyn MessageSerializer>,
    catalog: Option<Arc<dyn QueueCatalog>>,
    router: Arc<dyn MessageRouter>,
    handlers: HandlerRegistry,
    modules: Vec<Arc<dyn PipelineModule>>,
    inbox: Option<InboxConfig>,
    outbox: Option<OutboxConfig>,
    event_capacity: usize,
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self {
            serializer: Arc::new(JsonSerializer),
            catalog: None,
            router: Arc::new(StaticRouter::new()),
            handlers: HandlerRegistry::new(),
            modules: Vec::new(),
            inbox: None,
            outbox: None,
            event_capacity: 256,
        }
    }
}

impl BusBuilder {
    /// Replace the envelope serializer (JSON by default).
    pub fn with_serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Set the queue catalog used to resolve destination names.
    pub fn with_catalog(mut self, catalog: Arc<dyn QueueCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Set the routing collaborator (an empty route table by default).
    pub fn with_router(mut self, router: Arc<dyn MessageRouter>) -> Self {
        self.router = router;
        self
    }

    /// Register a handler for a message type.
    pub fn with_handler(
        mut self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.handlers = self.handlers.register(message_type, handler);
        self
    }

    /// Attach a pipeline module to both engines.
    pub fn with_module(mut self, module: Arc<dyn PipelineModule>) -> Self {
        self.modules.push(module);
        self
    }

    /// Configure the inbox engine.
    pub fn with_inbox(mut self, config: InboxConfig) -> Self {
        self.inbox = Some(config);
        self
    }

    /// Configure the outbox engine.
    pub fn with_outbox(mut self, config: OutboxConfig) -> Self {
        self.outbox = Some(config);
        self
    }

    /// Capacity of the lifecycle event channel.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Assemble the bus. Configuration is validated at start, not here.
    pub fn build(self) -> Bus {
        Bus {
            serializer: self.serializer,
            catalog: self.catalog,
            router: self.router,
            handlers: self.handlers,
            modules: self.modules,
            inbox: self.inbox,
            outbox: self.outbox,
            events: EventPublisher::new(self.event_capacity),
            cancel: CancellationToken::new(),
            inbox_engine: None,
            outbox_engine: None,
            started: false,
        }
    }
}

/// Error returned by bus lifecycle and send operations.
#[derive(Debug)]
pub struct BusError {
    context: SpanTrace,
    kind: BusErrorKind,
}

/// Bus error kinds.
#[derive(Debug)]
pub enum BusErrorKind {
    /// An engine configuration violated an invariant.
    Config(ConfigError),
    /// `start` was called on an already started bus.
    AlreadyStarted,
    /// An operation needed a queue catalog and none was configured.
    MissingCatalog,
    /// A message resolved to no destination at all.
    NoDestination { message_type: String },
    /// The routing collaborator failed.
    Routing(tower::BoxError),
    /// Envelope serialization failed.
    Serializer(tower::BoxError),
    /// A queue operation failed.
    Queue(QueueError),
    /// Direct dispatch failed.
    Dispatch(DispatchError),
}

impl BusError {
    fn already_started() -> Self {
        Self::new(BusErrorKind::AlreadyStarted)
    }

    fn missing_catalog() -> Self {
        Self::new(BusErrorKind::MissingCatalog)
    }

    fn no_destination(message_type: &str) -> Self {
        Self::new(BusErrorKind::NoDestination {
            message_type: message_type.to_owned(),
        })
    }

    fn routing(err: tower::BoxError) -> Self {
        Self::new(BusErrorKind::Routing(err))
    }

    fn serializer_raw(err: tower::BoxError) -> Self {
        Self::new(BusErrorKind::Serializer(err))
    }

    fn new(kind: BusErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    /// The error kind.
    pub fn kind(&self) -> &BusErrorKind {
        &self.kind
    }
}

impl From<ConfigError> for BusError {
    fn from(err: ConfigError) -> Self {
        Self::new(BusErrorKind::Config(err))
    }
}

impl From<SerializerError> for BusError {
    fn from(err: SerializerError) -> Self {
        Self::new(BusErrorKind::Serializer(Box::new(err)))
    }
}

impl From<QueueError> for BusError {
    fn from(err: QueueError) -> Self {
        Self::new(BusErrorKind::Queue(err))
    }
}

impl From<DispatchError> for BusError {
    fn from(err: DispatchError) -> Self {
        Self::new(BusErrorKind::Dispatch(err))
    }
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            BusErrorKind::Config(err) => writeln!(f, "Configuration error: {err}"),
            BusErrorKind::AlreadyStarted => writeln!(f, "Bus is already started"),
            BusErrorKind::MissingCatalog => {
                writeln!(f, "A queue catalog is required to resolve destinations")
            }
            BusErrorKind::NoDestination { message_type } => {
                writeln!(f, "No destination for message type '{message_type}'")
            }
            BusErrorKind::Routing(err) => writeln!(f, "Routing error: {err}"),
            BusErrorKind::Serializer(err) => writeln!(f, "Serializer error: {err}"),
            BusErrorKind::Queue(err) => writeln!(f, "Queue error: {err}"),
            BusErrorKind::Dispatch(err) => writeln!(f, "Dispatch error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for BusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            BusErrorKind::Config(err) => Some(err),
            BusErrorKind::Queue(err) => Some(err),
            BusErrorKind::Dispatch(err) => Some(err),
            BusErrorKind::Routing(err) | BusErrorKind::Serializer(err) => Some(err.as_ref()),
            BusErrorKind::AlreadyStarted
            | BusErrorKind::MissingCatalog
            | BusErrorKind::NoDestination { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use chrono::Utc;

    use crate::handler::handle_fn;
    use crate::pipeline::{ErrorDisposition, PipelineContext};
    use crate::queue::{InMemoryCatalog, InMemoryQueue, Queue};

    const POLL: Duration = Duration::from_millis(10);
    const DEADLINE: Duration = Duration::from_secs(20);

    async fn wait_until<F, Fut>(what: &str, condition: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let started = tokio::time::Instant::now();
        while !condition().await {
            if started.elapsed() > DEADLINE {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(POLL).await;
        }
    }

    fn fast_inbox(work: &Arc<InMemoryQueue>, error: &Arc<InMemoryQueue>) -> InboxConfig {
        InboxConfig::new(
            Arc::clone(work) as Arc<dyn Queue>,
            Arc::clone(error) as Arc<dyn Queue>,
        )
        .with_idle_durations(vec![Duration::from_millis(5)])
        .with_ignore_durations(vec![Duration::from_millis(5)])
    }

    fn fast_outbox(work: &Arc<InMemoryQueue>, error: &Arc<InMemoryQueue>) -> OutboxConfig {
        OutboxConfig::new(
            Arc::clone(work) as Arc<dyn Queue>,
            Arc::clone(error) as Arc<dyn Queue>,
        )
        .with_idle_durations(vec![Duration::from_millis(5)])
        .with_ignore_durations(vec![Duration::from_millis(5)])
    }

    #[tokio::test]
    async fn starting_twice_is_an_error() {
        let work = Arc::new(InMemoryQueue::new());
        let error = Arc::new(InMemoryQueue::new());

        let mut bus = Bus::builder().with_inbox(fast_inbox(&work, &error)).build();

        bus.start().unwrap();
        assert!(matches!(
            bus.start().unwrap_err().kind(),
            BusErrorKind::AlreadyStarted
        ));

        bus.stop().await;
    }

    #[tokio::test]
    async fn refuses_to_start_with_invalid_configuration() {
        let work = Arc::new(InMemoryQueue::new());
        let error = Arc::new(InMemoryQueue::new());

        let mut bus = Bus::builder()
            .with_inbox(fast_inbox(&work, &error).with_worker_count(0))
            .build();

        assert!(matches!(
            bus.start().unwrap_err().kind(),
            BusErrorKind::Config(_)
        ));
    }

    #[tokio::test]
    async fn outbox_without_catalog_refuses_to_start() {
        let work = Arc::new(InMemoryQueue::new());
        let error = Arc::new(InMemoryQueue::new());

        let mut bus = Bus::builder()
            .with_outbox(fast_outbox(&work, &error))
            .build();

        assert!(matches!(
            bus.start().unwrap_err().kind(),
            BusErrorKind::MissingCatalog
        ));
    }

    #[tokio::test]
    async fn outbox_round_trip_delivers_every_message_once() {
        const COUNT: usize = 100;
        const WORKERS: usize = 3;

        let catalog = InMemoryCatalog::new();
        let receiver = catalog.create("receiver-work".parse().unwrap());
        let work = Arc::new(InMemoryQueue::new());
        let error = Arc::new(InMemoryQueue::new());

        let mut bus = Bus::builder()
            .with_catalog(Arc::new(catalog.clone()))
            .with_router(Arc::new(
                StaticRouter::new().route("member.registered", "receiver-work".parse().unwrap()),
            ))
            .with_outbox(fast_outbox(&work, &error).with_worker_count(WORKERS))
            .build();

        // Track which outbox workers have gone idle, the way a monitoring
        // consumer would.
        let mut events = bus.events();
        let idle_workers = Arc::new(Mutex::new(HashSet::new()));
        let idle_sink = Arc::clone(&idle_workers);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(BusEvent::ThreadWaiting {
                        engine: EngineKind::Outbox,
                        worker,
                    }) => {
                        idle_sink.lock().unwrap().insert(worker);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        for i in 0..COUNT {
            bus.send_message("member.registered", &format!("member-{i}"))
                .await
                .unwrap();
        }

        bus.start().unwrap();

        wait_until("all copies delivered and workers idle", || {
            let receiver = Arc::clone(&receiver);
            let idle_workers = Arc::clone(&idle_workers);
            async move {
                receiver.len().await == COUNT && idle_workers.lock().unwrap().len() == WORKERS
            }
        })
        .await;

        bus.stop().await;

        assert!(work.is_empty().await.unwrap());
        assert!(error.is_empty().await.unwrap());

        let mut delivered = 0;
        while let Some(copy) = receiver.receive_one().await.unwrap() {
            receiver.acknowledge(copy.token).await.unwrap();
            delivered += 1;
        }
        assert_eq!(delivered, COUNT);

        assert!(
            bus.worker_states(EngineKind::Outbox)
                .iter()
                .all(|s| *s == WorkerState::Stopped)
        );
    }

    #[tokio::test]
    async fn staggered_deferred_messages_are_each_handled_once() {
        const COUNT: usize = 10;

        let work = Arc::new(InMemoryQueue::new());
        let deferred = Arc::new(InMemoryQueue::new());
        let error = Arc::new(InMemoryQueue::new());
        let handled = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&handled);
        let mut bus = Bus::builder()
            .with_inbox(
                fast_inbox(&work, &error)
                    .with_deferred_queue(Arc::clone(&deferred) as Arc<dyn Queue>),
            )
            .with_handler(
                "member.registered",
                handle_fn(move |name: String| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().unwrap().push(name);
                        Ok(())
                    }
                }),
            )
            .build();

        bus.start().unwrap();

        // Staggered due times, all in the near future.
        let mut due = Utc::now() + chrono::Duration::milliseconds(400);
        for i in 0..COUNT {
            let message =
                TransportMessage::for_message("member.registered", &format!("member-{i}"))
                    .unwrap()
                    .defer(due);
            let payload = JsonSerializer.serialize(&message).unwrap();
            work.enqueue(message.id, payload).await.unwrap();

            due += chrono::Duration::milliseconds(100);
        }

        wait_until("all deferred messages handled", || {
            let handled = Arc::clone(&handled);
            async move { handled.lock().unwrap().len() >= COUNT }
        })
        .await;

        // Settle time to catch duplicates.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let handled = handled.lock().unwrap().clone();
        assert_eq!(handled.len(), COUNT);
        assert_eq!(handled.iter().collect::<HashSet<_>>().len(), COUNT);

        assert!(error.is_empty().await.unwrap());
        assert!(deferred.is_empty().await.unwrap());
        assert!(work.is_empty().await.unwrap());

        bus.stop().await;
    }

    struct CountingExceptionModule {
        seen: AtomicU32,
    }

    #[async_trait::async_trait]
    impl PipelineModule for CountingExceptionModule {
        async fn on_exception(
            &self,
            _error: &tower::BoxError,
            _ctx: &mut PipelineContext,
        ) -> ErrorDisposition {
            self.seen.fetch_add(1, Ordering::SeqCst);
            ErrorDisposition::Unhandled
        }
    }

    #[tokio::test]
    async fn modules_observe_exceptions_and_retries_recover() {
        let work = Arc::new(InMemoryQueue::new());
        let error = Arc::new(InMemoryQueue::new());
        let module = Arc::new(CountingExceptionModule {
            seen: AtomicU32::new(0),
        });
        let attempts = Arc::new(AtomicU32::new(0));
        let handled = Arc::new(AtomicU32::new(0));

        let attempts_sink = Arc::clone(&attempts);
        let handled_sink = Arc::clone(&handled);
        let mut bus = Bus::builder()
            .with_inbox(fast_inbox(&work, &error))
            .with_module(Arc::clone(&module) as Arc<dyn PipelineModule>)
            .with_handler(
                "member.registered",
                handle_fn(move |_: String| {
                    let attempts = Arc::clone(&attempts_sink);
                    let handled = Arc::clone(&handled_sink);
                    async move {
                        // Fail the first two attempts, then succeed.
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            return Err("transient".into());
                        }
                        handled.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .build();

        bus.start().unwrap();

        let message = TransportMessage::for_message("member.registered", &"alice").unwrap();
        let payload = JsonSerializer.serialize(&message).unwrap();
        work.enqueue(message.id, payload).await.unwrap();

        wait_until("message recovered", || {
            let handled = Arc::clone(&handled);
            async move { handled.load(Ordering::SeqCst) == 1 }
        })
        .await;

        bus.stop().await;

        assert_eq!(module.seen.load(Ordering::SeqCst), 2);
        assert!(error.is_empty().await.unwrap());
        assert!(work.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn direct_send_reaches_addressed_queue() {
        let catalog = InMemoryCatalog::new();
        let addressed = catalog.create("addressed".parse().unwrap());

        let bus = Bus::builder().with_catalog(Arc::new(catalog.clone())).build();

        let message = TransportMessage::for_message("member.registered", &"alice")
            .unwrap()
            .with_recipient("addressed".parse().unwrap());
        bus.send(message).await.unwrap();

        assert_eq!(addressed.len().await, 1);
    }

    #[tokio::test]
    async fn direct_send_without_destination_is_an_error() {
        let catalog = InMemoryCatalog::new();
        let bus = Bus::builder().with_catalog(Arc::new(catalog)).build();

        let message = TransportMessage::for_message("member.registered", &"alice").unwrap();

        assert!(matches!(
            bus.send(message).await.unwrap_err().kind(),
            BusErrorKind::NoDestination { .. }
        ));
    }
}
