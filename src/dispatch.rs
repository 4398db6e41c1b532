//! Destination dispatch for outbound envelopes.
//!
//! This module defines a Tower-compatible dispatch layer used by the outbox
//! to deliver a [`TransportMessage`] to each of its resolved destination
//! queues.
//!
//! The dispatcher is built around Tower's `Service` abstraction, enabling
//! middleware composition (timeouts, tracing, buffering, etc.) while keeping
//! the delivery backend swappable.
//!
//! ## Key components
//!
//! - [`Dispatch`]: Public-facing wrapper implementing `tower::Service`
//! - [`SenderService`]: Adapter from a [`Sender`] to a Tower service
//! - [`Sender`]: Trait implemented by concrete delivery backends
//! - [`CatalogSender`]: Default backend enqueuing one copy per recipient
//! - [`DispatchError`]: Unified error type with tracing context

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tower::Service;
use tracing_error::SpanTrace;

use crate::TransportMessage;
use crate::events::{BusEvent, EventPublisher};
use crate::queue::{QueueCatalog, QueueName};
use crate::serializer::MessageSerializer;

/// Generic Tower-compatible dispatch wrapper.
///
/// `Dispatch` is the outbox's delivery entry point. It wraps an underlying
/// Tower `Service` and:
///
/// - Normalizes errors into [`DispatchError`]
/// - Supports Tower middleware via layers
/// - Provides a convenience [`send`](Dispatch::send) API
///
/// Typically constructed from a concrete [`Sender`] implementation.
#[derive(Clone)]
pub struct Dispatch<S> {
    service: S,
}

impl<D> Dispatch<SenderService<D>> {
    /// Create a new dispatcher from a concrete delivery backend.
    ///
    /// The sender will be wrapped in a [`SenderService`] to make it
    /// Tower-compatible.
    pub fn new(sender: D) -> Self {
        Self {
            service: SenderService::new(sender),
        }
    }
}

impl<S> Dispatch<S> {
    /// Apply a Tower layer to the dispatcher.
    ///
    /// This enables composition with middleware such as timeouts, buffering,
    /// or tracing.
    pub fn layer<L>(self, layer: L) -> Dispatch<L::Service>
    where
        L: tower::Layer<S>,
    {
        Dispatch {
            service: layer.layer(self.service),
        }
    }
}

/// Tower `Service` implementation for `Dispatch`.
///
/// Delegates readiness and request handling to the inner service while
/// mapping all errors into [`DispatchError`].
impl<S> Service<TransportMessage> for Dispatch<S>
where
    S: Service<TransportMessage> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
{
    type Response = ();
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| DispatchError::sender(e.into()))
    }

    fn call(&mut self, req: TransportMessage) -> Self::Future {
        let mut service = self.service.clone();

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| DispatchError::sender(e.into()))?;
            Ok(())
        })
    }
}

impl<S> Dispatch<S> {
    /// Deliver an envelope to all of its recipients.
    ///
    /// This is a convenience method for callers that do not need direct
    /// access to the `tower::Service` API.
    pub async fn send(&self, message: TransportMessage) -> Result<(), DispatchError>
    where
        S: Service<TransportMessage> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        let mut service = self.service.clone();
        service
            .call(message)
            .await
            .map_err(|e| DispatchError::sender(e.into()))?;
        Ok(())
    }
}

/// Tower service adapter for a [`Sender`] backend.
///
/// This type bridges the [`Sender`] trait with Tower's `Service`
/// abstraction.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<D> Service<TransportMessage> for SenderService<D>
where
    D: Sender + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: TransportMessage) -> Self::Future {
        let sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by concrete delivery backends.
///
/// A sender is responsible for placing an envelope on every destination it
/// names. Senders must tolerate re-delivery of the same envelope: a failed
/// multi-recipient send is retried whole.
#[async_trait::async_trait]
pub trait Sender: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Deliver an envelope to its recipients.
    async fn send(&self, message: TransportMessage) -> Result<(), Self::Error>;
}

/// Default delivery backend over a [`QueueCatalog`].
///
/// Serializes the envelope once and enqueues one copy per recipient,
/// resolving each destination name through the catalog. An unknown
/// destination fails the whole send.
#[derive(Clone)]
pub struct CatalogSender {
    catalog: Arc<dyn QueueCatalog>,
    serializer: Arc<dyn MessageSerializer>,
    events: EventPublisher,
}

impl CatalogSender {
    pub(crate) fn new(
        catalog: Arc<dyn QueueCatalog>,
        serializer: Arc<dyn MessageSerializer>,
        events: EventPublisher,
    ) -> Self {
        Self {
            catalog,
            serializer,
            events,
        }
    }
}

#[async_trait::async_trait]
impl Sender for CatalogSender {
    type Error = DispatchError;

    #[tracing::instrument(skip_all, fields(message_id = %message.id))]
    async fn send(&self, message: TransportMessage) -> Result<(), Self::Error> {
        let payload = self
            .serializer
            .serialize(&message)
            .map_err(|e| DispatchError::sender(Box::new(e)))?;

        for recipient in &message.recipients {
            let queue = self
                .catalog
                .get(recipient)
                .ok_or_else(|| DispatchError::unknown_destination(recipient.clone()))?;

            queue
                .enqueue(message.id, payload.clone())
                .await
                .map_err(|e| DispatchError::sender(Box::new(e)))?;

            tracing::debug!(recipient = %recipient, "copy enqueued");
            self.events.publish(BusEvent::MessageDispatched {
                id: message.id,
                recipient: recipient.clone(),
            });
        }

        Ok(())
    }
}

/// Error returned by dispatch operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct DispatchError {
    context: SpanTrace,
    kind: DispatchErrorKind,
}

/// Dispatch error kinds.
#[derive(Debug)]
pub enum DispatchErrorKind {
    /// Errors originating from the delivery backend.
    Sender(tower::BoxError),
    /// A recipient name the catalog cannot resolve.
    UnknownDestination(QueueName),
}

impl DispatchError {
    /// Create a backend-related dispatch error.
    pub fn sender(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DispatchErrorKind::Sender(err),
        }
    }

    fn unknown_destination(name: QueueName) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DispatchErrorKind::UnknownDestination(name),
        }
    }

    /// The error kind.
    pub fn kind(&self) -> &DispatchErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DispatchErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            DispatchErrorKind::UnknownDestination(name) => {
                writeln!(f, "Unknown destination queue '{name}'")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DispatchErrorKind::Sender(err) => Some(err.as_ref()),
            DispatchErrorKind::UnknownDestination(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryCatalog;
    use crate::serializer::JsonSerializer;

    fn sender(catalog: &InMemoryCatalog) -> Dispatch<SenderService<CatalogSender>> {
        Dispatch::new(CatalogSender::new(
            Arc::new(catalog.clone()),
            Arc::new(JsonSerializer),
            EventPublisher::new(8),
        ))
    }

    #[tokio::test]
    async fn enqueues_one_copy_per_recipient() {
        let catalog = InMemoryCatalog::new();
        let first = catalog.create("first".parse().unwrap());
        let second = catalog.create("second".parse().unwrap());

        let message = TransportMessage::for_message("member.registered", &"alice")
            .unwrap()
            .with_recipient("first".parse().unwrap())
            .with_recipient("second".parse().unwrap());

        sender(&catalog).send(message).await.unwrap();

        assert_eq!(first.len().await, 1);
        assert_eq!(second.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_destination_fails_the_send() {
        let catalog = InMemoryCatalog::new();
        let message = TransportMessage::for_message("member.registered", &"alice")
            .unwrap()
            .with_recipient("nowhere".parse().unwrap());

        let error = sender(&catalog).send(message).await.unwrap_err();

        assert!(matches!(
            error.kind(),
            DispatchErrorKind::UnknownDestination(_)
        ));
    }
}
