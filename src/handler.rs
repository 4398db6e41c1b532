use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::TransportMessage;

/// Trait implemented by business message handlers.
///
/// A handler receives the full envelope; the payload helpers on
/// [`TransportMessage`] recover the typed message. Any returned error is a
/// processing failure and feeds the retry policy, so handlers should be
/// idempotent — a crash between handling and acknowledgement can replay a
/// message.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message attempt.
    async fn handle(&self, message: &TransportMessage) -> Result<(), tower::BoxError>;
}

/// Message-type to handler mapping.
///
/// Resolved once at engine construction; the dispatch stage looks handlers
/// up per message but the set never changes while the bus runs.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a message type, replacing any previous one.
    pub fn register(
        mut self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.handlers.insert(message_type.into(), handler);
        self
    }

    /// Look up the handler for a message type.
    pub fn resolve(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(message_type).cloned()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Adapt an async closure over a typed payload into a [`MessageHandler`].
///
/// The payload is deserialized before the closure runs; a decode failure is
/// reported as a processing failure of the handling attempt.
///
/// ```rust
/// use courier::handler::handle_fn;
///
/// let handler = handle_fn(|name: String| async move {
///     tracing::info!(%name, "member registered");
///     Ok(())
/// });
/// ```
pub fn handle_fn<T, F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    T: DeserializeOwned + Send + Sync + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), tower::BoxError>> + Send,
{
    Arc::new(FnHandler {
        f,
        _message: PhantomData,
    })
}

struct FnHandler<T, F> {
    f: F,
    _message: PhantomData<fn() -> T>,
}

#[async_trait::async_trait]
impl<T, F, Fut> MessageHandler for FnHandler<T, F>
where
    T: DeserializeOwned + Send + Sync + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), tower::BoxError>> + Send,
{
    async fn handle(&self, message: &TransportMessage) -> Result<(), tower::BoxError> {
        let payload: T = message.payload_as().map_err(Box::new)?;
        (self.f)(payload).await
    }
}
