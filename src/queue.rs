//! Queue port and backend abstractions.
//!
//! This module defines the narrow contract the processing engines require
//! from a durable queue: enqueue, receive-one, acknowledge. Everything else
//! (storage, transactions, broker wiring) lives behind this seam.
//!
//! ## Key components
//!
//! - [`Queue`]: trait implemented by concrete queue backends
//! - [`ReceivedMessage`] / [`AckToken`]: a received payload and the opaque
//!   handle required to finalize its removal
//! - [`QueueName`]: validated queue identifier
//! - [`QueueCatalog`]: name-to-queue resolution for dispatch
//! - [`QueueError`]: unified error type with tracing context

mod inmemory;

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;
use uuid::Uuid;

pub use inmemory::{InMemoryCatalog, InMemoryQueue};

/// Trait implemented by concrete queue backends.
///
/// Backends must provide at-least-once semantics: [`receive_one`] hides the
/// message from other receivers, [`acknowledge`] finalizes its removal, and
/// a receive that is never acknowledged leaves the message receivable again.
/// Any duplicate processing that follows from a crash between receive and
/// acknowledge is an accepted at-least-once exposure; handlers are expected
/// to be idempotent.
///
/// [`receive_one`]: Queue::receive_one
/// [`acknowledge`]: Queue::acknowledge
#[async_trait::async_trait]
pub trait Queue: Send + Sync {
    /// Append a message payload to the queue.
    async fn enqueue(&self, id: Uuid, payload: Vec<u8>) -> Result<(), QueueError>;

    /// Receive the next available message, if any.
    ///
    /// A returned message is invisible to other receivers until either
    /// acknowledged or abandoned.
    async fn receive_one(&self) -> Result<Option<ReceivedMessage>, QueueError>;

    /// Finalize removal of a previously received message.
    async fn acknowledge(&self, token: AckToken) -> Result<(), QueueError>;

    /// Whether the queue currently has no receivable message.
    async fn is_empty(&self) -> Result<bool, QueueError>;

    /// Remove every message. Setup and test use only.
    async fn purge(&self) -> Result<(), QueueError>;
}

/// A message handed out by [`Queue::receive_one`].
#[derive(Debug)]
pub struct ReceivedMessage {
    /// Identifier the message was enqueued under.
    pub id: Uuid,
    /// Serialized [`TransportMessage`](crate::TransportMessage).
    pub payload: Vec<u8>,
    /// Handle required to acknowledge the receive.
    pub token: AckToken,
}

/// Opaque acknowledgement handle returned on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckToken(Uuid);

impl AckToken {
    pub(crate) fn next() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Validated queue identifier.
///
/// Names are non-empty and restricted to ASCII alphanumerics plus `-`, `_`
/// and `.`, which keeps them portable across queue backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create a queue name, validating backend-portable characters.
    pub fn new(name: impl Into<String>) -> Result<Self, QueueError> {
        let name = name.into();

        if name.is_empty() || name.len() > 260 {
            return Err(QueueError::invalid_name(name, "must be 1-260 characters"));
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(QueueError::invalid_name(
                name,
                "only ASCII alphanumerics, '-', '_' and '.' allowed",
            ));
        }

        Ok(Self(name))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for QueueName {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Resolves queue names to live queue instances.
///
/// The outbox dispatcher and the direct-send path use a catalog to turn the
/// logical destinations on an envelope into the queues to enqueue onto.
pub trait QueueCatalog: Send + Sync {
    /// Look up a queue by name.
    fn get(&self, name: &QueueName) -> Option<Arc<dyn Queue>>;
}

/// Error returned by queue operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct QueueError {
    context: SpanTrace,
    kind: QueueErrorKind,
}

/// Queue error kinds.
#[derive(Debug)]
pub enum QueueErrorKind {
    /// Errors originating from the queue backend.
    Backend(tower::BoxError),
    /// Acknowledgement token does not match a received message.
    UnknownToken(AckToken),
    /// Queue name failed validation.
    InvalidName { name: String, reason: &'static str },
}

impl QueueError {
    /// Create a backend-related queue error.
    pub fn backend(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: QueueErrorKind::Backend(err),
        }
    }

    pub(crate) fn unknown_token(token: AckToken) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: QueueErrorKind::UnknownToken(token),
        }
    }

    fn invalid_name(name: String, reason: &'static str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: QueueErrorKind::InvalidName { name, reason },
        }
    }

    /// The error kind.
    pub fn kind(&self) -> &QueueErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            QueueErrorKind::Backend(err) => writeln!(f, "Backend error: {err}"),
            QueueErrorKind::UnknownToken(token) => {
                writeln!(f, "Unknown acknowledgement token: {token:?}")
            }
            QueueErrorKind::InvalidName { name, reason } => {
                writeln!(f, "Invalid queue name '{name}': {reason}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            QueueErrorKind::Backend(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
