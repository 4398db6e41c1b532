use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::queue::QueueName;

/// Message container moved between queues by the processing engines.
///
/// `TransportMessage` bundles a serialized business message together with the
/// routing and delivery metadata the engines act on. It is the unit of work
/// for both the inbox and the outbox: queues store its serialized form, the
/// pipeline decodes it, and the failure policy mutates it.
///
/// ## Design
///
/// - `message_type` names the business message; it selects the handler on
///   the inbox side and the route on the outbox side
/// - `recipients` is only meaningful outbound; an empty list means the
///   routing collaborator decides
/// - `defer_until` marks the message as not yet processable
/// - `failure_count` and `failures` accumulate across attempts and travel
///   with the message onto the error queue, so a quarantined message carries
///   its own diagnosis
///
/// ## Construction
///
/// Messages are built fluently from a typed payload:
///
/// ```rust
/// use courier::TransportMessage;
/// use chrono::{Duration, Utc};
///
/// let message = TransportMessage::for_message("member.registered", &"hello")
///     .unwrap()
///     .with_recipient("member-inbox".parse().unwrap())
///     .defer(Utc::now() + Duration::seconds(5));
///
/// assert_eq!(message.message_type, "member.registered");
/// assert_eq!(message.failure_count, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Unique identifier, assigned at creation.
    pub id: Uuid,
    /// Logical name of the business message.
    pub message_type: String,
    /// Ordered destination queues (outbound only).
    pub recipients: Vec<QueueName>,
    /// Instant before which the message must not be processed.
    pub defer_until: Option<DateTime<Utc>>,
    /// Number of failed processing attempts so far.
    pub failure_count: u32,
    /// Error context of each failed attempt, oldest first.
    pub failures: Vec<String>,
    /// User-supplied metadata.
    pub headers: HashMap<String, String>,
    /// Serialized business message.
    pub payload: Vec<u8>,
    /// Creation timestamp.
    pub sent_at: DateTime<Utc>,
}

impl TransportMessage {
    /// Create a new message from an already serialized payload.
    pub fn new(message_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            recipients: Vec::new(),
            defer_until: None,
            failure_count: 0,
            failures: Vec::new(),
            headers: HashMap::new(),
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Create a new message by serializing a typed payload to JSON.
    pub fn for_message<T: Serialize>(
        message_type: impl Into<String>,
        message: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(message_type, serde_json::to_vec(message)?))
    }

    /// Add a destination queue.
    pub fn with_recipient(mut self, recipient: QueueName) -> Self {
        self.recipients.push(recipient);
        self
    }

    /// Defer processing until the given instant.
    pub fn defer(mut self, until: DateTime<Utc>) -> Self {
        self.defer_until = Some(until);
        self
    }

    /// Attach a metadata header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Deserialize the payload into a typed business message.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Whether the message is due for processing at `now`.
    ///
    /// A message without a defer timestamp is always due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.defer_until {
            Some(until) => until <= now,
            None => true,
        }
    }

    /// Record a failed processing attempt.
    ///
    /// Increments the failure count exactly once and keeps the error text so
    /// a poisoned message can be diagnosed straight off the error queue.
    pub(crate) fn register_failure(&mut self, error: &str) {
        self.failure_count += 1;
        self.failures.push(error.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn typed_payload_round_trip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Registered {
            name: String,
        }

        let command = Registered {
            name: "alice".into(),
        };
        let message = TransportMessage::for_message("member.registered", &command).unwrap();

        assert_eq!(message.payload_as::<Registered>().unwrap(), command);
    }

    #[test]
    fn due_when_no_defer_timestamp() {
        let message = TransportMessage::new("noop", Vec::new());
        assert!(message.is_due(Utc::now()));
    }

    #[test]
    fn not_due_until_defer_timestamp_passes() {
        let now = Utc::now();
        let message = TransportMessage::new("noop", Vec::new()).defer(now + Duration::seconds(5));

        assert!(!message.is_due(now));
        assert!(message.is_due(now + Duration::seconds(5)));
    }

    #[test]
    fn register_failure_increments_once_and_keeps_context() {
        let mut message = TransportMessage::new("noop", Vec::new());

        message.register_failure("boom");
        message.register_failure("still boom");

        assert_eq!(message.failure_count, 2);
        assert_eq!(message.failures, vec!["boom", "still boom"]);
    }
}
