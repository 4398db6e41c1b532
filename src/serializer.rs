use tracing_error::SpanTrace;

use crate::TransportMessage;

/// Envelope codec used at the queue boundary.
///
/// Queues store opaque bytes; the engines serialize a [`TransportMessage`]
/// on the way in and deserialize it on the way out. The business payload
/// inside the envelope is untouched by this trait.
pub trait MessageSerializer: Send + Sync {
    /// Serialize an envelope for storage on a queue.
    fn serialize(&self, message: &TransportMessage) -> Result<Vec<u8>, SerializerError>;

    /// Deserialize an envelope received from a queue.
    fn deserialize(&self, bytes: &[u8]) -> Result<TransportMessage, SerializerError>;
}

/// JSON envelope codec.
///
/// The default serializer. JSON keeps quarantined messages on the error
/// queue readable without extra tooling.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn serialize(&self, message: &TransportMessage) -> Result<Vec<u8>, SerializerError> {
        serde_json::to_vec(message).map_err(SerializerError::serde)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<TransportMessage, SerializerError> {
        serde_json::from_slice(bytes).map_err(SerializerError::serde)
    }
}

/// Error returned by envelope serialization.
#[derive(Debug)]
pub struct SerializerError {
    context: SpanTrace,
    source: serde_json::Error,
}

impl SerializerError {
    fn serde(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err,
        }
    }
}

impl std::fmt::Display for SerializerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Serde error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SerializerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let serializer = JsonSerializer;
        let message = TransportMessage::for_message("member.registered", &42).unwrap();

        let bytes = serializer.serialize(&message).unwrap();
        let decoded = serializer.deserialize(&bytes).unwrap();

        assert_eq!(decoded, message);
    }

    #[test]
    fn garbage_fails_to_deserialize() {
        assert!(JsonSerializer.deserialize(b"not-json").is_err());
    }
}
