use std::sync::Arc;

use crate::pipeline::{PipelineContext, Stage};
use crate::serializer::MessageSerializer;

/// First stage of every pipeline: decode the received payload.
///
/// A payload that cannot be decoded fails the stage; the failure policy
/// quarantines it verbatim, since an unreadable envelope cannot carry a
/// failure count.
pub(crate) struct DeserializeEnvelope {
    serializer: Arc<dyn MessageSerializer>,
}

impl DeserializeEnvelope {
    pub(crate) fn new(serializer: Arc<dyn MessageSerializer>) -> Self {
        Self { serializer }
    }
}

#[async_trait::async_trait]
impl Stage for DeserializeEnvelope {
    fn name(&self) -> &'static str {
        "deserialize-envelope"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<(), tower::BoxError> {
        let message = self.serializer.deserialize(ctx.raw()).map_err(Box::new)?;
        ctx.set_message(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportMessage;
    use crate::serializer::JsonSerializer;

    #[tokio::test]
    async fn installs_decoded_envelope_on_context() {
        let serializer: Arc<dyn MessageSerializer> = Arc::new(JsonSerializer);
        let message = TransportMessage::for_message("member.registered", &1).unwrap();
        let raw = serializer.serialize(&message).unwrap();

        let stage = DeserializeEnvelope::new(serializer);
        let mut ctx = PipelineContext::new(raw);
        stage.execute(&mut ctx).await.unwrap();

        assert_eq!(ctx.message().unwrap().id, message.id);
    }

    #[tokio::test]
    async fn garbage_fails_the_stage() {
        let stage = DeserializeEnvelope::new(Arc::new(JsonSerializer));
        let mut ctx = PipelineContext::new(b"garbage".to_vec());

        assert!(stage.execute(&mut ctx).await.is_err());
        assert!(ctx.message().is_none());
    }
}
