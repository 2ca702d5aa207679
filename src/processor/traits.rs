use crate::instances::{InboundEnvelope, OutboundContent};
use async_trait::async_trait;

/// Consumer of accepted inbound messages.
///
/// Invoked at most once per accepted message id and possibly concurrently
/// for different envelopes.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` means there is nothing to reply.
    async fn process(&self, envelope: &InboundEnvelope) -> anyhow::Result<Option<OutboundContent>>;
}
