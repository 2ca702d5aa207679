pub mod traits;
pub mod webhook;

pub use traits::Processor;
pub use webhook::WebhookProcessor;

use crate::config::ProcessorConfig;
use crate::instances::{InboundEnvelope, OutboundContent};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Logs each accepted message and never replies. Used when no webhook is
/// configured, so the gateway can run (and deduplicate) without a backend.
pub struct LogOnlyProcessor;

#[async_trait]
impl Processor for LogOnlyProcessor {
    fn name(&self) -> &str {
        "log"
    }

    async fn process(&self, envelope: &InboundEnvelope) -> anyhow::Result<Option<OutboundContent>> {
        tracing::info!(
            "Inbound {:?} message {} on {} from {} ({} chars)",
            envelope.kind,
            envelope.message_id,
            envelope.source_instance,
            envelope.sender_address,
            envelope.body.chars().count()
        );
        Ok(None)
    }
}

/// Factory: build the processor from config
pub fn create_processor(config: &ProcessorConfig) -> Arc<dyn Processor> {
    match config.webhook_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => {
            tracing::info!("Processor: webhook {url}");
            Arc::new(WebhookProcessor::new(
                url,
                Duration::from_secs(config.timeout_secs.max(1)),
            ))
        }
        _ => {
            tracing::warn!("Processor: no webhook_url configured, inbound messages are only logged");
            Arc::new(LogOnlyProcessor)
        }
    }
}
