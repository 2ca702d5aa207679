//! Message router: inbound normalization, deduplication, processing, and
//! outbound delivery through the registered instances.

use crate::dedup::{DedupDecision, MessageDeduplicator};
use crate::instances::{
    GatewayError, InboundEnvelope, InboundHandler, InstanceRegistry, InstanceStatus,
    MessageKind, OutboundContent,
};
use crate::processor::Processor;
use crate::transport::RawMessage;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

const STATUS_BROADCAST: &str = "status@broadcast";

/// Per-instance result of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastOutcome {
    pub instance: String,
    pub success: bool,
}

pub struct MessageRouter {
    registry: Arc<InstanceRegistry>,
    dedup: Arc<MessageDeduplicator>,
    processor: Arc<dyn Processor>,
}

/// Build an envelope, or `None` for messages the gateway ignores.
pub fn normalize(instance_identity: &str, raw: RawMessage) -> Option<InboundEnvelope> {
    if raw.from_me || raw.from == STATUS_BROADCAST {
        return None;
    }
    let kind = MessageKind::from_transport_type(&raw.message_type, raw.has_media);
    if kind == MessageKind::Text && raw.body.trim().is_empty() {
        return None;
    }
    Some(InboundEnvelope {
        source_instance: instance_identity.to_string(),
        sender_address: raw.from,
        body: raw.body,
        message_id: raw.id,
        timestamp: raw.timestamp,
        kind,
    })
}

impl MessageRouter {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        dedup: Arc<MessageDeduplicator>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        Self {
            registry,
            dedup,
            processor,
        }
    }

    /// Subscribe this router to inbound messages from every instance.
    pub fn attach(self: &Arc<Self>) {
        let handler: Arc<dyn InboundHandler> = self.clone();
        self.registry.set_inbound_handler(&handler);
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn dedup(&self) -> &Arc<MessageDeduplicator> {
        &self.dedup
    }

    /// Send `content` through one instance, propagating the first failure.
    /// Returns the transport message ids, in send order.
    pub async fn try_send(
        &self,
        instance_identity: &str,
        recipient: &str,
        content: &OutboundContent,
    ) -> anyhow::Result<Vec<String>> {
        let instance = self
            .registry
            .get_instance(instance_identity)
            .ok_or_else(|| GatewayError::NotFound(instance_identity.to_string()))?;
        let status = instance.status();
        if status != InstanceStatus::Ready {
            return Err(GatewayError::NotReady {
                identity: instance_identity.to_string(),
                status,
            }
            .into());
        }

        let client = instance.client();
        let mut ids = Vec::new();
        for payload in content.to_payloads() {
            let id = client
                .send_message(recipient, &payload)
                .await
                .map_err(|e| GatewayError::Transport(format!("{e:#}")))?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Like [`try_send`](Self::try_send), reporting only success.
    pub async fn send_message(
        &self,
        instance_identity: &str,
        recipient: &str,
        content: &OutboundContent,
    ) -> bool {
        match self.try_send(instance_identity, recipient, content).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Send via {instance_identity} to {recipient} failed: {e}");
                false
            }
        }
    }

    /// First ready instance, oldest first.
    ///
    /// The hint is unused for now; selection is intentionally naive until
    /// a load-aware policy is needed.
    pub fn find_best_instance(&self, _recipient_hint: Option<&str>) -> Option<String> {
        self.registry
            .ready_instances()
            .first()
            .map(|i| i.identity().to_string())
    }

    /// Send through every ready instance. Outcomes are reported per
    /// instance; a failure never aborts the others.
    pub async fn broadcast(
        &self,
        recipient: &str,
        content: &OutboundContent,
    ) -> Vec<BroadcastOutcome> {
        let ready = self.registry.ready_instances();
        let sends = ready.iter().map(|instance| async move {
            let identity = instance.identity().to_string();
            let success = self.send_message(&identity, recipient, content).await;
            BroadcastOutcome {
                instance: identity,
                success,
            }
        });
        futures_util::future::join_all(sends).await
    }

    async fn reply(&self, envelope: &InboundEnvelope, content: &OutboundContent) {
        let origin = &envelope.source_instance;
        let via = match self.registry.get_instance(origin) {
            Some(instance) if instance.is_ready() => Some(origin.clone()),
            _ => {
                let fallback = self.find_best_instance(Some(&envelope.sender_address));
                if let Some(other) = &fallback {
                    tracing::info!(
                        "Instance {origin} not ready, replying to {} via {other}",
                        envelope.sender_address
                    );
                }
                fallback
            }
        };
        let Some(via) = via else {
            tracing::warn!(
                "No ready instance to reply to {} (message {} on {origin})",
                envelope.sender_address,
                envelope.message_id
            );
            return;
        };

        if let Err(e) = self
            .try_send(&via, &envelope.sender_address, content)
            .await
        {
            tracing::error!(
                "Reply to {} via {via} failed for message {}: {e:#}",
                envelope.sender_address,
                envelope.message_id
            );
        }
    }
}

#[async_trait]
impl InboundHandler for MessageRouter {
    async fn handle_inbound(&self, instance_identity: &str, message: RawMessage) {
        let message_id = message.id.clone();
        let Some(envelope) = normalize(instance_identity, message) else {
            tracing::debug!("Instance {instance_identity}: message {message_id} ignored");
            return;
        };

        match self.dedup.check(instance_identity, &envelope.message_id).await {
            DedupDecision::Accepted => {}
            DedupDecision::Duplicate | DedupDecision::StoreUnavailable => return,
        }

        let reply = match self.processor.process(&envelope).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(
                    "Processor {} failed on message {} from {instance_identity}: {e:#}",
                    self.processor.name(),
                    envelope.message_id
                );
                return;
            }
        };
        self.reply(&envelope, &reply).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str, from: &str, body: &str, message_type: &str) -> RawMessage {
        RawMessage {
            id: id.into(),
            from: from.into(),
            body: body.into(),
            timestamp: 1_700_000_000,
            message_type: message_type.into(),
            from_me: false,
            has_media: false,
        }
    }

    #[test]
    fn normalize_builds_envelope() {
        let env = normalize("100", raw("m1", "200@c.us", "hi", "chat")).unwrap();
        assert_eq!(env.source_instance, "100");
        assert_eq!(env.sender_address, "200@c.us");
        assert_eq!(env.message_id, "m1");
        assert_eq!(env.kind, MessageKind::Text);
        assert_eq!(env.timestamp, 1_700_000_000);
    }

    #[test]
    fn normalize_skips_own_and_status_messages() {
        let mut own = raw("m1", "200@c.us", "hi", "chat");
        own.from_me = true;
        assert!(normalize("100", own).is_none());
        assert!(normalize("100", raw("m2", STATUS_BROADCAST, "hi", "chat")).is_none());
    }

    #[test]
    fn normalize_skips_blank_text_but_keeps_blank_media() {
        assert!(normalize("100", raw("m1", "200@c.us", "  ", "chat")).is_none());
        let voice = normalize("100", raw("m2", "200@c.us", "", "ptt")).unwrap();
        assert_eq!(voice.kind, MessageKind::Voice);
    }
}
