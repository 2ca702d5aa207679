use crate::transport::{MediaAttachment, OutgoingPayload};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Initializing,
    QrPending,
    Authenticated,
    Ready,
    Disconnected,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::QrPending => "qr_pending",
            Self::Authenticated => "authenticated",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }

    /// Whether the instance still holds its session directory.
    pub fn owns_session(self) -> bool {
        !matches!(self, Self::Disconnected | Self::Failed)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized kind of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Text,
    Media,
    Voice,
    ContactCard,
    Call,
}

impl MessageKind {
    /// Map a transport-native message type.
    pub fn from_transport_type(message_type: &str, has_media: bool) -> Self {
        match message_type {
            "chat" => Self::Text,
            "image" | "video" | "document" | "sticker" => Self::Media,
            "ptt" | "audio" => Self::Voice,
            "vcard" | "multi_vcard" => Self::ContactCard,
            "call_log" => Self::Call,
            _ if has_media => Self::Media,
            _ => Self::Text,
        }
    }
}

/// Inbound message as handed to the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub source_instance: String,
    pub sender_address: String,
    pub body: String,
    pub message_id: String,
    /// Unix seconds, as reported by the transport
    pub timestamp: u64,
    pub kind: MessageKind,
}

/// Reply content: plain text or a structured payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundContent {
    Text(String),
    Structured(StructuredContent),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<MediaAttachment>,
    /// Send only the voice note, suppressing text
    #[serde(default, alias = "voiceOnly")]
    pub voice_only: bool,
}

impl OutboundContent {
    /// Transport sends in order: text first, then one attachment.
    ///
    /// Voice and media are exclusive; voice wins and media is dropped.
    pub fn to_payloads(&self) -> Vec<OutgoingPayload> {
        match self {
            Self::Text(text) if text.is_empty() => Vec::new(),
            Self::Text(text) => vec![OutgoingPayload::text(text.clone())],
            Self::Structured(content) => {
                let mut payloads = Vec::with_capacity(2);
                let voice_only = content.voice_only && content.voice.is_some();
                if !voice_only {
                    if let Some(text) = content.text.as_deref().filter(|t| !t.is_empty()) {
                        payloads.push(OutgoingPayload::text(text));
                    }
                }
                if let Some(voice) = &content.voice {
                    if content.media.is_some() {
                        tracing::warn!("Reply carries both voice and media; media dropped");
                    }
                    payloads.push(OutgoingPayload::Voice {
                        media: voice.clone(),
                    });
                } else if let Some(media) = &content.media {
                    payloads.push(OutgoingPayload::Media {
                        media: media.clone(),
                    });
                }
                payloads
            }
        }
    }
}

impl From<&str> for OutboundContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for OutboundContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<StructuredContent> for OutboundContent {
    fn from(content: StructuredContent) -> Self {
        Self::Structured(content)
    }
}

/// Conditions callers branch on.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("instance '{0}' not found")]
    NotFound(String),

    #[error("instance '{identity}' is not ready (status: {status})")]
    NotReady {
        identity: String,
        status: InstanceStatus,
    },

    #[error("a reconnect is already in progress for '{0}'")]
    ReconnectInProgress(String),

    #[error("a restart, disconnect, or session clear is in progress for '{0}'")]
    LifecycleInProgress(String),

    #[error("deduplication store unavailable")]
    DedupUnavailable,

    #[error("transport error: {0}")]
    Transport(String),
}
