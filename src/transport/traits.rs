use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Value reported by `get_state` once the underlying connection is usable.
pub const STATE_CONNECTED: &str = "CONNECTED";

/// Raw message as delivered by a transport, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub timestamp: u64,
    /// Transport-native message type (`chat`, `image`, `ptt`, `vcard`, ...)
    #[serde(rename = "type", default = "default_message_type")]
    pub message_type: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub has_media: bool,
}

fn default_message_type() -> String {
    "chat".into()
}

/// Events emitted by a transport client, in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Authentication challenge (scannable pairing payload)
    Qr(String),
    Authenticated,
    Ready,
    Disconnected(String),
    /// Loading-screen progress reported while syncing after auth
    LoadingProgress { percent: u8, message: String },
    Message(RawMessage),
}

impl TransportEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Qr(_) => "qr",
            Self::Authenticated => "authenticated",
            Self::Ready => "ready",
            Self::Disconnected(_) => "disconnected",
            Self::LoadingProgress { .. } => "loading_progress",
            Self::Message(_) => "message",
        }
    }
}

/// Binary attachment sent alongside (or instead of) text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub mime_type: String,
    /// Base64-encoded payload
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// A single transport-level send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutgoingPayload {
    Text { text: String },
    Media { media: MediaAttachment },
    Voice { media: MediaAttachment },
}

impl OutgoingPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Read-only metadata about the connected account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub wid: String,
    #[serde(default)]
    pub pushname: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

/// Command surface of one transport connection.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Start (or restart) the connection. Events flow on the paired receiver.
    async fn initialize(&self) -> anyhow::Result<()>;

    /// Unlink the account from the transport.
    async fn logout(&self) -> anyhow::Result<()>;

    /// Release every resource backing this client.
    async fn destroy(&self) -> anyhow::Result<()>;

    /// Send one payload, returning the transport-assigned message id.
    async fn send_message(
        &self,
        recipient: &str,
        payload: &OutgoingPayload,
    ) -> anyhow::Result<String>;

    /// Transport's own view of the connection (e.g. `CONNECTED`).
    async fn get_state(&self) -> anyhow::Result<String>;

    /// Connected account metadata, once known.
    fn info(&self) -> Option<AccountInfo>;
}

/// Exclusive resources handed to a transport at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSpec {
    pub identity: String,
    pub session_path: PathBuf,
    pub debug_port: u16,
}

/// A freshly built client together with its event stream.
pub struct TransportHandle {
    pub client: Arc<dyn TransportClient>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Builds transport clients bound to a session path and debug port.
pub trait TransportFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, spec: &TransportSpec) -> anyhow::Result<TransportHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_message_defaults_missing_fields() {
        let raw: RawMessage =
            serde_json::from_str(r#"{"id":"ABC","from":"123@c.us"}"#).unwrap();
        assert_eq!(raw.message_type, "chat");
        assert_eq!(raw.body, "");
        assert!(!raw.from_me);
        assert!(!raw.has_media);
    }

    #[test]
    fn outgoing_payload_serializes_with_kind_tag() {
        let json = serde_json::to_value(OutgoingPayload::text("hi")).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["text"], "hi");
    }

    #[test]
    fn event_names_are_stable() {
        assert_eq!(TransportEvent::Qr("x".into()).name(), "qr");
        assert_eq!(TransportEvent::Ready.name(), "ready");
        assert_eq!(
            TransportEvent::LoadingProgress {
                percent: 100,
                message: String::new()
            }
            .name(),
            "loading_progress"
        );
    }
}
