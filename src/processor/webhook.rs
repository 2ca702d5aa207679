use super::traits::Processor;
use crate::instances::{InboundEnvelope, OutboundContent};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

const MAX_ERROR_EXCERPT: usize = 240;

/// Posts each envelope as JSON and reads the reply from the response body.
///
/// `204`, an empty body, or JSON `null` mean no reply. A JSON string is plain
/// text; a JSON object is a structured reply.
pub struct WebhookProcessor {
    url: String,
    client: Client,
}

impl WebhookProcessor {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn excerpt(body: &[u8]) -> String {
    let raw = String::from_utf8_lossy(body);
    let trimmed = raw.trim();
    match trimmed.char_indices().nth(MAX_ERROR_EXCERPT) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Interpret a successful response body.
pub fn parse_reply(body: &[u8]) -> anyhow::Result<Option<OutboundContent>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| anyhow::anyhow!("Processor reply is not JSON: {e}; body: {}", excerpt(body)))?;
    if value.is_null() {
        return Ok(None);
    }
    let content: OutboundContent = serde_json::from_value(value)
        .map_err(|e| anyhow::anyhow!("Processor reply has an unexpected shape: {e}"))?;
    Ok(Some(content))
}

#[async_trait]
impl Processor for WebhookProcessor {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn process(&self, envelope: &InboundEnvelope) -> anyhow::Result<Option<OutboundContent>> {
        tracing::debug!(
            "Webhook request: url={} instance={} message={}",
            self.url,
            envelope.source_instance,
            envelope.message_id
        );

        let response = self.client.post(&self.url).json(envelope).send().await?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let body = response.bytes().await?;
        if !status.is_success() {
            tracing::error!(
                "Webhook error response: status={status} body_excerpt={}",
                excerpt(&body)
            );
            anyhow::bail!("Processor webhook returned {status}");
        }
        parse_reply(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::StructuredContent;

    #[test]
    fn empty_and_null_bodies_mean_no_reply() {
        assert!(parse_reply(b"").unwrap().is_none());
        assert!(parse_reply(b"  \n").unwrap().is_none());
        assert!(parse_reply(b"null").unwrap().is_none());
    }

    #[test]
    fn string_body_is_text() {
        assert_eq!(
            parse_reply(br#""pong""#).unwrap(),
            Some(OutboundContent::Text("pong".into()))
        );
    }

    #[test]
    fn object_body_is_structured() {
        let reply = parse_reply(br#"{"text":"hi","voice_only":false}"#).unwrap();
        assert_eq!(
            reply,
            Some(OutboundContent::Structured(StructuredContent {
                text: Some("hi".into()),
                ..StructuredContent::default()
            }))
        );
    }

    #[test]
    fn non_json_body_is_an_error() {
        let err = parse_reply(b"<html>oops</html>").unwrap_err();
        assert!(err.to_string().contains("not JSON"));
    }

    #[test]
    fn excerpt_truncates_long_bodies() {
        let long = "x".repeat(1000);
        let cut = excerpt(long.as_bytes());
        assert!(cut.ends_with("..."));
        assert!(cut.len() < 300);
    }
}
