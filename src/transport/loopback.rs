//! In-process transport with an external controller.
//!
//! Nothing leaves the process: events are injected through a
//! [`LoopbackController`] and sends are recorded for inspection. The daemon
//! uses it for `--dry-run`; the test suite uses it to script instance
//! lifecycles.

use super::traits::{
    AccountInfo, OutgoingPayload, RawMessage, TransportClient, TransportEvent, TransportFactory,
    TransportHandle, TransportSpec, STATE_CONNECTED,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

const EVENT_BUFFER: usize = 64;

/// A payload recorded by a loopback client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub recipient: String,
    pub payload: OutgoingPayload,
}

#[derive(Debug, Default)]
struct LoopbackState {
    sent: Vec<SentMessage>,
    state_reply: Option<String>,
    info: Option<AccountInfo>,
    fail_initialize: bool,
    fail_send: bool,
    fail_teardown: bool,
    initialize_calls: u32,
    logged_out: bool,
    destroyed: bool,
    next_message_id: u64,
}

/// Handle for driving one loopback client from the outside.
#[derive(Clone)]
pub struct LoopbackController {
    spec: TransportSpec,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackController {
    pub fn identity(&self) -> &str {
        &self.spec.identity
    }

    pub fn session_path(&self) -> &PathBuf {
        &self.spec.session_path
    }

    pub fn debug_port(&self) -> u16 {
        self.spec.debug_port
    }

    /// Inject a raw event as if the transport had emitted it.
    pub async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!(
                "Loopback {}: event dropped, receiver closed",
                self.spec.identity
            );
        }
    }

    pub async fn qr(&self, code: &str) {
        self.emit(TransportEvent::Qr(code.to_string())).await;
    }

    pub async fn authenticated(&self) {
        self.emit(TransportEvent::Authenticated).await;
    }

    pub async fn ready(&self) {
        self.emit(TransportEvent::Ready).await;
    }

    pub async fn disconnected(&self, reason: &str) {
        self.emit(TransportEvent::Disconnected(reason.to_string()))
            .await;
    }

    pub async fn loading(&self, percent: u8) {
        self.emit(TransportEvent::LoadingProgress {
            percent,
            message: "loading".into(),
        })
        .await;
    }

    /// Inject an inbound text message.
    pub async fn message(&self, id: &str, from: &str, body: &str) {
        self.emit(TransportEvent::Message(RawMessage {
            id: id.to_string(),
            from: from.to_string(),
            body: body.to_string(),
            timestamp: chrono::Utc::now().timestamp().max(0).unsigned_abs(),
            message_type: "chat".into(),
            from_me: false,
            has_media: false,
        }))
        .await;
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().sent.clone()
    }

    /// Script the value returned by `get_state`.
    pub fn set_state(&self, state: Option<&str>) {
        self.state.lock().state_reply = state.map(ToString::to_string);
    }

    pub fn set_info(&self, info: AccountInfo) {
        self.state.lock().info = Some(info);
    }

    pub fn fail_initialize(&self, fail: bool) {
        self.state.lock().fail_initialize = fail;
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().fail_send = fail;
    }

    /// Make `logout` and `destroy` return errors.
    pub fn fail_teardown(&self, fail: bool) {
        self.state.lock().fail_teardown = fail;
    }

    pub fn initialize_calls(&self) -> u32 {
        self.state.lock().initialize_calls
    }

    pub fn is_logged_out(&self) -> bool {
        self.state.lock().logged_out
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }
}

struct LoopbackClient {
    identity: String,
    state: Arc<Mutex<LoopbackState>>,
    events: mpsc::Sender<TransportEvent>,
    auto_ready: bool,
}

#[async_trait]
impl TransportClient for LoopbackClient {
    async fn initialize(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.initialize_calls += 1;
            if state.fail_initialize {
                bail!("loopback {}: initialize refused", self.identity);
            }
            state.destroyed = false;
        }
        if self.auto_ready {
            let _ = self.events.send(TransportEvent::Authenticated).await;
            let _ = self.events.send(TransportEvent::Ready).await;
        }
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_teardown {
            bail!("loopback {}: logout failed", self.identity);
        }
        state.logged_out = true;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_teardown {
            bail!("loopback {}: destroy failed", self.identity);
        }
        state.destroyed = true;
        Ok(())
    }

    async fn send_message(&self, recipient: &str, payload: &OutgoingPayload) -> Result<String> {
        let mut state = self.state.lock();
        if state.fail_send {
            bail!("loopback {}: send to {recipient} failed", self.identity);
        }
        if state.destroyed {
            bail!("loopback {}: client destroyed", self.identity);
        }
        state.next_message_id += 1;
        state.sent.push(SentMessage {
            recipient: recipient.to_string(),
            payload: payload.clone(),
        });
        Ok(format!("loopback-{}-{}", self.identity, state.next_message_id))
    }

    async fn get_state(&self) -> Result<String> {
        let state = self.state.lock();
        match &state.state_reply {
            Some(reply) => Ok(reply.clone()),
            None if self.auto_ready => Ok(STATE_CONNECTED.to_string()),
            None => Ok("OPENING".to_string()),
        }
    }

    fn info(&self) -> Option<AccountInfo> {
        self.state.lock().info.clone()
    }
}

/// Factory producing loopback clients and remembering their controllers.
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    auto_ready: bool,
    controllers: Arc<Mutex<HashMap<String, Vec<LoopbackController>>>>,
    fail_next: Arc<Mutex<Option<String>>>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clients authenticate and become ready as soon as they are initialized.
    pub fn auto_ready() -> Self {
        Self {
            auto_ready: true,
            ..Self::default()
        }
    }

    /// Controller of the most recently created client for `identity`.
    pub fn controller(&self, identity: &str) -> Option<LoopbackController> {
        self.controllers
            .lock()
            .get(identity)
            .and_then(|list| list.last().cloned())
    }

    /// Every controller created for `identity`, oldest first.
    pub fn controllers(&self, identity: &str) -> Vec<LoopbackController> {
        self.controllers
            .lock()
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }

    /// The next `create` call fails with `reason` instead of building a client.
    pub fn fail_next_create(&self, reason: &str) {
        *self.fail_next.lock() = Some(reason.to_string());
    }

    pub fn created_count(&self) -> usize {
        self.controllers.lock().values().map(Vec::len).sum()
    }
}

impl TransportFactory for LoopbackFactory {
    fn name(&self) -> &str {
        "loopback"
    }

    fn create(&self, spec: &TransportSpec) -> Result<TransportHandle> {
        if let Some(reason) = self.fail_next.lock().take() {
            bail!("loopback {}: {reason}", spec.identity);
        }
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let state = Arc::new(Mutex::new(LoopbackState {
            info: Some(AccountInfo {
                wid: format!("{}@c.us", spec.identity.trim_start_matches('+')),
                pushname: None,
                platform: Some("loopback".into()),
            }),
            ..LoopbackState::default()
        }));

        let controller = LoopbackController {
            spec: spec.clone(),
            events: tx.clone(),
            state: state.clone(),
        };
        self.controllers
            .lock()
            .entry(spec.identity.clone())
            .or_default()
            .push(controller);

        let client = LoopbackClient {
            identity: spec.identity.clone(),
            state,
            events: tx,
            auto_ready: self.auto_ready,
        };
        Ok(TransportHandle {
            client: Arc::new(client),
            events: rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(identity: &str) -> TransportSpec {
        TransportSpec {
            identity: identity.into(),
            session_path: PathBuf::from("/tmp/loopback-test"),
            debug_port: 9222,
        }
    }

    #[tokio::test]
    async fn loopback_records_sends() {
        let factory = LoopbackFactory::new();
        let handle = factory.create(&spec("100")).unwrap();
        handle
            .client
            .send_message("200@c.us", &OutgoingPayload::text("hello"))
            .await
            .unwrap();

        let sent = factory.controller("100").unwrap().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "200@c.us");
    }

    #[tokio::test]
    async fn loopback_teardown_failure_is_reported() {
        let factory = LoopbackFactory::new();
        let handle = factory.create(&spec("100")).unwrap();
        let controller = factory.controller("100").unwrap();
        controller.fail_teardown(true);

        assert!(handle.client.logout().await.is_err());
        assert!(handle.client.destroy().await.is_err());
        assert!(!controller.is_destroyed());
    }

    #[tokio::test]
    async fn auto_ready_emits_auth_then_ready() {
        let factory = LoopbackFactory::auto_ready();
        let mut handle = factory.create(&spec("100")).unwrap();
        handle.client.initialize().await.unwrap();

        assert!(matches!(
            handle.events.recv().await,
            Some(TransportEvent::Authenticated)
        ));
        assert!(matches!(handle.events.recv().await, Some(TransportEvent::Ready)));
        assert_eq!(handle.client.get_state().await.unwrap(), STATE_CONNECTED);
    }

    #[tokio::test]
    async fn controllers_are_kept_per_identity_in_creation_order() {
        let factory = LoopbackFactory::new();
        let _a = factory.create(&spec("100")).unwrap();
        let mut second = spec("100");
        second.debug_port = 9223;
        let _b = factory.create(&second).unwrap();

        let all = factory.controllers("100");
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].debug_port(), 9223);
        assert_eq!(factory.controller("100").unwrap().debug_port(), 9223);
        assert_eq!(factory.created_count(), 2);
    }
}
