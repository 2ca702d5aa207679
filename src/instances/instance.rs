use super::status::{transition, StatusTrigger};
use super::types::InstanceStatus;
use crate::health;
use crate::transport::{AccountInfo, TransportClient};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 32;

/// Lifecycle notifications published by an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    StatusChanged {
        from: InstanceStatus,
        to: InstanceStatus,
    },
    /// A new or refreshed auth challenge
    AuthArtifact(String),
}

#[derive(Debug)]
struct InstanceState {
    status: InstanceStatus,
    pending_auth_artifact: Option<String>,
    last_activity_at: DateTime<Utc>,
}

/// One managed transport connection.
///
/// Status only changes through [`Instance::apply`], which the instance's own
/// event loop drives.
pub struct Instance {
    identity: String,
    debug_port: u16,
    created_at: DateTime<Utc>,
    client: Arc<dyn TransportClient>,
    session_path: RwLock<PathBuf>,
    health_component: RwLock<String>,
    state: RwLock<InstanceState>,
    status_tx: watch::Sender<InstanceStatus>,
    events_tx: broadcast::Sender<InstanceEvent>,
    cancel: CancellationToken,
}

impl Instance {
    pub(crate) fn new(
        identity: String,
        session_path: PathBuf,
        debug_port: u16,
        client: Arc<dyn TransportClient>,
        health_component: String,
    ) -> Self {
        let now = Utc::now();
        let (status_tx, _) = watch::channel(InstanceStatus::Initializing);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        health::record_instance(&health_component, InstanceStatus::Initializing, None);
        Self {
            identity,
            debug_port,
            created_at: now,
            client,
            session_path: RwLock::new(session_path),
            health_component: RwLock::new(health_component),
            state: RwLock::new(InstanceState {
                status: InstanceStatus::Initializing,
                pending_auth_artifact: None,
                last_activity_at: now,
            }),
            status_tx,
            events_tx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn debug_port(&self) -> u16 {
        self.debug_port
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn session_path(&self) -> PathBuf {
        self.session_path.read().clone()
    }

    pub fn status(&self) -> InstanceStatus {
        self.state.read().status
    }

    pub fn is_ready(&self) -> bool {
        self.status() == InstanceStatus::Ready
    }

    /// Present only while `qr_pending`.
    pub fn pending_auth_artifact(&self) -> Option<String> {
        self.state.read().pending_auth_artifact.clone()
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.state.read().last_activity_at
    }

    pub fn account_info(&self) -> Option<AccountInfo> {
        self.client.info()
    }

    pub fn client(&self) -> Arc<dyn TransportClient> {
        self.client.clone()
    }

    /// Status updates, starting from the current value.
    pub fn watch_status(&self) -> watch::Receiver<InstanceStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events_tx.subscribe()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn set_session_path(&self, path: PathBuf) {
        *self.session_path.write() = path;
    }

    pub(crate) fn touch(&self) {
        self.state.write().last_activity_at = Utc::now();
    }

    /// Publish health under a new component name, dropping the old one.
    pub(crate) fn rename_health_component(&self, component: String) {
        let previous = std::mem::replace(&mut *self.health_component.write(), component);
        health::remove(&previous);
        self.record_health(self.status(), None);
    }

    pub(crate) fn health_component(&self) -> String {
        self.health_component.read().clone()
    }

    /// Apply a trigger. Returns `(from, to)` when it was accepted.
    pub(crate) fn apply(&self, trigger: &StatusTrigger) -> Option<(InstanceStatus, InstanceStatus)> {
        let (from, to) = {
            let mut state = self.state.write();
            let from = state.status;
            let to = transition(from, trigger)?;
            state.status = to;
            state.last_activity_at = Utc::now();
            if let StatusTrigger::Qr(code) = trigger {
                state.pending_auth_artifact = Some(code.clone());
            } else if to != InstanceStatus::QrPending {
                state.pending_auth_artifact = None;
            }
            (from, to)
        };

        if let StatusTrigger::Qr(code) = trigger {
            let _ = self.events_tx.send(InstanceEvent::AuthArtifact(code.clone()));
        }

        if from != to {
            self.status_tx.send_replace(to);
            let _ = self.events_tx.send(InstanceEvent::StatusChanged { from, to });
            tracing::info!("Instance {}: {from} -> {to}", self.identity);

            let reason = match trigger {
                StatusTrigger::Disconnected(reason) | StatusTrigger::InitializeFailed(reason) => {
                    Some(reason.as_str())
                }
                _ => None,
            };
            self.record_health(to, reason);
            if matches!(trigger, StatusTrigger::Reinitializing) {
                health::bump_restart(&self.health_component());
            }
            crate::status_events::emit(
                "instance.status",
                serde_json::json!({
                    "identity": self.identity,
                    "component": self.health_component(),
                    "from": from,
                    "to": to,
                    "reason": reason,
                }),
            );
        }
        Some((from, to))
    }

    fn record_health(&self, status: InstanceStatus, reason: Option<&str>) {
        health::record_instance(&self.health_component(), status, reason);
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("identity", &self.identity)
            .field("status", &self.status())
            .field("debug_port", &self.debug_port)
            .field("session_path", &self.session_path())
            .finish_non_exhaustive()
    }
}
