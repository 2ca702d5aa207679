//! Hot reconnect: replace an instance's connection with a freshly paired
//! one while the old connection keeps serving.
//!
//! The candidate runs on a temporary session path and is only registered
//! once it reports ready. Until then a failure or timeout discards the
//! candidate and leaves the old instance untouched.

pub mod qr;
pub mod session;

pub use session::{next_phase, HandoffInput, ReconnectPhase, ReconnectSession};

use crate::config::ReconnectConfig;
use crate::instances::{GatewayError, Instance, InstanceEvent, InstanceRegistry, InstanceStatus};
use crate::instances::OutboundContent;
use crate::router::MessageRouter;
use crate::transport::OutgoingPayload;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Timing policy for hand-offs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Window for the candidate's first challenge or readiness
    pub handoff_timeout: Duration,
    /// Window for a delivered challenge to be scanned
    pub scan_timeout: Duration,
    pub stabilization_delay: Duration,
    pub old_client_grace: Duration,
    pub max_qr_forwards: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            handoff_timeout: Duration::from_secs(config.handoff_timeout_secs),
            scan_timeout: Duration::from_secs(config.scan_timeout_secs),
            stabilization_delay: Duration::from_secs(config.stabilization_delay_secs),
            old_client_grace: Duration::from_secs(config.old_client_grace_secs),
            max_qr_forwards: config.max_qr_forwards,
        }
    }
}

/// How a hand-off ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffOutcome {
    Completed {
        session_path: PathBuf,
        /// Whether the session directory reached the production path
        migrated: bool,
    },
    /// Rolled back; the old instance was not touched
    TimedOut { phase: ReconnectPhase },
    Aborted { reason: String },
}

pub struct ReconnectOrchestrator {
    registry: Arc<InstanceRegistry>,
    router: Arc<MessageRouter>,
    policy: ReconnectPolicy,
    slots: SlotMap,
}

/// What currently holds an identity. A hand-off excludes everything else;
/// lifecycle operations only exclude hand-offs and serialize among
/// themselves on the registry's identity lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Handoff,
    Lifecycle(usize),
}

type SlotMap = Arc<Mutex<HashMap<String, Slot>>>;

/// Releases an identity slot when dropped.
#[must_use = "the slot is released when the guard is dropped"]
pub(crate) struct SlotGuard {
    identity: String,
    slots: SlotMap,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        match slots.get_mut(&self.identity) {
            Some(Slot::Lifecycle(holders)) if *holders > 1 => *holders -= 1,
            _ => {
                slots.remove(&self.identity);
            }
        }
    }
}

fn temporary_session_path(production: &Path) -> PathBuf {
    let name = production
        .file_name()
        .map_or_else(|| "session".to_string(), |n| n.to_string_lossy().into_owned());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    production.with_file_name(format!("{name}.reconnect-{}", &suffix[..8]))
}

async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl ReconnectOrchestrator {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        router: Arc<MessageRouter>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            registry,
            router,
            policy,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn is_in_progress(&self, identity: &str) -> bool {
        self.slots.lock().get(identity) == Some(&Slot::Handoff)
    }

    /// Keep hand-offs away from `identity` while the guard lives.
    pub(crate) fn hold_lifecycle(&self, identity: &str) -> Result<SlotGuard, GatewayError> {
        let mut slots = self.slots.lock();
        match slots.get_mut(identity) {
            Some(Slot::Handoff) => {
                return Err(GatewayError::ReconnectInProgress(identity.to_string()));
            }
            Some(Slot::Lifecycle(holders)) => *holders += 1,
            None => {
                slots.insert(identity.to_string(), Slot::Lifecycle(1));
            }
        }
        Ok(SlotGuard {
            identity: identity.to_string(),
            slots: self.slots.clone(),
        })
    }

    fn hold_handoff(&self, identity: &str) -> Result<SlotGuard, GatewayError> {
        let mut slots = self.slots.lock();
        match slots.get(identity) {
            Some(Slot::Handoff) => Err(GatewayError::ReconnectInProgress(identity.to_string())),
            Some(Slot::Lifecycle(_)) => {
                Err(GatewayError::LifecycleInProgress(identity.to_string()))
            }
            None => {
                slots.insert(identity.to_string(), Slot::Handoff);
                Ok(SlotGuard {
                    identity: identity.to_string(),
                    slots: self.slots.clone(),
                })
            }
        }
    }

    /// Start a hand-off for `identity`. Runs in the background; the handle
    /// resolves once the hand-off completes, times out, or aborts.
    pub fn prepare_reconnect(
        self: &Arc<Self>,
        identity: &str,
        notify_address: Option<String>,
    ) -> Result<JoinHandle<HandoffOutcome>, GatewayError> {
        // Claimed before the lookup so a restart cannot slip in between
        let guard = self.hold_handoff(identity)?;
        let old = self
            .registry
            .get_instance(identity)
            .ok_or_else(|| GatewayError::NotFound(identity.to_string()))?;

        let this = self.clone();
        Ok(tokio::spawn(async move {
            let outcome = this.run(old, notify_address).await;
            drop(guard);
            outcome
        }))
    }

    async fn notify(&self, via_identity: &str, address: Option<&str>, text: String) {
        let Some(address) = address else {
            return;
        };
        if !self
            .router
            .send_message(via_identity, address, &OutboundContent::Text(text))
            .await
        {
            tracing::warn!("Reconnect {via_identity}: could not notify {address}");
        }
    }

    async fn run(&self, old: Arc<Instance>, notify_address: Option<String>) -> HandoffOutcome {
        let identity = old.identity().to_string();
        let production_path = old.session_path();
        tracing::info!(
            "Reconnect {identity}: starting hand-off (serving port {})",
            old.debug_port()
        );

        self.notify(
            &identity,
            notify_address.as_deref(),
            "Reconnect started. A pairing code for the new session will follow.".into(),
        )
        .await;

        let temporary_path = temporary_session_path(&production_path);
        let (candidate, events) = match self.registry.spawn_candidate(&identity, temporary_path.clone()) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!("Reconnect {identity}: candidate could not be started: {e:#}");
                let _ = remove_dir_if_exists(&temporary_path).await;
                return HandoffOutcome::Aborted {
                    reason: format!("{e:#}"),
                };
            }
        };

        let mut session = ReconnectSession::new(old, candidate, notify_address, production_path);
        if let Err(outcome) = self.await_ready(&mut session, events).await {
            self.roll_back(&session).await;
            return outcome;
        }

        self.complete(session).await
    }

    /// Wait for the candidate to become ready, forwarding challenges
    /// through the old instance meanwhile.
    async fn await_ready(
        &self,
        session: &mut ReconnectSession,
        mut events: tokio::sync::broadcast::Receiver<InstanceEvent>,
    ) -> Result<(), HandoffOutcome> {
        loop {
            let Some(deadline) =
                session.deadline(self.policy.handoff_timeout, self.policy.scan_timeout)
            else {
                return Ok(());
            };

            let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => {
                    tracing::warn!(
                        "Reconnect {}: timed out in {}, keeping the current session",
                        session.identity,
                        session.phase()
                    );
                    return Err(HandoffOutcome::TimedOut {
                        phase: session.phase(),
                    });
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    tracing::debug!("Reconnect {}: skipped {skipped} events", session.identity);
                    if session.candidate.is_ready() {
                        session.advance(HandoffInput::Ready);
                    }
                    continue;
                }
                Ok(Err(RecvError::Closed)) => {
                    return Err(HandoffOutcome::Aborted {
                        reason: "candidate event stream closed".into(),
                    });
                }
                Ok(Ok(event)) => event,
            };

            match event {
                InstanceEvent::AuthArtifact(code) => {
                    session.advance(HandoffInput::AuthArtifact);
                    self.forward_artifact(session, &code).await;
                }
                InstanceEvent::StatusChanged {
                    to: InstanceStatus::Ready,
                    ..
                } => {
                    session.advance(HandoffInput::Ready);
                }
                InstanceEvent::StatusChanged {
                    to: InstanceStatus::Failed,
                    ..
                } => {
                    return Err(HandoffOutcome::Aborted {
                        reason: "candidate failed to initialize".into(),
                    });
                }
                InstanceEvent::StatusChanged { .. } => {}
            }
        }
    }

    async fn forward_artifact(&self, session: &mut ReconnectSession, code: &str) {
        let Some(address) = session.notify_address.clone() else {
            tracing::info!(
                "Reconnect {}: pairing code issued, no notify address to deliver it to",
                session.identity
            );
            return;
        };
        if !session.take_qr_forward(self.policy.max_qr_forwards) {
            tracing::debug!(
                "Reconnect {}: pairing code refresh not forwarded (limit {})",
                session.identity,
                self.policy.max_qr_forwards
            );
            return;
        }

        let caption = format!(
            "Scan to link {} ({}/{})",
            session.identity,
            session.qr_forwards(),
            self.policy.max_qr_forwards
        );
        let media = match qr::qr_attachment(code, Some(caption)) {
            Ok(media) => media,
            Err(e) => {
                tracing::error!("Reconnect {}: QR rendering failed: {e:#}", session.identity);
                return;
            }
        };
        let payload = OutgoingPayload::Media { media };

        // The old instance is the one a human is watching
        let old = session.old_instance.clone();
        let sent = match old.client().send_message(&address, &payload).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    "Reconnect {}: pairing code delivery via old instance failed: {e:#}",
                    session.identity
                );
                false
            }
        };
        if sent {
            tracing::info!("Reconnect {}: pairing code sent to {address}", session.identity);
        }
    }

    async fn roll_back(&self, session: &ReconnectSession) {
        self.registry.discard(&session.candidate).await;
        if let Err(e) = remove_dir_if_exists(&session.temporary_path).await {
            tracing::warn!(
                "Reconnect {}: could not remove {}: {e}",
                session.identity,
                session.temporary_path.display()
            );
        }
        crate::status_events::emit(
            "reconnect.phase",
            serde_json::json!({
                "identity": session.identity,
                "phase": "rolled_back",
                "from": session.phase(),
            }),
        );
        self.notify(
            &session.identity,
            session.notify_address.as_deref(),
            "Reconnect did not complete. The current session is unchanged.".into(),
        )
        .await;
    }

    async fn complete(&self, mut session: ReconnectSession) -> HandoffOutcome {
        let identity = session.identity.clone();
        let replaced = self.registry.swap_in(session.candidate.clone()).await;
        tracing::info!(
            "Reconnect {identity}: candidate on port {} is now active",
            session.candidate.debug_port()
        );

        tokio::time::sleep(self.policy.stabilization_delay).await;
        self.notify(
            &identity,
            session.notify_address.as_deref(),
            "Reconnect complete. This number is now served by the new session.".into(),
        )
        .await;

        // Give in-flight sends on the old client time to finish
        tokio::time::sleep(self.policy.old_client_grace).await;
        if let Some(old) = replaced {
            tracing::info!(
                "Reconnect {identity}: destroying replaced client (port {})",
                old.debug_port()
            );
            self.registry.discard(&old).await;
        }

        let migrated = self.migrate(&session).await;
        if migrated {
            session.candidate.set_session_path(session.production_path.clone());
        }
        session.advance(HandoffInput::Migrated);

        HandoffOutcome::Completed {
            session_path: session.candidate.session_path(),
            migrated,
        }
    }

    /// Move the candidate's session directory onto the production path.
    async fn migrate(&self, session: &ReconnectSession) -> bool {
        let identity = &session.identity;
        // Never drop the production session unless there is one to replace it
        if !tokio::fs::try_exists(&session.temporary_path)
            .await
            .unwrap_or(false)
        {
            tracing::warn!(
                "Reconnect {identity}: candidate wrote no session at {}, nothing to migrate",
                session.temporary_path.display()
            );
            return false;
        }
        if let Err(e) = remove_dir_if_exists(&session.production_path).await {
            tracing::error!(
                "Reconnect {identity}: could not remove old session {}: {e}",
                session.production_path.display()
            );
            return false;
        }
        match tokio::fs::rename(&session.temporary_path, &session.production_path).await {
            Ok(()) => {
                tracing::info!(
                    "Reconnect {identity}: session migrated to {}",
                    session.production_path.display()
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    "Reconnect {identity}: could not move {} to {}: {e}",
                    session.temporary_path.display(),
                    session.production_path.display()
                );
                false
            }
        }
    }
}
