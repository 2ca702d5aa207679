//! State of one hand-off, owned by the orchestrator for its duration.

use crate::instances::Instance;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPhase {
    AwaitingAuthArtifact,
    AwaitingReady,
    Migrating,
    Cleanup,
}

impl ReconnectPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingAuthArtifact => "awaiting_auth_artifact",
            Self::AwaitingReady => "awaiting_ready",
            Self::Migrating => "migrating",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for ReconnectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the candidate (or the migration) reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffInput {
    AuthArtifact,
    Ready,
    Migrated,
}

/// Next phase, or `None` if `input` means nothing in `phase`.
///
/// A restored session may reach `ready` without ever issuing a challenge.
pub fn next_phase(phase: ReconnectPhase, input: HandoffInput) -> Option<ReconnectPhase> {
    use HandoffInput as I;
    use ReconnectPhase as P;

    match (phase, input) {
        (P::AwaitingAuthArtifact | P::AwaitingReady, I::AuthArtifact) => Some(P::AwaitingReady),
        (P::AwaitingAuthArtifact | P::AwaitingReady, I::Ready) => Some(P::Migrating),
        (P::Migrating, I::Migrated) => Some(P::Cleanup),
        _ => None,
    }
}

pub struct ReconnectSession {
    pub identity: String,
    pub old_instance: Arc<Instance>,
    pub candidate: Arc<Instance>,
    pub notify_address: Option<String>,
    pub production_path: PathBuf,
    pub temporary_path: PathBuf,
    phase: ReconnectPhase,
    deadline: Option<Instant>,
    qr_forwards: u32,
}

impl ReconnectSession {
    pub fn new(
        old_instance: Arc<Instance>,
        candidate: Arc<Instance>,
        notify_address: Option<String>,
        production_path: PathBuf,
    ) -> Self {
        Self {
            identity: old_instance.identity().to_string(),
            temporary_path: candidate.session_path(),
            old_instance,
            candidate,
            notify_address,
            production_path,
            phase: ReconnectPhase::AwaitingAuthArtifact,
            deadline: None,
            qr_forwards: 0,
        }
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.phase
    }

    /// Apply `input`; returns the new phase when it changed.
    pub fn advance(&mut self, input: HandoffInput) -> Option<ReconnectPhase> {
        let next = next_phase(self.phase, input)?;
        if next == self.phase {
            return None;
        }
        tracing::info!(
            "Reconnect {}: {} -> {next}",
            self.identity,
            self.phase
        );
        self.phase = next;
        self.deadline = None;
        crate::status_events::emit(
            "reconnect.phase",
            serde_json::json!({
                "identity": self.identity,
                "phase": next,
                "candidate_port": self.candidate.debug_port(),
            }),
        );
        Some(next)
    }

    /// Deadline for the current phase, armed on first use after each phase
    /// change. Phases past `awaiting_ready` have no deadline.
    pub fn deadline(&mut self, handoff_timeout: Duration, scan_timeout: Duration) -> Option<Instant> {
        let window = match self.phase {
            ReconnectPhase::AwaitingAuthArtifact => handoff_timeout,
            ReconnectPhase::AwaitingReady => scan_timeout,
            ReconnectPhase::Migrating | ReconnectPhase::Cleanup => return None,
        };
        Some(*self.deadline.get_or_insert_with(|| Instant::now() + window))
    }

    /// Count one forwarded pairing code; `false` once the cap is reached.
    pub fn take_qr_forward(&mut self, max_forwards: u32) -> bool {
        if self.qr_forwards >= max_forwards {
            return false;
        }
        self.qr_forwards += 1;
        true
    }

    pub fn qr_forwards(&self) -> u32 {
        self.qr_forwards
    }
}
