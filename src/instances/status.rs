//! Status transitions.
//!
//! `transition` is the only place that decides how an instance's status
//! moves. It is pure so the rules can be checked without a transport.

use super::types::InstanceStatus;
use crate::config::StatusConfig;
use std::time::Duration;

/// What can move an instance's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusTrigger {
    /// Transport issued an auth challenge
    Qr(String),
    Authenticated,
    Ready,
    /// Readiness synthesized by a heuristic, not reported by the transport
    ForcedReady(ReadySource),
    Disconnected(String),
    /// Backoff elapsed, client is being re-initialized
    Reinitializing,
    InitializeFailed(String),
}

/// Which heuristic forced readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadySource {
    StatePoll,
    LoadingComplete,
}

impl ReadySource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StatePoll => "state poll",
            Self::LoadingComplete => "loading progress",
        }
    }
}

/// Next status, or `None` when the trigger does not apply in `current`.
pub fn transition(current: InstanceStatus, trigger: &StatusTrigger) -> Option<InstanceStatus> {
    use InstanceStatus as S;

    let next = match trigger {
        StatusTrigger::Qr(_) => match current {
            S::Failed => return None,
            _ => S::QrPending,
        },
        StatusTrigger::Authenticated => match current {
            S::Initializing | S::QrPending | S::Disconnected => S::Authenticated,
            _ => return None,
        },
        StatusTrigger::Ready => match current {
            S::Failed | S::Ready => return None,
            _ => S::Ready,
        },
        StatusTrigger::ForcedReady(_) => match current {
            S::Authenticated => S::Ready,
            _ => return None,
        },
        // Failed waits for an operator; a bridge exiting after an auth
        // failure must not restart the client
        StatusTrigger::Disconnected(_) => match current {
            S::Failed => return None,
            _ => S::Disconnected,
        },
        StatusTrigger::Reinitializing => match current {
            S::Disconnected => S::Initializing,
            _ => return None,
        },
        StatusTrigger::InitializeFailed(_) => S::Failed,
    };
    Some(next)
}

/// Timing policy for reconnect backoff and the forced-ready heuristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyWatchPolicy {
    pub disconnect_backoff: Duration,
    /// Wait after `authenticated` before polling the transport's own state
    pub ready_grace: Duration,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    /// Completed loading reports needed before forcing
    pub loading_complete_threshold: u32,
    pub loading_confirm_delay: Duration,
}

impl Default for ReadyWatchPolicy {
    fn default() -> Self {
        Self::from(&StatusConfig::default())
    }
}

impl From<&StatusConfig> for ReadyWatchPolicy {
    fn from(config: &StatusConfig) -> Self {
        Self {
            disconnect_backoff: Duration::from_secs(config.disconnect_backoff_secs),
            ready_grace: Duration::from_secs(config.ready_grace_secs),
            poll_interval: Duration::from_secs(config.ready_poll_interval_secs),
            poll_attempts: config.ready_poll_attempts,
            loading_complete_threshold: config.loading_complete_threshold.max(1),
            loading_confirm_delay: Duration::from_secs(config.loading_confirm_delay_secs),
        }
    }
}

/// Counts completed loading reports seen while authenticated.
#[derive(Debug, Default)]
pub struct LoadingTracker {
    completed: u32,
    armed: bool,
}

impl LoadingTracker {
    /// Feed one progress report. Returns `true` exactly once per
    /// authentication, when the confirmation timer should start.
    pub fn observe(&mut self, status: InstanceStatus, percent: u8, threshold: u32) -> bool {
        if status != InstanceStatus::Authenticated || percent < 100 || self.armed {
            return false;
        }
        self.completed += 1;
        if self.completed >= threshold {
            self.armed = true;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.completed = 0;
        self.armed = false;
    }
}
