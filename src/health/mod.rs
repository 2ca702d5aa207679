//! Process-wide component health, published in the daemon state file.
//!
//! Components are named `daemon`, `dedup-sweeper`, `instance:<identity>`
//! and, during a hand-off, `reconnect:<identity>` for the candidate.

use crate::instances::InstanceStatus;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// `ok`, `error`, or an instance status such as `qr_pending`
    pub status: String,
    pub updated_at: String,
    pub last_ok: Option<String>,
    pub last_error: Option<String>,
    pub restart_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub pid: u32,
    pub updated_at: String,
    pub uptime_seconds: u64,
    pub components: BTreeMap<String, ComponentHealth>,
}

struct Board {
    started_at: Instant,
    components: Mutex<BTreeMap<String, ComponentHealth>>,
}

static BOARD: OnceLock<Board> = OnceLock::new();

fn board() -> &'static Board {
    BOARD.get_or_init(|| Board {
        started_at: Instant::now(),
        components: Mutex::new(BTreeMap::new()),
    })
}

fn update(component: &str, apply: impl FnOnce(&mut ComponentHealth, &str)) {
    let now = Utc::now().to_rfc3339();
    let mut components = board().components.lock();
    let entry = components
        .entry(component.to_string())
        .or_insert_with(|| ComponentHealth {
            status: "starting".into(),
            updated_at: now.clone(),
            last_ok: None,
            last_error: None,
            restart_count: 0,
        });
    apply(entry, &now);
    entry.updated_at = now;
}

pub fn mark_ok(component: &str) {
    update(component, |entry, now| {
        entry.status = "ok".into();
        entry.last_ok = Some(now.to_string());
        entry.last_error = None;
    });
}

pub fn mark_error(component: &str, error: impl Into<String>) {
    let error = error.into();
    update(component, move |entry, _| {
        entry.status = "error".into();
        entry.last_error = Some(error);
    });
}

/// Mirror an instance status: `ready` is healthy, `disconnected` and
/// `failed` are errors, anything else is shown by name.
pub fn record_instance(component: &str, status: InstanceStatus, reason: Option<&str>) {
    match status {
        InstanceStatus::Ready => mark_ok(component),
        InstanceStatus::Disconnected | InstanceStatus::Failed => mark_error(
            component,
            format!("{status}: {}", reason.unwrap_or("no reason given")),
        ),
        other => update(component, |entry, _| entry.status = other.as_str().into()),
    }
}

pub fn bump_restart(component: &str) {
    update(component, |entry, _| {
        entry.restart_count = entry.restart_count.saturating_add(1);
    });
}

pub fn remove(component: &str) {
    board().components.lock().remove(component);
}

pub fn snapshot() -> HealthSnapshot {
    HealthSnapshot {
        pid: std::process::id(),
        updated_at: Utc::now().to_rfc3339(),
        uptime_seconds: board().started_at.elapsed().as_secs(),
        components: board().components.lock().clone(),
    }
}

pub fn snapshot_json() -> serde_json::Value {
    serde_json::to_value(snapshot()).unwrap_or_else(|e| {
        serde_json::json!({
            "status": "error",
            "message": format!("health snapshot not serializable: {e}"),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_clears_last_error() {
        mark_error("test:ok-clears", "boom");
        mark_ok("test:ok-clears");
        let snap = snapshot();
        let c = &snap.components["test:ok-clears"];
        assert_eq!(c.status, "ok");
        assert!(c.last_error.is_none());
        assert!(c.last_ok.is_some());
    }

    #[test]
    fn restarts_accumulate() {
        bump_restart("test:restarts");
        bump_restart("test:restarts");
        assert_eq!(snapshot().components["test:restarts"].restart_count, 2);
    }

    #[test]
    fn instance_statuses_map_to_health() {
        record_instance("test:instance", InstanceStatus::QrPending, None);
        assert_eq!(snapshot().components["test:instance"].status, "qr_pending");

        record_instance("test:instance", InstanceStatus::Failed, Some("auth rejected"));
        let c = &snapshot().components["test:instance"];
        assert_eq!(c.status, "error");
        assert_eq!(c.last_error.as_deref(), Some("failed: auth rejected"));

        remove("test:instance");
        assert!(!snapshot().components.contains_key("test:instance"));
    }

    #[test]
    fn snapshot_json_has_pid() {
        let json = snapshot_json();
        assert_eq!(json["pid"], std::process::id());
    }
}
