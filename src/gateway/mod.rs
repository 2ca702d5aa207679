//! Operational surface over the registry, router, and orchestrator.
//!
//! This is what the daemon and any admin layer drive; nothing here touches
//! instance status directly.

use crate::config::Config;
use crate::dedup::{DedupPolicy, MessageDeduplicator};
use crate::instances::{
    GatewayError, Instance, InstanceRegistry, InstanceStatus, OutboundContent, RegistryOptions,
};
use crate::kv::KvStore;
use crate::processor::Processor;
use crate::reconnect::{HandoffOutcome, ReconnectOrchestrator, ReconnectPolicy};
use crate::router::{BroadcastOutcome, MessageRouter};
use crate::transport::{AccountInfo, TransportFactory};
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// One row of `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatusView {
    pub identity: String,
    pub connected: bool,
    pub status: InstanceStatus,
    pub account: Option<AccountInfo>,
    pub session_path: PathBuf,
    pub debug_port: u16,
    pub created_at: String,
    pub last_activity_at: String,
    pub reconnecting: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayMetrics {
    pub total: usize,
    pub ready: usize,
    pub disconnected: usize,
    pub failed: usize,
}

pub struct Gateway {
    registry: Arc<InstanceRegistry>,
    router: Arc<MessageRouter>,
    orchestrator: Arc<ReconnectOrchestrator>,
    admin_addresses: HashMap<String, String>,
}

impl Gateway {
    /// Wire registry, deduplicator, router, and orchestrator together.
    pub fn build(
        config: &Config,
        factory: Arc<dyn TransportFactory>,
        store: Arc<dyn KvStore>,
        processor: Arc<dyn Processor>,
    ) -> Arc<Self> {
        let registry = Arc::new(InstanceRegistry::new(factory, RegistryOptions::from(config)));
        let dedup = Arc::new(MessageDeduplicator::new(
            store,
            DedupPolicy::from(&config.dedup),
        ));
        let router = Arc::new(MessageRouter::new(registry.clone(), dedup, processor));
        router.attach();
        let orchestrator = Arc::new(ReconnectOrchestrator::new(
            registry.clone(),
            router.clone(),
            ReconnectPolicy::from(&config.reconnect),
        ));
        let admin_addresses = config
            .instances
            .iter()
            .filter_map(|i| {
                i.admin_address
                    .as_ref()
                    .map(|addr| (i.identity.clone(), addr.clone()))
            })
            .collect();

        Arc::new(Self {
            registry,
            router,
            orchestrator,
            admin_addresses,
        })
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn orchestrator(&self) -> &Arc<ReconnectOrchestrator> {
        &self.orchestrator
    }

    pub async fn start_instance(
        &self,
        identity: &str,
        session_path: Option<PathBuf>,
    ) -> Result<Arc<Instance>> {
        self.registry.create_instance(identity, session_path).await
    }

    pub fn get_status(&self) -> Vec<InstanceStatusView> {
        self.registry
            .list()
            .into_iter()
            .map(|instance| {
                let status = instance.status();
                InstanceStatusView {
                    identity: instance.identity().to_string(),
                    connected: status == InstanceStatus::Ready,
                    status,
                    account: instance.account_info(),
                    session_path: instance.session_path(),
                    debug_port: instance.debug_port(),
                    created_at: instance.created_at().to_rfc3339(),
                    last_activity_at: instance.last_activity_at().to_rfc3339(),
                    reconnecting: self.orchestrator.is_in_progress(instance.identity()),
                }
            })
            .collect()
    }

    pub fn get_metrics(&self) -> GatewayMetrics {
        let mut metrics = GatewayMetrics::default();
        for instance in self.registry.list() {
            metrics.total += 1;
            match instance.status() {
                InstanceStatus::Ready => metrics.ready += 1,
                InstanceStatus::Disconnected => metrics.disconnected += 1,
                InstanceStatus::Failed => metrics.failed += 1,
                _ => {}
            }
        }
        metrics
    }

    /// Stop an instance. With `logout`, the account is unlinked as well;
    /// without it the session stays on disk for a later start.
    pub async fn disconnect(&self, identity: &str, logout: bool) -> Result<()> {
        let _slot = self.orchestrator.hold_lifecycle(identity)?;
        if !self.registry.remove_with(identity, logout).await {
            return Err(GatewayError::NotFound(identity.to_string()).into());
        }
        Ok(())
    }

    /// Log out, remove the instance if present, and delete its session
    /// directory so the next start pairs from scratch.
    pub async fn clear_session(&self, identity: &str) -> Result<()> {
        let _slot = self.orchestrator.hold_lifecycle(identity)?;
        let session_path = self
            .registry
            .get_instance(identity)
            .map_or_else(|| self.registry.default_session_path(identity), |i| i.session_path());
        self.registry.remove_instance(identity).await;

        match tokio::fs::remove_dir_all(&session_path).await {
            Ok(()) => {
                tracing::info!(
                    "Instance {identity}: session cleared ({})",
                    session_path.display()
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context(format!(
                "Failed to delete session directory {}",
                session_path.display()
            ))),
        }
    }

    pub async fn restart_instance(&self, identity: &str) -> Result<Arc<Instance>> {
        let _slot = self.orchestrator.hold_lifecycle(identity)?;
        self.registry.restart_instance(identity).await
    }

    /// Start a hot reconnect. Without an explicit address, the instance's
    /// configured admin address (if any) receives notices and codes.
    pub fn prepare_reconnect(
        &self,
        identity: &str,
        notify_address: Option<String>,
    ) -> Result<JoinHandle<HandoffOutcome>, GatewayError> {
        let notify = notify_address.or_else(|| self.admin_addresses.get(identity).cloned());
        self.orchestrator.prepare_reconnect(identity, notify)
    }

    pub async fn send_message(
        &self,
        identity: &str,
        recipient: &str,
        content: &OutboundContent,
    ) -> bool {
        self.router.send_message(identity, recipient, content).await
    }

    pub async fn broadcast(
        &self,
        recipient: &str,
        content: &OutboundContent,
    ) -> Vec<BroadcastOutcome> {
        self.router.broadcast(recipient, content).await
    }

    /// Persisted deduplication keys matching a glob pattern.
    pub async fn search_dedup(&self, pattern: &str) -> Result<Vec<String>> {
        self.router.dedup().search(pattern).await
    }

    /// Snapshot written to the daemon state file.
    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::json!({
            "metrics": self.get_metrics(),
            "instances": self.get_status(),
            "runtime": crate::health::snapshot_json(),
        })
    }

    /// Tear down every instance without logging out.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
