use super::event_loop;
use super::instance::{Instance, InstanceEvent};
use super::status::ReadyWatchPolicy;
use super::types::GatewayError;
use super::{InboundHandler, InboundSink};
use crate::config::Config;
use crate::health;
use crate::transport::{TransportFactory, TransportSpec};
use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedMutexGuard};

/// Construction options for [`InstanceRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub sessions_dir: PathBuf,
    pub debug_port_base: u16,
    pub restart_settle: Duration,
    pub ready_watch: ReadyWatchPolicy,
}

impl From<&Config> for RegistryOptions {
    fn from(config: &Config) -> Self {
        Self {
            sessions_dir: config.gateway.sessions_dir.clone(),
            debug_port_base: config.gateway.debug_port_base,
            restart_settle: Duration::from_secs(config.gateway.restart_settle_secs),
            ready_watch: ReadyWatchPolicy::from(&config.status),
        }
    }
}

/// Owns every live instance, keyed by identity.
///
/// Mutations for one identity are serialized through a per-identity async
/// mutex; different identities proceed in parallel. Debug ports come from a
/// monotonic counter and are never handed out twice in a process lifetime.
pub struct InstanceRegistry {
    instances: RwLock<HashMap<String, Arc<Instance>>>,
    identity_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_port: AtomicU16,
    factory: Arc<dyn TransportFactory>,
    options: RegistryOptions,
    inbound: InboundSink,
}

impl InstanceRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>, options: RegistryOptions) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            identity_locks: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(options.debug_port_base),
            factory,
            options,
            inbound: Arc::new(RwLock::new(None)),
        }
    }

    /// Route inbound messages from every instance to `handler`.
    /// Held weakly; dropping the handler stops delivery.
    pub fn set_inbound_handler(&self, handler: &Arc<dyn InboundHandler>) {
        *self.inbound.write() = Some(Arc::downgrade(handler));
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.options.sessions_dir
    }

    pub fn default_session_path(&self, identity: &str) -> PathBuf {
        self.options.sessions_dir.join(identity)
    }

    pub fn ready_watch_policy(&self) -> &ReadyWatchPolicy {
        &self.options.ready_watch
    }

    /// Serialize lifecycle operations for one identity.
    pub async fn lock_identity(&self, identity: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .identity_locks
            .lock()
            .entry(identity.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    fn allocate_port(&self) -> u16 {
        self.next_port.fetch_add(1, Ordering::SeqCst)
    }

    /// Build an instance and start its event loop. The returned receiver is
    /// subscribed before the client is initialized, so no event is missed.
    fn launch(
        &self,
        identity: &str,
        session_path: PathBuf,
        health_component: String,
    ) -> Result<(Arc<Instance>, broadcast::Receiver<InstanceEvent>)> {
        let spec = TransportSpec {
            identity: identity.to_string(),
            session_path: session_path.clone(),
            debug_port: self.allocate_port(),
        };
        let handle = self.factory.create(&spec)?;
        let instance = Arc::new(Instance::new(
            spec.identity,
            session_path,
            spec.debug_port,
            handle.client,
            health_component,
        ));
        let events = instance.subscribe();
        event_loop::spawn(
            instance.clone(),
            handle.events,
            self.inbound.clone(),
            self.options.ready_watch.clone(),
        );
        Ok((instance, events))
    }

    /// Create and initialize an instance. Idempotent: an identity that is
    /// already registered yields the existing record.
    pub async fn create_instance(
        &self,
        identity: &str,
        session_path: Option<PathBuf>,
    ) -> Result<Arc<Instance>> {
        let _guard = self.lock_identity(identity).await;

        if let Some(existing) = self.get_instance(identity) {
            tracing::debug!("Instance {identity}: already registered, returning existing");
            return Ok(existing);
        }

        let session_path = session_path.unwrap_or_else(|| self.default_session_path(identity));
        let (instance, _) = self.launch(identity, session_path, format!("instance:{identity}"))?;
        self.instances
            .write()
            .insert(identity.to_string(), instance.clone());

        tracing::info!(
            "Instance {identity}: created (session: {}, debug port: {})",
            instance.session_path().display(),
            instance.debug_port()
        );
        Ok(instance)
    }

    pub fn get_instance(&self, identity: &str) -> Option<Arc<Instance>> {
        self.instances.read().get(identity).cloned()
    }

    /// All instances, oldest first (ties broken by identity).
    pub fn list(&self) -> Vec<Arc<Instance>> {
        let mut all: Vec<_> = self.instances.read().values().cloned().collect();
        all.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.identity().cmp(b.identity()))
        });
        all
    }

    pub fn ready_instances(&self) -> Vec<Arc<Instance>> {
        self.list().into_iter().filter(|i| i.is_ready()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Log out, destroy, and unregister. The entry is always removed, even
    /// when the client fails to tear down. Returns whether it existed.
    pub async fn remove_instance(&self, identity: &str) -> bool {
        self.remove_with(identity, true).await
    }

    /// Like [`remove_instance`](Self::remove_instance), optionally keeping
    /// the account linked (no logout).
    pub async fn remove_with(&self, identity: &str, logout: bool) -> bool {
        let _guard = self.lock_identity(identity).await;
        let Some(instance) = self.instances.write().remove(identity) else {
            return false;
        };
        teardown(&instance, logout).await;
        health::remove(&instance.health_component());
        tracing::info!("Instance {identity}: removed");
        true
    }

    /// Tear down and re-create an instance on the same session path.
    pub async fn restart_instance(&self, identity: &str) -> Result<Arc<Instance>> {
        let session_path = self
            .get_instance(identity)
            .map(|i| i.session_path())
            .ok_or_else(|| GatewayError::NotFound(identity.to_string()))?;

        // Logging out would unlink the session we are about to reuse
        self.remove_with(identity, false).await;
        tokio::time::sleep(self.options.restart_settle).await;
        let instance = self.create_instance(identity, Some(session_path)).await?;
        health::bump_restart(&instance.health_component());
        Ok(instance)
    }

    /// Tear down every instance concurrently, without logging out.
    pub async fn shutdown(&self) {
        let all: Vec<_> = self.instances.write().drain().map(|(_, i)| i).collect();
        if all.is_empty() {
            return;
        }
        tracing::info!("Shutting down {} instance(s)", all.len());
        futures_util::future::join_all(all.iter().map(|i| teardown(i, false))).await;
    }

    // ── Hand-off support ─────────────────────────────────────────

    /// Start an instance that is not registered. Its events are delivered
    /// on the returned receiver from the first one.
    pub fn spawn_candidate(
        &self,
        identity: &str,
        session_path: PathBuf,
    ) -> Result<(Arc<Instance>, broadcast::Receiver<InstanceEvent>)> {
        let (candidate, events) =
            self.launch(identity, session_path, format!("reconnect:{identity}"))?;
        tracing::info!(
            "Instance {identity}: candidate started (session: {}, debug port: {})",
            candidate.session_path().display(),
            candidate.debug_port()
        );
        Ok((candidate, events))
    }

    /// Make `candidate` the registered instance for its identity.
    /// Returns the instance it replaced.
    pub async fn swap_in(&self, candidate: Arc<Instance>) -> Option<Arc<Instance>> {
        let identity = candidate.identity().to_string();
        let _guard = self.lock_identity(&identity).await;
        candidate.rename_health_component(format!("instance:{identity}"));
        self.instances.write().insert(identity, candidate)
    }

    /// Stop an unregistered instance (failed candidate or replaced client).
    pub async fn discard(&self, instance: &Arc<Instance>) {
        teardown(instance, false).await;
        let component = instance.health_component();
        // A replaced client shares its component with the new registration
        if component.starts_with("reconnect:") {
            health::remove(&component);
        }
    }
}

/// Best-effort: stop the event loop, then logout/destroy, logging failures.
async fn teardown(instance: &Arc<Instance>, logout: bool) {
    let identity = instance.identity();
    instance.cancel_token().cancel();
    let client = instance.client();
    if logout {
        if let Err(e) = client.logout().await {
            tracing::warn!("Instance {identity}: logout failed (ignored): {e:#}");
        }
    }
    if let Err(e) = client.destroy().await {
        tracing::warn!("Instance {identity}: destroy failed (ignored): {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackFactory;

    fn registry(factory: &LoopbackFactory) -> InstanceRegistry {
        InstanceRegistry::new(
            Arc::new(factory.clone()),
            RegistryOptions {
                sessions_dir: PathBuf::from("/tmp/relaygate-registry-test"),
                debug_port_base: 9500,
                restart_settle: Duration::from_millis(1),
                ready_watch: ReadyWatchPolicy::default(),
            },
        )
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let factory = LoopbackFactory::new();
        let reg = registry(&factory);

        let a = reg.create_instance("100", None).await.unwrap();
        let b = reg.create_instance("100", None).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.created_count(), 1);
        assert_eq!(a.session_path(), PathBuf::from("/tmp/relaygate-registry-test/100"));
    }

    #[tokio::test]
    async fn ports_are_never_reused() {
        let factory = LoopbackFactory::new();
        let reg = registry(&factory);

        let a = reg.create_instance("100", None).await.unwrap();
        let a_port = a.debug_port();
        reg.remove_instance("100").await;
        let b = reg.create_instance("100", None).await.unwrap();
        let c = reg.create_instance("200", None).await.unwrap();

        assert_eq!(a_port, 9500);
        assert_eq!(b.debug_port(), 9501);
        assert_eq!(c.debug_port(), 9502);
    }

    #[tokio::test]
    async fn remove_survives_teardown_failure() {
        let factory = LoopbackFactory::new();
        let reg = registry(&factory);
        reg.create_instance("100", None).await.unwrap();
        factory.controller("100").unwrap().fail_teardown(true);

        assert!(reg.remove_instance("100").await);
        assert!(reg.get_instance("100").is_none());
        assert!(!reg.remove_instance("100").await);
    }

    #[tokio::test]
    async fn remove_with_logout_flag() {
        let factory = LoopbackFactory::new();
        let reg = registry(&factory);
        reg.create_instance("100", None).await.unwrap();
        reg.create_instance("200", None).await.unwrap();

        reg.remove_with("100", false).await;
        reg.remove_instance("200").await;

        let kept = factory.controller("100").unwrap();
        assert!(!kept.is_logged_out());
        assert!(kept.is_destroyed());
        assert!(factory.controller("200").unwrap().is_logged_out());
    }

    #[tokio::test]
    async fn restart_keeps_session_path() {
        let factory = LoopbackFactory::new();
        let reg = registry(&factory);
        let custom = PathBuf::from("/tmp/relaygate-registry-test/custom");
        let before = reg.create_instance("100", Some(custom.clone())).await.unwrap();

        let after = reg.restart_instance("100").await.unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.session_path(), custom);
        assert!(before.is_stopped());
        assert!(!factory.controllers("100")[0].is_logged_out());
    }

    #[tokio::test]
    async fn restart_unknown_identity_errors() {
        let factory = LoopbackFactory::new();
        let reg = registry(&factory);
        let err = reg.restart_instance("nope").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_orders_by_creation() {
        let factory = LoopbackFactory::new();
        let reg = registry(&factory);
        reg.create_instance("b", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        reg.create_instance("a", None).await.unwrap();

        let ids: Vec<_> = reg.list().iter().map(|i| i.identity().to_string()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn swap_in_replaces_registration() {
        let factory = LoopbackFactory::new();
        let reg = registry(&factory);
        let old = reg.create_instance("100", None).await.unwrap();
        let (candidate, _events) = reg
            .spawn_candidate("100", PathBuf::from("/tmp/relaygate-registry-test/100.tmp"))
            .unwrap();
        assert!(Arc::ptr_eq(&reg.get_instance("100").unwrap(), &old));

        let replaced = reg.swap_in(candidate.clone()).await.unwrap();
        assert!(Arc::ptr_eq(&replaced, &old));
        assert!(Arc::ptr_eq(&reg.get_instance("100").unwrap(), &candidate));
        assert_eq!(candidate.health_component(), "instance:100");
    }

    #[tokio::test]
    async fn shutdown_destroys_all_without_logout() {
        let factory = LoopbackFactory::new();
        let reg = registry(&factory);
        reg.create_instance("100", None).await.unwrap();
        reg.create_instance("200", None).await.unwrap();
        factory.controller("100").unwrap().fail_teardown(true);

        reg.shutdown().await;

        assert!(reg.is_empty());
        let c200 = factory.controller("200").unwrap();
        assert!(c200.is_destroyed());
        assert!(!c200.is_logged_out());
    }
}
