//! Shared harness for integration tests: a fully wired gateway on the
//! loopback transport with millisecond timing policies.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use relaygate::dedup::{DedupPolicy, MessageDeduplicator};
use relaygate::instances::{
    InboundEnvelope, Instance, InstanceRegistry, InstanceStatus, OutboundContent,
    ReadyWatchPolicy, RegistryOptions,
};
use relaygate::kv::{KvStore, MemoryKvStore};
use relaygate::processor::Processor;
use relaygate::reconnect::{ReconnectOrchestrator, ReconnectPolicy};
use relaygate::router::MessageRouter;
use relaygate::transport::{LoopbackController, LoopbackFactory};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Processor that records every envelope and answers with a fixed reply.
pub struct ScriptedProcessor {
    calls: Mutex<Vec<InboundEnvelope>>,
    reply: Mutex<Option<OutboundContent>>,
    delay: Duration,
}

impl ScriptedProcessor {
    pub fn replying(reply: Option<OutboundContent>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            reply: Mutex::new(reply),
            delay: Duration::ZERO,
        }
    }

    /// Holds each call open for `delay`, widening race windows.
    pub fn slow(reply: Option<OutboundContent>, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::replying(reply)
        }
    }

    pub fn calls(&self) -> Vec<InboundEnvelope> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn process(&self, envelope: &InboundEnvelope) -> anyhow::Result<Option<OutboundContent>> {
        self.calls.lock().push(envelope.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.reply.lock().clone())
    }
}

pub fn fast_ready_watch() -> ReadyWatchPolicy {
    ReadyWatchPolicy {
        disconnect_backoff: Duration::from_millis(20),
        ready_grace: Duration::from_millis(20),
        poll_interval: Duration::from_millis(10),
        poll_attempts: 5,
        loading_complete_threshold: 2,
        loading_confirm_delay: Duration::from_millis(20),
    }
}

pub fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        handoff_timeout: Duration::from_millis(300),
        scan_timeout: Duration::from_millis(600),
        stabilization_delay: Duration::from_millis(10),
        old_client_grace: Duration::from_millis(10),
        max_qr_forwards: 2,
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub factory: LoopbackFactory,
    pub processor: Arc<ScriptedProcessor>,
    pub registry: Arc<InstanceRegistry>,
    pub router: Arc<MessageRouter>,
    pub orchestrator: Arc<ReconnectOrchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(
            ScriptedProcessor::replying(Some(OutboundContent::Text("ack".into()))),
            fast_reconnect(),
        )
    }

    pub fn with(processor: ScriptedProcessor, reconnect: ReconnectPolicy) -> Self {
        Self::with_store(processor, reconnect, Arc::new(MemoryKvStore::new()))
    }

    pub fn with_store(
        processor: ScriptedProcessor,
        reconnect: ReconnectPolicy,
        store: Arc<dyn KvStore>,
    ) -> Self {
        let tmp = TempDir::new().unwrap();
        let factory = LoopbackFactory::new();
        let registry = Arc::new(InstanceRegistry::new(
            Arc::new(factory.clone()),
            RegistryOptions {
                sessions_dir: tmp.path().join("sessions"),
                debug_port_base: 9400,
                restart_settle: Duration::from_millis(5),
                ready_watch: fast_ready_watch(),
            },
        ));
        let dedup = Arc::new(MessageDeduplicator::new(store, DedupPolicy::default()));
        let processor = Arc::new(processor);
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            dedup,
            processor.clone(),
        ));
        router.attach();
        let orchestrator = Arc::new(ReconnectOrchestrator::new(
            registry.clone(),
            router.clone(),
            reconnect,
        ));

        Self {
            tmp,
            factory,
            processor,
            registry,
            router,
            orchestrator,
        }
    }

    pub fn controller(&self, identity: &str) -> LoopbackController {
        self.factory.controller(identity).unwrap()
    }

    /// Create an instance and walk it through authentication to `ready`.
    pub async fn ready_instance(&self, identity: &str) -> Arc<Instance> {
        let instance = self.registry.create_instance(identity, None).await.unwrap();
        let controller = self.controller(identity);
        controller.authenticated().await;
        controller.ready().await;
        wait_for_status(&instance, InstanceStatus::Ready).await;
        instance
    }
}

/// Poll `condition` until it holds, failing the test after [`WAIT_LIMIT`].
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_status(instance: &Instance, status: InstanceStatus) {
    let mut rx = instance.watch_status();
    let reached = matches!(
        tokio::time::timeout(WAIT_LIMIT, rx.wait_for(|s| *s == status)).await,
        Ok(Ok(_))
    );
    assert!(
        reached,
        "instance {} never reached {status} (now {})",
        instance.identity(),
        instance.status()
    );
}
