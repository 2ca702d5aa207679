//! Instance registry, per-instance status machine, and shared types.

mod event_loop;
pub mod instance;
pub mod registry;
pub mod status;
pub mod types;

pub use instance::{Instance, InstanceEvent};
pub use registry::{InstanceRegistry, RegistryOptions};
pub use status::{ReadySource, ReadyWatchPolicy, StatusTrigger};
pub use types::{
    GatewayError, InboundEnvelope, InstanceStatus, MessageKind, OutboundContent,
    StructuredContent,
};

use crate::transport::RawMessage;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

/// Receives every raw inbound message, per instance in arrival order.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_inbound(&self, instance_identity: &str, message: RawMessage);
}

/// Shared, late-bound slot for the inbound handler.
pub(crate) type InboundSink = Arc<RwLock<Option<Weak<dyn InboundHandler>>>>;
