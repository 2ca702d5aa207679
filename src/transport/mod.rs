pub mod bridge;
pub mod loopback;
pub mod traits;

pub use bridge::BridgeFactory;
pub use loopback::{LoopbackController, LoopbackFactory, SentMessage};
pub use traits::{
    AccountInfo, MediaAttachment, OutgoingPayload, RawMessage, TransportClient, TransportEvent,
    TransportFactory, TransportHandle, TransportSpec, STATE_CONNECTED,
};

use crate::config::TransportConfig;
use std::sync::Arc;
use std::time::Duration;

/// Factory: build the transport used by the daemon from config
pub fn create_factory(config: &TransportConfig, dry_run: bool) -> Arc<dyn TransportFactory> {
    if dry_run {
        tracing::info!("Transport: loopback (dry run, nothing leaves the process)");
        return Arc::new(LoopbackFactory::auto_ready());
    }
    tracing::info!("Transport: bridge process `{}`", config.command);
    Arc::new(BridgeFactory::new(
        config.command.clone(),
        config.args.clone(),
        Duration::from_secs(config.command_timeout_secs.max(1)),
    ))
}
