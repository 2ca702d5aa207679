pub mod schema;

pub use schema::{
    Config, DedupConfig, GatewayConfig, InstanceConfig, ProcessorConfig, ReconnectConfig,
    StatusConfig, TransportConfig,
};
