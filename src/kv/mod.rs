pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryKvStore;
pub use sqlite::SqliteKvStore;
pub use traits::KvStore;

use crate::config::DedupConfig;
use std::sync::Arc;

/// Factory: open the configured key-value backend
pub fn create_kv_store(config: &DedupConfig) -> anyhow::Result<Arc<dyn KvStore>> {
    match config.backend.as_str() {
        "memory" => {
            tracing::warn!("Dedup backend: memory (records are lost on restart)");
            Ok(Arc::new(MemoryKvStore::new()))
        }
        "sqlite" => {
            let store = SqliteKvStore::open(&config.db_path)?;
            tracing::info!("Dedup backend: sqlite at {}", store.db_path().display());
            Ok(Arc::new(store))
        }
        other => anyhow::bail!("Unknown kv backend '{other}'"),
    }
}
