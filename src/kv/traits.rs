use async_trait::async_trait;
use std::time::Duration;

/// Persisted key-value store with per-key expiry.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    /// Value for `key`, unless missing or expired
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Insert or overwrite `key`, expiring after `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Atomically insert `key` only if no live entry exists.
    /// Returns `true` when this call created the entry.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Remove `key`; returns whether a live entry was removed
    async fn del(&self, key: &str) -> anyhow::Result<bool>;

    /// Live keys matching a glob pattern (`*`, `?`). Diagnostics only.
    async fn keys(&self, pattern: &str) -> anyhow::Result<Vec<String>>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> anyhow::Result<usize>;

    /// Health check
    async fn health_check(&self) -> bool;
}
