//! At-most-once acceptance of inbound messages.
//!
//! The persisted store's atomic set-if-absent is the source of truth; the
//! local cache only short-circuits keys already decided in this process.
//! When the store cannot answer, the message is rejected.

pub mod local;

pub use local::{LocalCacheStats, LocalDedupCache};

use crate::config::DedupConfig;
use crate::kv::KvStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Timing and sizing for deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupPolicy {
    /// Lifetime of a persisted record
    pub ttl: Duration,
    pub local_ttl: Duration,
    pub local_capacity: usize,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self::from(&DedupConfig::default())
    }
}

impl From<&DedupConfig> for DedupPolicy {
    fn from(config: &DedupConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_secs.max(1)),
            local_ttl: Duration::from_secs(config.local_cache_ttl_secs),
            local_capacity: config.local_cache_capacity,
        }
    }
}

/// Value stored under each deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub message_id: String,
    pub instance_identity: String,
    /// RFC 3339
    pub processed_at: String,
}

/// Outcome of a deduplication check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    /// First sighting; the caller owns processing
    Accepted,
    Duplicate,
    /// Store failed; treat as not accepted
    StoreUnavailable,
}

pub struct MessageDeduplicator {
    store: Arc<dyn KvStore>,
    local: LocalDedupCache,
    policy: DedupPolicy,
}

impl MessageDeduplicator {
    pub fn new(store: Arc<dyn KvStore>, policy: DedupPolicy) -> Self {
        let local = LocalDedupCache::new(policy.local_ttl, policy.local_capacity);
        Self {
            store,
            local,
            policy,
        }
    }

    pub fn key(instance_identity: &str, message_id: &str) -> String {
        format!("dedup:{instance_identity}:{message_id}")
    }

    pub fn policy(&self) -> &DedupPolicy {
        &self.policy
    }

    pub fn local_stats(&self) -> LocalCacheStats {
        self.local.stats()
    }

    pub async fn check(&self, instance_identity: &str, message_id: &str) -> DedupDecision {
        let key = Self::key(instance_identity, message_id);
        if self.local.contains(&key) {
            return DedupDecision::Duplicate;
        }

        let record = DedupRecord {
            message_id: message_id.to_string(),
            instance_identity: instance_identity.to_string(),
            processed_at: chrono::Utc::now().to_rfc3339(),
        };
        let value = match serde_json::to_string(&record) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("CRITICAL: dedup record for {key} could not be encoded: {e}");
                return DedupDecision::StoreUnavailable;
            }
        };

        match self.store.set_if_absent(&key, &value, self.policy.ttl).await {
            Ok(true) => {
                self.local.remember(&key);
                DedupDecision::Accepted
            }
            Ok(false) => {
                self.local.remember(&key);
                tracing::debug!("Duplicate message {message_id} on {instance_identity} dropped");
                DedupDecision::Duplicate
            }
            Err(e) => {
                tracing::error!(
                    "CRITICAL: dedup store ({}) unavailable, message {message_id} on {instance_identity} not processed: {e:#}",
                    self.store.name()
                );
                DedupDecision::StoreUnavailable
            }
        }
    }

    /// `true` only when this call is the first to see the pair.
    pub async fn try_accept(&self, instance_identity: &str, message_id: &str) -> bool {
        self.check(instance_identity, message_id).await == DedupDecision::Accepted
    }

    /// Persisted keys matching a glob pattern. Diagnostics only.
    pub async fn search(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        self.store.keys(pattern).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{MemoryKvStore, SqliteKvStore};

    fn policy() -> DedupPolicy {
        DedupPolicy {
            ttl: Duration::from_secs(60),
            local_ttl: Duration::from_secs(60),
            local_capacity: 100,
        }
    }

    #[tokio::test]
    async fn first_accept_then_duplicate() {
        let dedup = MessageDeduplicator::new(Arc::new(MemoryKvStore::new()), policy());
        assert!(dedup.try_accept("100", "m1").await);
        assert!(!dedup.try_accept("100", "m1").await);
        // Same id on another instance is a different message
        assert!(dedup.try_accept("200", "m1").await);
    }

    #[tokio::test]
    async fn store_failure_fails_closed() {
        let store = Arc::new(MemoryKvStore::new());
        store.set_unavailable(true);
        let dedup = MessageDeduplicator::new(store, policy());
        assert_eq!(
            dedup.check("100", "m1").await,
            DedupDecision::StoreUnavailable
        );
        assert!(!dedup.try_accept("100", "m1").await);
    }

    #[tokio::test]
    async fn local_cache_answers_after_store_goes_down() {
        let store = Arc::new(MemoryKvStore::new());
        let dedup = MessageDeduplicator::new(store.clone(), policy());
        assert!(dedup.try_accept("100", "m1").await);

        store.set_unavailable(true);
        assert_eq!(dedup.check("100", "m1").await, DedupDecision::Duplicate);
        assert_eq!(dedup.local_stats().hits, 1);
    }

    #[tokio::test]
    async fn persisted_records_reject_after_restart() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("dedup.db");
        {
            let store = Arc::new(SqliteKvStore::open(&path).unwrap());
            let dedup = MessageDeduplicator::new(store, policy());
            assert!(dedup.try_accept("100", "m1").await);
        }
        let store = Arc::new(SqliteKvStore::open(&path).unwrap());
        let dedup = MessageDeduplicator::new(store, policy());
        assert!(!dedup.try_accept("100", "m1").await);

        let keys = dedup.search("dedup:100:*").await.unwrap();
        assert_eq!(keys, vec!["dedup:100:m1"]);
    }

    #[tokio::test]
    async fn concurrent_accepts_have_one_winner() {
        let dedup = Arc::new(MessageDeduplicator::new(
            Arc::new(MemoryKvStore::new()),
            policy(),
        ));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let dedup = dedup.clone();
            handles.push(tokio::spawn(async move { dedup.try_accept("100", "race").await }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn record_payload_is_json() {
        let store = Arc::new(MemoryKvStore::new());
        let dedup = MessageDeduplicator::new(store.clone(), policy());
        dedup.try_accept("100", "m1").await;

        let raw = store.get("dedup:100:m1").await.unwrap().unwrap();
        let record: DedupRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.instance_identity, "100");
        assert_eq!(record.message_id, "m1");
    }
}
