//! Short-lived in-memory record of recently decided keys.
//!
//! Only ever consulted for fast rejects. A miss here says nothing; the
//! persisted store makes the real decision.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct CacheEntry {
    last_seen: Instant,
    hits: u32,
    expires_at: Instant,
}

/// Counters for the local cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalCacheStats {
    /// Lookups answered from memory
    pub hits: u64,
    pub remembered: u64,
    pub expired_removed: u64,
    /// Entries dropped to stay under capacity
    pub evicted: u64,
    pub current_entries: usize,
}

pub struct LocalDedupCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    cleanup_interval: Duration,
    last_cleanup: Mutex<Instant>,
    stats: Mutex<LocalCacheStats>,
    max_entries: usize,
}

impl LocalDedupCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(max_entries.min(1000))),
            ttl,
            cleanup_interval: Duration::from_secs(60).min(ttl.max(Duration::from_millis(1))),
            last_cleanup: Mutex::new(Instant::now()),
            stats: Mutex::new(LocalCacheStats::default()),
            max_entries: max_entries.max(1),
        }
    }

    /// Whether `key` was decided recently. Counts as a hit when it was.
    pub fn contains(&self, key: &str) -> bool {
        self.maybe_cleanup();

        let now = Instant::now();
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_seen = now;
                entry.hits = entry.hits.saturating_add(1);
                self.stats.lock().hits += 1;
                trace!("Local dedup hit for {key}");
                true
            }
            _ => false,
        }
    }

    /// Record a key whose persisted decision is already known.
    pub fn remember(&self, key: &str) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.insert(
            key.to_string(),
            CacheEntry {
                last_seen: now,
                hits: 0,
                expires_at: now + self.ttl,
            },
        );
        self.stats.lock().remembered += 1;
        self.check_capacity(&mut entries);
    }

    pub fn forget(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> LocalCacheStats {
        let mut stats = self.stats.lock().clone();
        stats.current_entries = self.len();
        stats
    }

    fn check_capacity(&self, entries: &mut HashMap<String, CacheEntry>) {
        if entries.len() <= self.max_entries {
            return;
        }

        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);

        // Still over: drop the least recently seen
        if entries.len() > self.max_entries {
            let mut by_age: Vec<(String, Instant)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.last_seen))
                .collect();
            by_age.sort_by_key(|(_, seen)| *seen);
            let extra = entries.len() - self.max_entries;
            for (key, _) in by_age.into_iter().take(extra) {
                entries.remove(&key);
            }
        }

        let removed = before - entries.len();
        if removed > 0 {
            self.stats.lock().evicted += removed as u64;
            debug!("Evicted {removed} local dedup entries due to capacity limit");
        }
    }

    fn maybe_cleanup(&self) {
        let due = self.last_cleanup.lock().elapsed() > self.cleanup_interval;
        if due {
            self.cleanup();
        }
    }

    /// Drop expired entries.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let removed = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|_, e| e.expires_at > now);
            before - entries.len()
        };

        if removed > 0 {
            self.stats.lock().expired_removed += removed as u64;
            debug!("Cleaned up {removed} expired local dedup entries");
        }
        *self.last_cleanup.lock() = now;
    }
}
