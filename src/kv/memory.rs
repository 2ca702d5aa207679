use super::traits::KvStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Process-local key-value store. Entries do not survive a restart.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, Entry>>,
    unavailable: Mutex<bool>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail, as an unreachable backend would.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if *self.unavailable.lock() {
            anyhow::bail!("memory kv store marked unavailable");
        }
        Ok(())
    }

    fn live(entry: &Entry, now: Instant) -> bool {
        entry.expires_at > now
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .get(key)
            .filter(|e| Self::live(e, now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        self.check_available()?;
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| Self::live(e, now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> anyhow::Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .is_some_and(|e| Self::live(&e, now)))
    }

    async fn keys(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| Self::live(e, now));
        Ok(entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn purge_expired(&self) -> anyhow::Result<usize> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| Self::live(e, now));
        Ok(before - entries.len())
    }

    async fn health_check(&self) -> bool {
        !*self.unavailable.lock()
    }
}

/// Minimal glob: `*` matches any run of characters, `?` exactly one.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
