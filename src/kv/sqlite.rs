use super::traits::KvStore;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// SQLite-backed key-value store.
///
/// Every operation runs on the blocking pool against a single connection, so
/// `set_if_absent` is one serialized `INSERT OR IGNORE` and cannot interleave
/// with another writer in this process. Expired rows are treated as absent
/// and swept opportunistically.
pub struct SqliteKvStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

impl SqliteKvStore {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create kv directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open kv DB: {}", db_path.display()))?;

        // WAL keeps readers off the writer's back; NORMAL sync is durable on WAL
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("Failed to set SQLite pragmas")?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key         TEXT PRIMARY KEY NOT NULL,
                value       TEXT NOT NULL,
                expires_at  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_kv_expires_at ON kv(expires_at);",
        )
        .context("Failed to initialize kv schema")?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<String>> {
            let value = conn
                .lock()
                .query_row(
                    "SELECT value FROM kv WHERE key = ?1 AND expires_at > ?2",
                    params![key, now_ms()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await?
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            conn.lock().execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                expires_at = excluded.expires_at",
                params![key, value, expiry_ms(ttl)],
            )?;
            Ok(())
        })
        .await?
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let mut guard = conn.lock();
            let tx = guard.transaction()?;
            let now = now_ms();
            tx.execute(
                "DELETE FROM kv WHERE key = ?1 AND expires_at <= ?2",
                params![key, now],
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, expiry_ms(ttl)],
            )?;
            tx.commit()?;
            Ok(inserted == 1)
        })
        .await?
    }

    async fn del(&self, key: &str) -> anyhow::Result<bool> {
        let conn = self.conn.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let removed = conn.lock().execute(
                "DELETE FROM kv WHERE key = ?1 AND expires_at > ?2",
                params![key, now_ms()],
            )?;
            Ok(removed > 0)
        })
        .await?
    }

    async fn keys(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.clone();
        let pattern = pattern.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<String>> {
            let guard = conn.lock();
            let mut stmt = guard.prepare(
                "SELECT key FROM kv WHERE key GLOB ?1 AND expires_at > ?2 ORDER BY key",
            )?;
            let keys = stmt
                .query_map(params![pattern, now_ms()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await?
    }

    async fn purge_expired(&self) -> anyhow::Result<usize> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
            let removed = conn
                .lock()
                .execute("DELETE FROM kv WHERE expires_at <= ?1", params![now_ms()])?;
            Ok(removed)
        })
        .await?
    }

    async fn health_check(&self) -> bool {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || conn.lock().execute_batch("SELECT 1").is_ok())
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, SqliteKvStore) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteKvStore::open(&tmp.path().join("kv.db")).unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn set_if_absent_only_first_wins() {
        let (_tmp, store) = temp_store();
        let ttl = Duration::from_secs(60);
        assert!(store.set_if_absent("dedup:a:1", "x", ttl).await.unwrap());
        assert!(!store.set_if_absent("dedup:a:1", "y", ttl).await.unwrap());
        assert_eq!(store.get("dedup:a:1").await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn expired_entries_can_be_reclaimed() {
        let (_tmp, store) = temp_store();
        assert!(store
            .set_if_absent("k", "old", Duration::from_millis(1))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(store.get("k").await.unwrap().is_none());
        assert!(store
            .set_if_absent("k", "new", Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("kv.db");
        {
            let store = SqliteKvStore::open(&path).unwrap();
            store
                .set_if_absent("dedup:a:1", "x", Duration::from_secs(60))
                .await
                .unwrap();
        }
        let reopened = SqliteKvStore::open(&path).unwrap();
        assert!(!reopened
            .set_if_absent("dedup:a:1", "x", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn keys_uses_glob_patterns() {
        let (_tmp, store) = temp_store();
        let ttl = Duration::from_secs(60);
        store.set("dedup:100:a", "1", ttl).await.unwrap();
        store.set("dedup:100:b", "1", ttl).await.unwrap();
        store.set("dedup:200:a", "1", ttl).await.unwrap();

        let keys = store.keys("dedup:100:*").await.unwrap();
        assert_eq!(keys, vec!["dedup:100:a", "dedup:100:b"]);
    }

    #[tokio::test]
    async fn del_and_purge() {
        let (_tmp, store) = temp_store();
        store.set("a", "1", Duration::from_secs(60)).await.unwrap();
        store.set("b", "1", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(store.del("a").await.unwrap());
        assert!(!store.del("a").await.unwrap());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.health_check().await);
    }

    #[tokio::test]
    async fn concurrent_set_if_absent_has_single_winner() {
        let (_tmp, store) = temp_store();
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .set_if_absent("race", "v", Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
