//! SQLite-backed state store.
//!
//! A single-file durable backend with the same compare-and-swap semantics as
//! the replicated stores the orchestrator targets in production. Every call
//! runs on the blocking pool.

use crate::store::{conflict, LockLease, Record, StateStore};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{SwitchboardError, SwitchboardResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key     TEXT PRIMARY KEY,
    value   TEXT NOT NULL,
    version INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS locks (
    key        TEXT PRIMARY KEY,
    holder     TEXT NOT NULL,
    token      TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
";

/// State store in a SQLite file.
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> SwitchboardResult<Self> {
        let conn = Connection::open(path).map_err(unavailable)?;
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> SwitchboardResult<Self> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> SwitchboardResult<Self> {
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Drop lock rows whose lease has expired. Returns how many were removed.
    pub async fn purge_expired_locks(&self) -> SwitchboardResult<usize> {
        let now = Utc::now().timestamp_millis();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM locks WHERE expires_at <= ?1", params![now])
        })
        .await
    }

    async fn blocking<F, T>(&self, f: F) -> SwitchboardResult<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| SwitchboardError::StoreUnavailable(format!("sqlite worker failed: {e}")))?
        .map_err(unavailable)
    }
}

fn unavailable(e: rusqlite::Error) -> SwitchboardError {
    SwitchboardError::StoreUnavailable(format!("sqlite: {e}"))
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, key: &str) -> SwitchboardResult<Option<Record>> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT value, version FROM kv WHERE key = ?1",
                params![key],
                |row| {
                    Ok(Record {
                        value: row.get(0)?,
                        version: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
    ) -> SwitchboardResult<u64> {
        let owned_key = key.to_string();
        let outcome = self
            .blocking(move |conn| {
                let tx = conn.transaction()?;
                let actual: Option<u64> = tx
                    .query_row(
                        "SELECT version FROM kv WHERE key = ?1",
                        params![owned_key],
                        |row| row.get::<_, i64>(0),
                    )
                    .optional()?
                    .map(|v| v as u64);
                if actual != expected {
                    return Ok(Err(actual));
                }
                let version = actual.map_or(1, |v| v + 1);
                tx.execute(
                    "INSERT INTO kv (key, value, version) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, version = excluded.version",
                    params![owned_key, value, version as i64],
                )?;
                tx.commit()?;
                Ok(Ok(version))
            })
            .await?;
        outcome.map_err(|actual| conflict(key, expected, actual))
    }

    async fn scan_prefix(&self, prefix: &str) -> SwitchboardResult<Vec<(String, Record)>> {
        let prefix = prefix.to_string();
        self.blocking(move |conn| {
            let mut stmt =
                conn.prepare("SELECT key, value, version FROM kv WHERE key >= ?1 ORDER BY key")?;
            let rows = stmt.query_map(params![prefix], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    Record {
                        value: row.get(1)?,
                        version: row.get::<_, i64>(2)? as u64,
                    },
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (key, record) = row?;
                if !key.starts_with(&prefix) {
                    break;
                }
                out.push((key, record));
            }
            Ok(out)
        })
        .await
    }

    async fn acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> SwitchboardResult<Option<LockLease>> {
        let lease = LockLease::new(key, holder, ttl);
        let candidate = lease.clone();
        let acquired = self
            .blocking(move |conn| {
                let now = Utc::now().timestamp_millis();
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM locks WHERE key = ?1 AND expires_at <= ?2",
                    params![candidate.key, now],
                )?;
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO locks (key, holder, token, expires_at) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        candidate.key,
                        candidate.holder,
                        candidate.token.to_string(),
                        candidate.expires_at.timestamp_millis()
                    ],
                )?;
                tx.commit()?;
                Ok(inserted == 1)
            })
            .await?;
        Ok(acquired.then_some(lease))
    }

    async fn release_lock(&self, lease: &LockLease) -> SwitchboardResult<bool> {
        let key = lease.key.clone();
        let token = lease.token.to_string();
        let removed = self
            .blocking(move |conn| {
                conn.execute(
                    "DELETE FROM locks WHERE key = ?1 AND token = ?2",
                    params![key, token],
                )
            })
            .await?;
        Ok(removed == 1)
    }

    async fn ping(&self) -> SwitchboardResult<()> {
        self.blocking(|conn| conn.query_row("SELECT 1", [], |_| Ok(())))
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_cas_semantics() {
        let store = SqliteStateStore::in_memory().unwrap();
        assert_eq!(
            store.compare_and_swap("task:1", None, "a".into()).await.unwrap(),
            1
        );
        assert_eq!(
            store
                .compare_and_swap("task:1", Some(1), "b".into())
                .await
                .unwrap(),
            2
        );
        assert!(store
            .compare_and_swap("task:1", Some(1), "c".into())
            .await
            .unwrap_err()
            .is_conflict());
        assert_eq!(store.get("task:1").await.unwrap().unwrap().value, "b");
    }

    #[tokio::test]
    async fn test_sqlite_scan_and_locks() {
        let store = SqliteStateStore::in_memory().unwrap();
        store.compare_and_swap("agent:a", None, "1".into()).await.unwrap();
        store.compare_and_swap("task:a", None, "2".into()).await.unwrap();
        store.compare_and_swap("task:b", None, "3".into()).await.unwrap();
        assert_eq!(store.scan_prefix("task:").await.unwrap().len(), 2);

        let lease = store
            .acquire_lock("lock:t", "a", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert!(store
            .acquire_lock("lock:t", "b", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
        assert!(store.release_lock(&lease).await.unwrap());
        assert_eq!(store.purge_expired_locks().await.unwrap(), 0);
        store.ping().await.unwrap();
    }
}
