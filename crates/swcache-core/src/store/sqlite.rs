//! Durable store backed by SQLite.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info};

use super::CacheStore;
use crate::error::StoreError;
use crate::partition::PartitionId;
use crate::policy::{EntryStamp, EvictionPolicy};
use crate::request::RequestKey;
use crate::response::{CacheEntry, CachedResponse};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Cache store persisted to a SQLite database file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened cache database");
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let version = schema_version(&conn)?;
        if version < SCHEMA_VERSION {
            migrate(&conn, version)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }
}

fn schema_version(conn: &Connection) -> Result<i32, StoreError> {
    let table_exists: bool = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get::<_, i32>(0).map(|count| count > 0),
    )?;

    if !table_exists {
        return Ok(0);
    }

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0))
}

fn migrate(conn: &Connection, from_version: i32) -> Result<(), StoreError> {
    if from_version < 1 {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version INTEGER NOT NULL,
                applied_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS partitions (
                name TEXT PRIMARY KEY,
                max_entries INTEGER,
                max_age_seconds INTEGER,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entries (
                partition TEXT NOT NULL REFERENCES partitions(name) ON DELETE CASCADE,
                key TEXT NOT NULL,
                status INTEGER NOT NULL,
                headers TEXT NOT NULL,
                body BLOB NOT NULL,
                stored_at INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                PRIMARY KEY (partition, key)
            );

            CREATE INDEX IF NOT EXISTS idx_entries_age ON entries(partition, stored_at, seq);
            "#,
        )?;
    }

    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        params![SCHEMA_VERSION, Utc::now().timestamp()],
    )?;
    debug!(from_version, to_version = SCHEMA_VERSION, "Cache schema migrated");
    Ok(())
}

fn ensure_partition(tx: &Transaction<'_>, name: &str) -> Result<(), StoreError> {
    tx.execute(
        "INSERT OR IGNORE INTO partitions (name, created_at) VALUES (?1, ?2)",
        params![name, Utc::now().timestamp()],
    )?;
    Ok(())
}

fn load_policy(tx: &Transaction<'_>, name: &str) -> Result<EvictionPolicy, StoreError> {
    let (max_entries, max_age): (Option<i64>, Option<i64>) = tx.query_row(
        "SELECT max_entries, max_age_seconds FROM partitions WHERE name = ?1",
        params![name],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(EvictionPolicy {
        max_entries: max_entries.map(|n| n.max(0) as usize),
        max_age_seconds: max_age.map(|n| n.max(0) as u64),
    })
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Serialization(format!("invalid timestamp: {}", millis)))
}

fn decode_response(status: u16, headers: &str, body: Vec<u8>) -> Result<CachedResponse, StoreError> {
    let status = StatusCode::from_u16(status)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    let pairs: Vec<(String, String)> = serde_json::from_str(headers)?;
    let mut header_map = HeaderMap::new();
    for (name, value) in pairs {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let value =
            HeaderValue::from_str(&value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        header_map.append(name, value);
    }

    Ok(CachedResponse {
        status,
        headers: header_map,
        body: Bytes::from(body),
    })
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn get(
        &self,
        partition: &PartitionId,
        key: &RequestKey,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let partition = partition.clone();
        let key = key.clone();

        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT status, headers, body, stored_at FROM entries
                     WHERE partition = ?1 AND key = ?2",
                    params![partition.to_string(), key.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, u16>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?;

            match row {
                Some((status, headers, body, stored_at)) => Ok(Some(CacheEntry {
                    response: decode_response(status, &headers, body)?,
                    stored_at: timestamp(stored_at)?,
                    key,
                    partition,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        let headers = serde_json::to_string(&entry.response.header_pairs())?;

        self.with_conn(move |conn| {
            let name = entry.partition.to_string();
            let tx = conn.transaction()?;
            ensure_partition(&tx, &name)?;

            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM entries WHERE partition = ?1",
                params![name],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT OR REPLACE INTO entries
                 (partition, key, status, headers, body, stored_at, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    name,
                    entry.key.as_str(),
                    entry.response.status.as_u16(),
                    headers,
                    entry.response.body.as_ref(),
                    entry.stored_at.timestamp_millis(),
                    seq,
                ],
            )?;

            let policy = load_policy(&tx, &name)?;
            if !policy.is_unbounded() {
                let stamps = {
                    let mut stmt = tx.prepare(
                        "SELECT key, stored_at, seq FROM entries WHERE partition = ?1",
                    )?;
                    let rows = stmt.query_map(params![name], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    })?;

                    let mut stamps = Vec::new();
                    for row in rows {
                        let (key, stored_at, seq) = row?;
                        stamps.push(EntryStamp {
                            key: RequestKey::from_raw(key),
                            stored_at: timestamp(stored_at)?,
                            seq: seq as u64,
                        });
                    }
                    stamps
                };

                for victim in policy.victims(&stamps, Utc::now()) {
                    debug!(partition = %name, key = %victim, "Evicting entry");
                    tx.execute(
                        "DELETE FROM entries WHERE partition = ?1 AND key = ?2",
                        params![name, victim.as_str()],
                    )?;
                }
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, partition: &PartitionId, key: &RequestKey) -> Result<(), StoreError> {
        let name = partition.to_string();
        let key = key.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM entries WHERE partition = ?1 AND key = ?2",
                params![name, key.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_keys(&self, partition: &PartitionId) -> Result<Vec<RequestKey>, StoreError> {
        let name = partition.to_string();

        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT key FROM entries WHERE partition = ?1 ORDER BY key")?;
            let keys = stmt
                .query_map(params![name], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys.into_iter().map(RequestKey::from_raw).collect())
        })
        .await
    }

    async fn list_partitions(&self) -> Result<Vec<PartitionId>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM partitions ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            names
                .into_iter()
                .map(|name| name.parse::<PartitionId>().map_err(StoreError::Serialization))
                .collect()
        })
        .await
    }

    async fn create_partition(
        &self,
        partition: &PartitionId,
        policy: EvictionPolicy,
    ) -> Result<(), StoreError> {
        let name = partition.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO partitions (name, max_entries, max_age_seconds, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                    max_entries = excluded.max_entries,
                    max_age_seconds = excluded.max_age_seconds",
                params![
                    name,
                    policy.max_entries.map(|n| n as i64),
                    policy.max_age_seconds.map(|n| n as i64),
                    Utc::now().timestamp(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_partition(&self, partition: &PartitionId) -> Result<(), StoreError> {
        let name = partition.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM entries WHERE partition = ?1", params![name])?;
            tx.execute("DELETE FROM partitions WHERE name = ?1", params![name])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn entry_count(&self, partition: &PartitionId) -> Result<usize, StoreError> {
        let name = partition.to_string();

        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM entries WHERE partition = ?1",
                params![name],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn api() -> PartitionId {
        PartitionId::new("api", "v1")
    }

    fn entry(key: &str, body: &str) -> CacheEntry {
        CacheEntry::new(
            api(),
            RequestKey::from_raw(key),
            CachedResponse::ok(body.to_string()).with_header("content-type", "application/json"),
        )
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let stored = entry("GET https://app.example/api/me", r#"{"name":"ada"}"#);
        store.put(stored.clone()).await.unwrap();

        let got = store
            .get(&api(), &RequestKey::from_raw("GET https://app.example/api/me"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.response, stored.response);
        assert_eq!(got.partition, api());
        assert_eq!(
            got.stored_at.timestamp_millis(),
            stored.stored_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .create_partition(&api(), EvictionPolicy::max_entries(2))
                .await
                .unwrap();
            store.put(entry("A", "a")).await.unwrap();
            store.put(entry("B", "b")).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.list_partitions().await.unwrap(), vec![api()]);
        assert_eq!(store.entry_count(&api()).await.unwrap(), 2);

        // Policy persisted too
        store.put(entry("C", "c")).await.unwrap();
        assert_eq!(
            store.list_keys(&api()).await.unwrap(),
            vec![RequestKey::from_raw("B"), RequestKey::from_raw("C")]
        );
    }

    #[tokio::test]
    async fn test_delete_partition_removes_entries() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(entry("A", "a")).await.unwrap();

        store.delete_partition(&api()).await.unwrap();
        assert!(store.list_partitions().await.unwrap().is_empty());
        assert!(store.get(&api(), &RequestKey::from_raw("A")).await.unwrap().is_none());

        // Absent partition is fine
        store.delete_partition(&api()).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(entry("A", "a")).await.unwrap();
        store.delete(&api(), &RequestKey::from_raw("A")).await.unwrap();
        store.delete(&api(), &RequestKey::from_raw("A")).await.unwrap();
        assert_eq!(store.entry_count(&api()).await.unwrap(), 0);
    }
}
