//! rusqlite-backed `PersistenceStore`.
//!
//! Grounded in the teacher's `infrastructure/persistence.rs`, which also
//! reaches for `rusqlite(bundled)` as a storage backend; the encryption
//! (aes-gcm/sha2/pbkdf2) and backup-rotation machinery there is dropped —
//! spec §6.3 asks only for Put/Get/Query/Delete with best-effort TTLs, not
//! an encrypted-backup subsystem (noted in DESIGN.md).

use super::{PersistenceStore, Query, Record, SortField, SortOrder};
use crate::error::{CoordinatorError, CoordinatorResult};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use std::sync::Mutex;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> CoordinatorResult<Self> {
        let conn = Connection::open(path).map_err(|e| CoordinatorError::Persistence {
            reason: format!("failed to open sqlite database: {e}"),
        })?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                category TEXT NOT NULL,
                tags TEXT NOT NULL,
                value TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                accessed TEXT NOT NULL,
                size INTEGER NOT NULL,
                ttl_secs INTEGER,
                PRIMARY KEY (namespace, key)
            )",
            [],
        )
        .map_err(|e| CoordinatorError::Persistence {
            reason: format!("failed to create records table: {e}"),
        })?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
        let tags_json: String = row.get(3)?;
        let value_json: String = row.get(4)?;
        let ttl_secs: Option<i64> = row.get(8)?;
        Ok(Record {
            namespace: row.get(0)?,
            key: row.get(1)?,
            category: row.get(2)?,
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            value: serde_json::from_str(&value_json).unwrap_or(serde_json::Value::Null),
            timestamp: row.get::<_, String>(5)?.parse().unwrap_or_else(|_| Utc::now()),
            accessed: row.get::<_, String>(6)?.parse().unwrap_or_else(|_| Utc::now()),
            size: row.get::<_, i64>(7)? as usize,
            ttl: ttl_secs.map(|s| std::time::Duration::from_secs(s as u64)),
        })
    }
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        namespace: &str,
        category: &str,
        tags: Vec<String>,
        ttl: Option<std::time::Duration>,
    ) -> CoordinatorResult<()> {
        let now = Utc::now();
        let value_json = value.to_string();
        let tags_json = serde_json::to_string(&tags).unwrap_or_default();
        let size = value_json.len() as i64;
        let ttl_secs = ttl.map(|d| d.as_secs() as i64);

        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "INSERT INTO records (namespace, key, category, tags, value, timestamp, accessed, size, ttl_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(namespace, key) DO UPDATE SET
               category = excluded.category, tags = excluded.tags, value = excluded.value,
               timestamp = excluded.timestamp, accessed = excluded.accessed, size = excluded.size,
               ttl_secs = excluded.ttl_secs",
            rusqlite::params![
                namespace, key, category, tags_json, value_json,
                now.to_rfc3339(), now.to_rfc3339(), size, ttl_secs
            ],
        )
        .map_err(|e| CoordinatorError::Persistence { reason: format!("put failed: {e}") })?;
        Ok(())
    }

    async fn get(&self, key: &str, namespace: &str) -> CoordinatorResult<Option<serde_json::Value>> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn
            .prepare("SELECT namespace, key, category, tags, value, timestamp, accessed, size, ttl_secs FROM records WHERE namespace = ?1 AND key = ?2")
            .map_err(|e| CoordinatorError::Persistence { reason: e.to_string() })?;
        let record = stmt
            .query_row(rusqlite::params![namespace, key], Self::row_to_record)
            .ok();
        match record {
            Some(r) if !r.is_expired(Utc::now()) => Ok(Some(r.value)),
            _ => Ok(None),
        }
    }

    async fn query(&self, query: Query) -> CoordinatorResult<Vec<Record>> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn
            .prepare("SELECT namespace, key, category, tags, value, timestamp, accessed, size, ttl_secs FROM records")
            .map_err(|e| CoordinatorError::Persistence { reason: e.to_string() })?;
        let rows = stmt
            .query_map([], Self::row_to_record)
            .map_err(|e| CoordinatorError::Persistence { reason: e.to_string() })?;

        let now = Utc::now();
        let mut records: Vec<Record> = rows
            .filter_map(|r| r.ok())
            .filter(|r| !r.is_expired(now))
            .filter(|r| query.namespace.as_deref().map_or(true, |n| n == r.namespace))
            .filter(|r| query.category.as_deref().map_or(true, |c| c == r.category))
            .filter(|r| query.tags.iter().all(|t| r.tags.contains(t)))
            .collect();

        match query.sort {
            Some(SortField::Timestamp) => records.sort_by_key(|r| r.timestamp),
            Some(SortField::Accessed) => records.sort_by_key(|r| r.accessed),
            Some(SortField::Size) => records.sort_by_key(|r| r.size),
            Some(SortField::Name) => records.sort_by(|a, b| a.key.cmp(&b.key)),
            Some(SortField::Priority) | None => {}
        }
        if query.order == Some(SortOrder::Descending) {
            records.reverse();
        }
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn delete(&self, key: &str, namespace: &str) -> CoordinatorResult<bool> {
        let conn = self.conn.lock().expect("lock poisoned");
        let affected = conn
            .execute(
                "DELETE FROM records WHERE namespace = ?1 AND key = ?2",
                rusqlite::params![namespace, key],
            )
            .map_err(|e| CoordinatorError::Persistence { reason: e.to_string() })?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.sqlite3");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        store
            .put("k1", serde_json::json!({"a": 1}), "ns", "cat", vec![], None)
            .await
            .unwrap();
        let value = store.get("k1", "ns").await.unwrap();
        assert_eq!(value, Some(serde_json::json!({"a": 1})));
    }

    #[tokio::test]
    async fn open_on_unwritable_path_reports_persistence_error() {
        let result = SqliteStore::open("/nonexistent-dir/does-not-exist/db.sqlite3");
        assert_matches::assert_matches!(result, Err(CoordinatorError::Persistence { .. }));
    }
}
