//! SQLite storage for durable memory.
//!
//! Records survive process restarts. Every append is written through to
//! the database before it returns, so a flush has nothing left to do.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use uuid::Uuid;

use crate::memory::memory::{MemoryRecord, MemoryScope};
use crate::memory::storage::interface::Storage;

/// Durable record store backed by a SQLite file.
#[derive(Debug, Clone)]
pub struct LTMSQLiteStorage {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
}

impl LTMSQLiteStorage {
    /// Open (and create if needed) the durable store.
    ///
    /// # Arguments
    /// * `db_path` - Optional path to the database file.
    ///   Defaults to `<db_storage_path>/long_term_memory_storage.db`.
    pub fn new(db_path: Option<PathBuf>) -> Result<Self, anyhow::Error> {
        let db_path = db_path.unwrap_or_else(|| {
            crate::utilities::paths::db_storage_path().join("long_term_memory_storage.db")
        });

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let storage = Self { db_path };
        storage.initialize_db()?;
        Ok(storage)
    }

    fn initialize_db(&self) -> Result<(), anyhow::Error> {
        let conn = Connection::open(&self.db_path).map_err(|e| {
            log::error!("MEMORY ERROR: database initialization failed: {}", e);
            e
        })?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memory_records (
                id TEXT PRIMARY KEY,
                key TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memory_records_key ON memory_records (key);",
        )?;
        Ok(())
    }

    fn insert(db_path: &Path, record: &MemoryRecord) -> Result<(), anyhow::Error> {
        let metadata = serde_json::to_string(&record.metadata)?;
        let conn = Connection::open(db_path)?;
        conn.execute(
            "INSERT INTO memory_records (id, key, content, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id.to_string(),
                record.key,
                record.content,
                metadata,
                record.timestamp.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Records stored under `key`, newest first, at most `limit`.
    fn select(db_path: &Path, key: &str, limit: usize) -> Result<Vec<MemoryRecord>, anyhow::Error> {
        let conn = Connection::open(db_path)?;
        let mut stmt = conn.prepare(
            "SELECT id, key, content, metadata, created_at
             FROM memory_records
             WHERE key = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![key, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, key, content, metadata, created_at) = row?;
            let metadata: HashMap<String, Value> = serde_json::from_str(&metadata).unwrap_or_default();
            records.push(MemoryRecord {
                id: Uuid::parse_str(&id)?,
                scope: MemoryScope::Durable,
                key,
                content,
                embedding: None,
                metadata,
                timestamp: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
            });
        }
        Ok(records)
    }

    fn distinct_keys(db_path: &Path) -> Result<Vec<String>, anyhow::Error> {
        let conn = Connection::open(db_path)?;
        let mut stmt = conn.prepare("SELECT key FROM memory_records GROUP BY key ORDER BY MIN(rowid)")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

#[async_trait]
impl Storage for LTMSQLiteStorage {
    fn scope(&self) -> MemoryScope {
        MemoryScope::Durable
    }

    async fn append(&self, record: MemoryRecord) -> Result<(), anyhow::Error> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || Self::insert(&db_path, &record)).await?
    }

    async fn query(&self, probe: &str, top_k: usize) -> Result<Vec<MemoryRecord>, anyhow::Error> {
        let db_path = self.db_path.clone();
        let key = probe.to_string();
        tokio::task::spawn_blocking(move || Self::select(&db_path, &key, top_k)).await?
    }

    async fn records_for_key(&self, key: &str) -> Result<Vec<MemoryRecord>, anyhow::Error> {
        let mut records = self.query(key, usize::MAX).await?;
        records.reverse();
        Ok(records)
    }

    async fn keys(&self) -> Result<Vec<String>, anyhow::Error> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || Self::distinct_keys(&db_path)).await?
    }

    async fn reset(&self) -> Result<(), anyhow::Error> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), anyhow::Error> {
            let conn = Connection::open(&db_path)?;
            conn.execute("DELETE FROM memory_records", [])?;
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &tempfile::TempDir) -> LTMSQLiteStorage {
        LTMSQLiteStorage::new(Some(dir.path().join("ltm.db"))).unwrap()
    }

    #[tokio::test]
    async fn test_append_then_query_exact_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = storage(&dir);
        store.append(MemoryRecord::new(MemoryScope::Durable, "k1", "first")).await.unwrap();
        store.append(MemoryRecord::new(MemoryScope::Durable, "k2", "other")).await.unwrap();
        store.append(MemoryRecord::new(MemoryScope::Durable, "k1", "second")).await.unwrap();

        let records = store.query("k1", 10).await.unwrap();
        let contents: Vec<&str> = records.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["second", "first"]);
        assert_eq!(store.query("k1", 1).await.unwrap().len(), 1);
        assert!(store.query("missing", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = HashMap::new();
        metadata.insert("task".to_string(), Value::String("market_dynamics_task".into()));
        storage(&dir)
            .append(MemoryRecord::new(MemoryScope::Durable, "k", "v").with_metadata(metadata))
            .await
            .unwrap();

        let reopened = storage(&dir);
        let records = reopened.query("k", 5).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "v");
        assert_eq!(records[0].metadata["task"], "market_dynamics_task");
        assert_eq!(reopened.keys().await.unwrap(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_reset_and_unlimited_query() {
        let dir = tempfile::tempdir().unwrap();
        let store = storage(&dir);
        for i in 0..3 {
            store.append(MemoryRecord::new(MemoryScope::Durable, "k", format!("v{i}"))).await.unwrap();
        }
        assert_eq!(store.records_for_key("k").await.unwrap().len(), 3);
        store.reset().await.unwrap();
        assert!(store.query("k", usize::MAX).await.unwrap().is_empty());
    }
}
