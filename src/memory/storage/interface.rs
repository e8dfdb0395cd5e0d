//! Storage interface shared by every memory scope.

use async_trait::async_trait;

use crate::memory::memory::{MemoryRecord, MemoryScope};

/// Append-only record store.
///
/// Each backend interprets the query probe according to its scope: an
/// exact key (durable), a similarity probe (session) or an entity name
/// (entity).
#[async_trait]
pub trait Storage: Send + Sync {
    /// The scope this backend serves.
    fn scope(&self) -> MemoryScope;

    /// Append a record. Existing records are never modified.
    ///
    /// # Arguments
    /// * `record` - The record to append.
    async fn append(&self, record: MemoryRecord) -> Result<(), anyhow::Error>;

    /// Query the store.
    ///
    /// # Arguments
    /// * `probe` - Key, similarity probe or entity name.
    /// * `top_k` - Maximum number of records to return.
    async fn query(&self, probe: &str, top_k: usize) -> Result<Vec<MemoryRecord>, anyhow::Error>;

    /// Every record stored under exactly `key`, oldest first.
    async fn records_for_key(&self, key: &str) -> Result<Vec<MemoryRecord>, anyhow::Error> {
        let mut records = self.query(key, usize::MAX).await?;
        records.retain(|r| r.key == key);
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    /// Distinct keys in first-seen order.
    async fn keys(&self) -> Result<Vec<String>, anyhow::Error> {
        Ok(Vec::new())
    }

    /// Make every appended record durable.
    async fn flush(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Remove all entries.
    async fn reset(&self) -> Result<(), anyhow::Error>;
}
