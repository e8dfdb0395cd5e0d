//! Entity-keyed session storage.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::memory::memory::{MemoryRecord, MemoryScope};
use crate::memory::storage::interface::Storage;

/// Records grouped by entity name, kept in insertion order.
///
/// Entity names are matched case-insensitively.
#[derive(Debug, Default)]
pub struct EntityStorage {
    records: RwLock<Vec<MemoryRecord>>,
}

impl EntityStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for EntityStorage {
    fn scope(&self) -> MemoryScope {
        MemoryScope::Entity
    }

    async fn append(&self, record: MemoryRecord) -> Result<(), anyhow::Error> {
        if record.key.trim().is_empty() {
            anyhow::bail!("entity records need a non-empty entity name");
        }
        self.records.write().push(record);
        Ok(())
    }

    /// All records for the named entity. `top_k` is not applied.
    async fn query(&self, probe: &str, _top_k: usize) -> Result<Vec<MemoryRecord>, anyhow::Error> {
        let name = probe.trim();
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.key.eq_ignore_ascii_case(name))
            .cloned()
            .collect())
    }

    async fn records_for_key(&self, key: &str) -> Result<Vec<MemoryRecord>, anyhow::Error> {
        self.query(key, usize::MAX).await
    }

    async fn keys(&self) -> Result<Vec<String>, anyhow::Error> {
        let mut keys: Vec<String> = Vec::new();
        for record in self.records.read().iter() {
            if !keys.iter().any(|k| k.eq_ignore_ascii_case(&record.key)) {
                keys.push(record.key.clone());
            }
        }
        Ok(keys)
    }

    async fn reset(&self) -> Result<(), anyhow::Error> {
        self.records.write().clear();
        Ok(())
    }
}
