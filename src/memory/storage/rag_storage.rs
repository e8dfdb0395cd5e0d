//! Session-scoped semantic storage.
//!
//! Records are embedded on append and retrieved by brute-force cosine
//! similarity, which is plenty for the few dozen records a session holds.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::memory::embedding::{cosine_similarity, EmbeddingProvider, LocalEmbedding};
use crate::memory::memory::{MemoryRecord, MemoryScope};
use crate::memory::storage::interface::Storage;

/// In-memory vector store for session memory.
pub struct RAGStorage {
    embedder: Arc<dyn EmbeddingProvider>,
    records: RwLock<Vec<MemoryRecord>>,
    /// Results must score strictly above this similarity.
    pub score_threshold: f32,
}

impl Default for RAGStorage {
    fn default() -> Self {
        Self::new(Arc::new(LocalEmbedding::default()))
    }
}

impl RAGStorage {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedder,
            records: RwLock::new(Vec::new()),
            score_threshold: 0.0,
        }
    }

    pub fn with_score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl Storage for RAGStorage {
    fn scope(&self) -> MemoryScope {
        MemoryScope::Session
    }

    async fn append(&self, mut record: MemoryRecord) -> Result<(), anyhow::Error> {
        if record.embedding.is_none() {
            record.embedding = Some(self.embedder.embed(&record.content).await?);
        }
        self.records.write().push(record);
        Ok(())
    }

    async fn query(&self, probe: &str, top_k: usize) -> Result<Vec<MemoryRecord>, anyhow::Error> {
        let probe_embedding = self.embedder.embed(probe).await?;

        let records = self.records.read();
        let mut scored: Vec<(f32, &MemoryRecord)> = records
            .iter()
            .filter_map(|r| {
                let score = cosine_similarity(&probe_embedding, r.embedding.as_deref()?);
                (score > self.score_threshold).then_some((score, r))
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(top_k).map(|(_, r)| r.clone()).collect())
    }

    async fn records_for_key(&self, key: &str) -> Result<Vec<MemoryRecord>, anyhow::Error> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.key == key)
            .cloned()
            .collect())
    }

    async fn keys(&self) -> Result<Vec<String>, anyhow::Error> {
        let mut keys: Vec<String> = Vec::new();
        for record in self.records.read().iter() {
            if !keys.contains(&record.key) {
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
