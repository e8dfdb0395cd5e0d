//! Unified access to the three memory tiers.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::memory::{MemoryRecord, MemoryScope};
use crate::memory::storage::{EntityStorage, LTMSQLiteStorage, RAGStorage, Storage};
use crate::utilities::errors::MemoryUnavailable;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for store operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per operation, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Cap on a single delay in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_backoff_base_ms() -> u64 { 50 }
fn default_backoff_max_ms() -> u64 { 1_000 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn compute_backoff(&self, attempt: u32) -> Duration {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

// ---------------------------------------------------------------------------
// MemoryTierManager
// ---------------------------------------------------------------------------

/// Owns the durable, session and entity stores for one session.
///
/// Every operation is retried according to the [`RetryPolicy`]; when the
/// store stays unavailable the caller gets [`MemoryUnavailable`] and nothing
/// is silently dropped.
#[derive(Clone)]
pub struct MemoryTierManager {
    durable: Arc<dyn Storage>,
    session: Arc<dyn Storage>,
    entity: Arc<dyn Storage>,
    retry: RetryPolicy,
}

impl MemoryTierManager {
    pub fn new(durable: Arc<dyn Storage>, session: Arc<dyn Storage>, entity: Arc<dyn Storage>) -> Self {
        Self {
            durable,
            session,
            entity,
            retry: RetryPolicy::default(),
        }
    }

    /// SQLite durable store plus fresh in-memory session and entity stores.
    ///
    /// # Arguments
    /// * `durable_path` - Database file; the platform data directory when `None`.
    pub fn open(durable_path: Option<PathBuf>) -> Result<Self, anyhow::Error> {
        let durable = LTMSQLiteStorage::new(durable_path)?;
        log::debug!("durable memory at {}", durable.db_path.display());
        Ok(Self::new(
            Arc::new(durable),
            Arc::new(RAGStorage::default()),
            Arc::new(EntityStorage::new()),
        ))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn store(&self, scope: MemoryScope) -> &Arc<dyn Storage> {
        match scope {
            MemoryScope::Durable => &self.durable,
            MemoryScope::Session => &self.session,
            MemoryScope::Entity => &self.entity,
        }
    }

    async fn retrying<T, F, Fut>(&self, scope: MemoryScope, operation: &str, mut op: F) -> Result<T, MemoryUnavailable>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        let attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.retry.compute_backoff(attempt - 1);
                log::warn!(
                    "{} memory {} retry {}/{} after {:?}: {}",
                    scope,
                    operation,
                    attempt,
                    attempts - 1,
                    delay,
                    last_error
                );
                tokio::time::sleep(delay).await;
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => last_error = e.to_string(),
            }
        }

        log::error!("{} memory unavailable for {}: {}", scope, operation, last_error);
        Err(MemoryUnavailable {
            scope,
            operation: operation.to_string(),
            attempts,
            reason: last_error,
        })
    }

    /// Append a record to `scope`.
    pub async fn append(&self, scope: MemoryScope, key: &str, content: &str) -> Result<MemoryRecord, MemoryUnavailable> {
        self.append_with_metadata(scope, key, content, HashMap::new()).await
    }

    /// Append a record with metadata to `scope`.
    pub async fn append_with_metadata(
        &self,
        scope: MemoryScope,
        key: &str,
        content: &str,
        metadata: HashMap<String, Value>,
    ) -> Result<MemoryRecord, MemoryUnavailable> {
        let record = MemoryRecord::new(scope, key, content).with_metadata(metadata);
        let store = self.store(scope).clone();
        self.retrying(scope, "append", || {
            let store = store.clone();
            let record = record.clone();
            async move { store.append(record).await }
        })
        .await?;
        Ok(record)
    }

    /// Query `scope` by exact key, similarity probe or entity name.
    pub async fn query(&self, scope: MemoryScope, probe: &str, top_k: usize) -> Result<Vec<MemoryRecord>, MemoryUnavailable> {
        let store = self.store(scope).clone();
        self.retrying(scope, "query", || {
            let store = store.clone();
            let probe = probe.to_string();
            async move { store.query(&probe, top_k).await }
        })
        .await
    }

    /// Names of every entity recorded this session.
    pub async fn entity_names(&self) -> Result<Vec<String>, MemoryUnavailable> {
        let store = self.entity.clone();
        self.retrying(MemoryScope::Entity, "keys", || {
            let store = store.clone();
            async move { store.keys().await }
        })
        .await
    }

    /// Copy every `scope` record stored under `key` into durable memory.
    ///
    /// Returns the number of records promoted.
    pub async fn promote(&self, scope: MemoryScope, key: &str) -> Result<usize, MemoryUnavailable> {
        if scope == MemoryScope::Durable {
            return Ok(0);
        }
        let store = self.store(scope).clone();
        let records = self
            .retrying(scope, "promote", || {
                let store = store.clone();
                let key = key.to_string();
                async move { store.records_for_key(&key).await }
            })
            .await?;

        for record in &records {
            let mut metadata = record.metadata.clone();
            metadata.insert("promoted_from".to_string(), Value::String(scope.to_string()));
            self.append_with_metadata(MemoryScope::Durable, &record.key, &record.content, metadata)
                .await?;
        }
        if !records.is_empty() {
            log::debug!("promoted {} {} record(s) for '{}'", records.len(), scope, key);
        }
        Ok(records.len())
    }

    /// Flush durable memory.
    pub async fn flush(&self) -> Result<(), MemoryUnavailable> {
        let store = self.durable.clone();
        self.retrying(MemoryScope::Durable, "flush", || {
            let store = store.clone();
            async move { store.flush().await }
        })
        .await
    }

    /// Discard session and entity contents. Errors are logged, not raised.
    pub async fn close(&self) {
        for store in [&self.session, &self.entity] {
            if let Err(e) = store.reset().await {
                log::warn!("failed to discard {} memory: {}", store.scope(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    /// Fails the first `failures` calls, then delegates to an entity store.
    struct FlakyStorage {
        failures: u32,
        calls: AtomicU32,
        inner: EntityStorage,
    }

    impl FlakyStorage {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                inner: EntityStorage::new(),
            }
        }

        fn trip(&self) -> Result<(), anyhow::Error> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                anyhow::bail!("store offline");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        fn scope(&self) -> MemoryScope {
            MemoryScope::Durable
        }

        async fn append(&self, record: MemoryRecord) -> Result<(), anyhow::Error> {
            self.trip()?;
            self.inner.append(record).await
        }

        async fn query(&self, probe: &str, top_k: usize) -> Result<Vec<MemoryRecord>, anyhow::Error> {
            self.trip()?;
            self.inner.query(probe, top_k).await
        }

        async fn reset(&self) -> Result<(), anyhow::Error> {
            self.inner.reset().await
        }
    }

    fn manager(durable: Arc<dyn Storage>) -> MemoryTierManager {
        MemoryTierManager::new(durable, Arc::new(RAGStorage::default()), Arc::new(EntityStorage::new()))
            .with_retry(RetryPolicy::immediate(3))
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base_ms: 100,
            backoff_max_ms: 300,
        };
        assert_eq!(policy.compute_backoff(0), Duration::from_millis(100));
        assert_eq!(policy.compute_backoff(1), Duration::from_millis(200));
        assert_eq!(policy.compute_backoff(4), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_transient_store_failure_is_retried() {
        let mm = manager(Arc::new(FlakyStorage::new(2)));
        mm.append(MemoryScope::Durable, "k", "v").await.unwrap();
        let records = mm.query(MemoryScope::Durable, "k", 5).await.unwrap();
        assert_eq!(records[0].content, "v");
    }

    #[tokio::test]
    async fn test_persistent_failure_raises_memory_unavailable() {
        let mm = manager(Arc::new(FlakyStorage::new(u32::MAX)));
        let err = mm.append(MemoryScope::Durable, "k", "v").await.unwrap_err();
        assert_eq!(err.scope, MemoryScope::Durable);
        assert_eq!(err.attempts, 3);
        assert_eq!(err.operation, "append");
        assert!(err.reason.contains("offline"));
    }

    #[tokio::test]
    async fn test_durable_append_visible_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("durable.db");

        let first = MemoryTierManager::open(Some(path.clone())).unwrap();
        first.append(MemoryScope::Durable, "task-key", "prior report").await.unwrap();
        first.flush().await.unwrap();
        first.close().await;

        let second = MemoryTierManager::open(Some(path)).unwrap();
        let records = second.query(MemoryScope::Durable, "task-key", 3).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "prior report");
    }

    #[tokio::test]
    async fn test_promote_entity_into_durable() {
        let dir = tempfile::tempdir().unwrap();
        let mm = MemoryTierManager::open(Some(dir.path().join("d.db"))).unwrap();
        mm.append(MemoryScope::Entity, "Kongsberg", "Norwegian maritime group").await.unwrap();
        mm.append(MemoryScope::Entity, "Kongsberg", "Thruster retrofit programme").await.unwrap();

        assert_eq!(mm.promote(MemoryScope::Entity, "Kongsberg").await.unwrap(), 2);
        let durable = mm.query(MemoryScope::Durable, "Kongsberg", 10).await.unwrap();
        assert_eq!(durable.len(), 2);
        assert_eq!(durable[0].metadata["promoted_from"], "entity");
    }

    #[tokio::test]
    async fn test_close_discards_session_and_entity() {
        let dir = tempfile::tempdir().unwrap();
        let mm = MemoryTierManager::open(Some(dir.path().join("d.db"))).unwrap();
        mm.append(MemoryScope::Session, "t", "marine insight").await.unwrap();
        mm.append(MemoryScope::Entity, "Wartsila", "engine maker").await.unwrap();
        mm.close().await;
        assert!(mm.query(MemoryScope::Session, "marine insight", 5).await.unwrap().is_empty());
        assert!(mm.entity_names().await.unwrap().is_empty());
    }
}
