//! Memory system for the crew.
//!
//! Three independent stores share one [`Storage`] contract:
//!
//! - **Durable** – exact-key records persisted across sessions (SQLite).
//! - **Session** – per-run records retrieved by semantic similarity.
//! - **Entity** – per-run records keyed by entity name, in insertion order.
//!
//! [`MemoryTierManager`] wraps the three with bounded retries and
//! [`ContextualMemory`] blends them into the context handed to each agent.

pub mod contextual;
pub mod embedding;
pub mod memory;
pub mod storage;
pub mod tiers;

pub use contextual::{ContextBundle, ContextualMemory};
pub use embedding::{EmbeddingProvider, LocalEmbedding};
pub use memory::{MemoryRecord, MemoryScope};
pub use storage::Storage;
pub use tiers::{MemoryTierManager, RetryPolicy};
