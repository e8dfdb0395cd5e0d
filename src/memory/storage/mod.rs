//! Storage backends for the memory system.

pub mod entity_storage;
pub mod interface;
pub mod ltm_sqlite_storage;
pub mod rag_storage;

pub use entity_storage::EntityStorage;
pub use interface::Storage;
pub use ltm_sqlite_storage::LTMSQLiteStorage;
pub use rag_storage::RAGStorage;
