//! Durable persistence: the [`Store`] interface and its SQLite backend.

pub mod sqlite;
pub mod store;

pub use sqlite::SqliteStore;
pub use store::{AgentRecord, SessionMetadata, Store, StoreError, StoredMessage};
