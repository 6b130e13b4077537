//! Storage module
//!
//! Local persistence for offline drafts and offline snapshots.

pub mod backend;
pub mod offline_store;

pub use backend::{MemoryStorage, SqliteStorage, StorageBackend};
pub use offline_store::OfflineStore;
