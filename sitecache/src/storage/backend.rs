//! Storage backends
//!
//! A backend is a fallible key-value medium holding JSON text blobs.
//! `SqliteStorage` persists across sessions; `MemoryStorage` lives for the
//! process and can enforce a byte quota the way browser storage does.

use crate::database::{create_pool, Repository};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Key-value medium behind the offline store
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the blob stored under `key`
    async fn read(&self, key: &str) -> Result<Option<String>>;

    /// Replace the blob stored under `key`
    async fn write(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`; missing keys are not an error
    async fn remove(&self, key: &str) -> Result<()>;
}

/// SQLite-backed storage
#[derive(Clone)]
pub struct SqliteStorage {
    repo: Repository,
}

impl SqliteStorage {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Open (and migrate) the database file at `db_path`
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = create_pool(db_path).await?;
        Ok(Self::new(Repository::new(pool)))
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }
}

#[async_trait]
impl StorageBackend for SqliteStorage {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.repo.get_value(key).await?.map(|row| row.value))
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        self.repo.put_value(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.repo.delete_value(key).await
    }
}

/// In-process storage with an optional quota
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: Option<usize>,
    unavailable: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that rejects writes once the stored values exceed `bytes`
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            quota_bytes: Some(bytes),
            ..Self::default()
        }
    }

    /// Make every operation fail, as storage disabled by the host would
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn raw(&self, key: &str) -> Option<String> {
        self.entries.lock().await.get(key).cloned()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Storage("storage is unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;

        if let Some(quota) = self.quota_bytes {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = key.len() + value.len();
            let available = quota.saturating_sub(used);
            if needed > available {
                return Err(AppError::StorageQuota { needed, available });
            }
        }

        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.entries.lock().await.remove(key);
        Ok(())
    }
}
