//! Repository layer for the local key-value table
//!
//! Every key holds one JSON text blob. Writes replace the whole value.

use super::models::StoredValue;
use crate::error::Result;
use chrono::Utc;
use sqlx::SqlitePool;

/// Repository for database operations
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the value stored under a key
    pub async fn get_value(&self, key: &str) -> Result<Option<StoredValue>> {
        let row = sqlx::query_as::<_, StoredValue>(
            r#"
            SELECT key, value, updated_at FROM local_storage WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Insert or replace the value stored under a key
    pub async fn put_value(&self, key: &str, value: &str) -> Result<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO local_storage (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Stored key: {} ({} bytes)", key, value.len());
        Ok(())
    }

    /// Remove a key; removing a missing key is not an error
    pub async fn delete_value(&self, key: &str) -> Result<()> {
        let rows = sqlx::query("DELETE FROM local_storage WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?
            .rows_affected();

        tracing::debug!("Deleted key: {} ({} rows)", key, rows);
        Ok(())
    }

    /// List all stored keys
    pub async fn list_keys(&self) -> Result<Vec<String>> {
        let keys = sqlx::query_scalar::<_, String>("SELECT key FROM local_storage ORDER BY key")
            .fetch_all(&self.pool)
            .await?;

        Ok(keys)
    }

    /// Close the underlying pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
