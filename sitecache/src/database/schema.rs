//! Local storage schema
//!
//! The applied schema version is kept in SQLite's `user_version` pragma.
//! Each entry of `MIGRATIONS` moves the schema one version forward.

use crate::error::Result;
use sqlx::sqlite::SqlitePool;
use sqlx::Connection;

const MIGRATIONS: &[&str] = &[include_str!("migrations/001_local_storage.sql")];

/// Apply every migration newer than the database's `user_version`
pub async fn initialize_database(pool: &SqlitePool) -> Result<()> {
    let mut conn = pool.acquire().await?;
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(&mut *conn)
        .await?;
    let applied = usize::try_from(version).unwrap_or(0);

    for (index, sql) in MIGRATIONS.iter().enumerate().skip(applied) {
        let target = index + 1;
        tracing::info!("Migrating local storage schema to version {}", target);

        let mut tx = conn.begin().await?;
        for statement in sql.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        // Pragmas take no bind parameters
        sqlx::query(&format!("PRAGMA user_version = {}", target))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    Ok(())
}
