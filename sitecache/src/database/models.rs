//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One key of the local key-value namespace
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredValue {
    pub key: String,
    /// Plain JSON text, no schema versioning
    pub value: String,
    pub updated_at: DateTime<Utc>,
}
