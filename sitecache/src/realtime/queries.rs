//! List-backed query state
//!
//! Holds the rows each open view last fetched. Realtime reconciliation either
//! patches a row here or invalidates the whole query, after which the owner
//! refetches from the server.

use crate::config::EVENT_CHANNEL_CAPACITY;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(String);

impl QueryKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for QueryKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct QueryCache {
    entries: RwLock<HashMap<QueryKey, Vec<Value>>>,
    invalidations: broadcast::Sender<QueryKey>,
}

impl QueryCache {
    pub fn new() -> Self {
        let (invalidations, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            invalidations,
        }
    }

    /// Store the result of a fetch
    pub async fn put(&self, key: QueryKey, rows: Vec<Value>) {
        tracing::debug!("Query {} loaded with {} rows", key, rows.len());
        self.entries.write().await.insert(key, rows);
    }

    pub async fn rows(&self, key: &QueryKey) -> Option<Vec<Value>> {
        self.entries.read().await.get(key).cloned()
    }

    /// Row with the given id, if the query currently holds it
    pub async fn row(&self, key: &QueryKey, id: &Value) -> Option<Value> {
        self.entries
            .read()
            .await
            .get(key)?
            .iter()
            .find(|row| row.get("id") == Some(id))
            .cloned()
    }

    /// Merge `fields` into one row in place; `false` if the row is not held
    pub async fn patch_row(&self, key: &QueryKey, id: &Value, fields: &Map<String, Value>) -> bool {
        let mut entries = self.entries.write().await;
        let Some(row) = entries
            .get_mut(key)
            .and_then(|rows| rows.iter_mut().find(|row| row.get("id") == Some(id)))
            .and_then(Value::as_object_mut)
        else {
            return false;
        };

        for (field, value) in fields {
            row.insert(field.clone(), value.clone());
        }
        tracing::debug!("Patched row {} in query {}", id, key);
        true
    }

    /// Drop the cached rows and announce a refetch.
    ///
    /// Repeating it leaves the same state behind; each call still announces.
    pub async fn invalidate(&self, key: &QueryKey) {
        self.entries.write().await.remove(key);
        tracing::debug!("Invalidated query {}", key);
        let _ = self.invalidations.send(key.clone());
    }

    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<QueryKey> {
        self.invalidations.subscribe()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}
