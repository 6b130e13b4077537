//! Change classification
//!
//! Maps each row change to a patch or an invalidation of the query bound to
//! its table. Events are never replayed as a delta log: anything that is not
//! a safe single-row patch sends the view back to the server.

use super::channel::{ChangeAction, ChangePayload};
use super::queries::{QueryCache, QueryKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Which query a table feeds, and which of its columns can be patched in place
#[derive(Debug, Clone)]
pub struct TableBinding {
    pub table: String,
    pub query_key: QueryKey,
    pub patchable: HashSet<String>,
}

impl TableBinding {
    pub fn new(table: impl Into<String>, query_key: QueryKey) -> Self {
        Self {
            table: table.into(),
            query_key,
            patchable: HashSet::new(),
        }
    }

    pub fn patchable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patchable.extend(fields.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Patched { key: QueryKey, fields: Vec<String> },
    Invalidated(QueryKey),
    /// Update carried no difference from the held row
    Unchanged,
    /// No binding for the table
    Ignored,
}

pub struct Reconciler {
    bindings: HashMap<String, TableBinding>,
}

impl Reconciler {
    pub fn new(bindings: Vec<TableBinding>) -> Self {
        Self {
            bindings: bindings
                .into_iter()
                .map(|binding| (binding.table.clone(), binding))
                .collect(),
        }
    }

    pub async fn apply(&self, change: &ChangePayload, queries: &QueryCache) -> Reconciliation {
        let Some(binding) = self.bindings.get(&change.table) else {
            tracing::debug!("No binding for realtime table {}", change.table);
            return Reconciliation::Ignored;
        };
        let key = &binding.query_key;

        match change.event_type {
            ChangeAction::Insert | ChangeAction::Delete => invalidate(queries, key).await,
            ChangeAction::Update => {
                let (Some(id), Some(Value::Object(new))) = (change.row_id(), change.new.as_ref())
                else {
                    return invalidate(queries, key).await;
                };
                let Some(Value::Object(held)) = queries.row(key, id).await else {
                    return invalidate(queries, key).await;
                };

                let changed: Map<String, Value> = new
                    .iter()
                    .filter(|(field, value)| held.get(*field) != Some(*value))
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect();

                if changed.is_empty() {
                    return Reconciliation::Unchanged;
                }
                if !changed.keys().all(|field| binding.patchable.contains(field)) {
                    return invalidate(queries, key).await;
                }

                if queries.patch_row(key, id, &changed).await {
                    Reconciliation::Patched {
                        key: key.clone(),
                        fields: changed.keys().cloned().collect(),
                    }
                } else {
                    // Row vanished between lookup and patch
                    invalidate(queries, key).await
                }
            }
        }
    }
}

async fn invalidate(queries: &QueryCache, key: &QueryKey) -> Reconciliation {
    queries.invalidate(key).await;
    Reconciliation::Invalidated(key.clone())
}

/// Notification-level view of a row change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeUpdateEvent {
    pub entity_id: String,
    pub project_id: Option<String>,
    pub field_name: Option<String>,
    pub action: ChangeAction,
    pub actor_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RealtimeUpdateEvent {
    /// `None` when the payload carries no identifiable row
    pub fn from_change(change: &ChangePayload) -> Option<Self> {
        let record = change.record()?;
        let entity_id =
            text_field(record, "entity_id").or_else(|| change.row_id().and_then(as_text))?;

        let timestamp = change
            .commit_timestamp
            .or_else(|| date_field(record, "updated_at"))
            .or_else(|| date_field(record, "created_at"))
            .unwrap_or_else(Utc::now);

        Some(Self {
            entity_id,
            project_id: text_field(record, "project_id"),
            field_name: text_field(record, "field_name"),
            action: change.event_type,
            actor_id: text_field(record, "user_id").or_else(|| text_field(record, "actor_id")),
            timestamp,
        })
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_field(record: &Value, field: &str) -> Option<String> {
    record.get(field).and_then(as_text)
}

fn date_field(record: &Value, field: &str) -> Option<DateTime<Utc>> {
    record
        .get(field)?
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    fn board() -> (Reconciler, QueryKey) {
        let key = QueryKey::from("tasks:p1");
        let reconciler = Reconciler::new(vec![TableBinding::new("tasks", key.clone())
            .patchable(["status", "title", "updated_at"])]);
        (reconciler, key)
    }

    async fn seeded(key: &QueryKey) -> QueryCache {
        let queries = QueryCache::new();
        queries
            .put(
                key.clone(),
                vec![json!({"id": "t1", "status": "todo", "title": "Pour slab", "labels": []})],
            )
            .await;
        queries
    }

    #[tokio::test]
    async fn test_insert_for_unseen_row_invalidates_once() {
        let (reconciler, key) = board();
        let queries = seeded(&key).await;
        let mut rx = queries.subscribe_invalidations();

        let change = ChangePayload::new("tasks", ChangeAction::Insert)
            .with_new(json!({"id": "t2", "status": "todo"}));

        assert_eq!(
            reconciler.apply(&change, &queries).await,
            Reconciliation::Invalidated(key.clone())
        );
        assert_eq!(rx.try_recv().unwrap(), key);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_patchable_update_patches_without_invalidation() {
        let (reconciler, key) = board();
        let queries = seeded(&key).await;
        let mut rx = queries.subscribe_invalidations();

        let change = ChangePayload::new("tasks", ChangeAction::Update).with_new(
            json!({"id": "t1", "status": "done", "title": "Pour slab", "labels": []}),
        );

        assert_eq!(
            reconciler.apply(&change, &queries).await,
            Reconciliation::Patched {
                key: key.clone(),
                fields: vec!["status".to_string()],
            }
        );
        assert_eq!(queries.rows(&key).await.unwrap()[0]["status"], "done");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_label_update_invalidates() {
        let (reconciler, key) = board();
        let queries = seeded(&key).await;

        let change = ChangePayload::new("tasks", ChangeAction::Update)
            .with_new(json!({"id": "t1", "status": "todo", "labels": ["urgent"]}));

        assert_eq!(
            reconciler.apply(&change, &queries).await,
            Reconciliation::Invalidated(key.clone())
        );
        assert!(queries.rows(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_update_for_unknown_row_invalidates() {
        let (reconciler, key) = board();
        let queries = seeded(&key).await;

        let change = ChangePayload::new("tasks", ChangeAction::Update)
            .with_new(json!({"id": "t9", "status": "done"}));

        assert_eq!(
            reconciler.apply(&change, &queries).await,
            Reconciliation::Invalidated(key)
        );
    }

    #[tokio::test]
    async fn test_delete_invalidates_and_unbound_table_is_ignored() {
        let (reconciler, key) = board();
        let queries = seeded(&key).await;

        let delete =
            ChangePayload::new("tasks", ChangeAction::Delete).with_old(json!({"id": "t1"}));
        assert_eq!(
            reconciler.apply(&delete, &queries).await,
            Reconciliation::Invalidated(key)
        );

        let other = ChangePayload::new("documents", ChangeAction::Insert)
            .with_new(json!({"id": "d1"}));
        assert_eq!(
            reconciler.apply(&other, &queries).await,
            Reconciliation::Ignored
        );
    }

    #[test]
    fn test_update_event_from_audit_row() {
        let change = ChangePayload::new("audit_logs", ChangeAction::Insert).with_new(json!({
            "id": 31,
            "entity_id": "t1",
            "project_id": "p1",
            "field_name": "status",
            "user_id": "u7",
            "created_at": "2026-03-02T10:15:00Z"
        }));

        let event = RealtimeUpdateEvent::from_change(&change).unwrap();
        assert_eq!(event.entity_id, "t1");
        assert_eq!(event.project_id.as_deref(), Some("p1"));
        assert_eq!(event.field_name.as_deref(), Some("status"));
        assert_eq!(event.actor_id.as_deref(), Some("u7"));
        assert_eq!(event.timestamp.to_rfc3339(), "2026-03-02T10:15:00+00:00");
    }

    #[test]
    fn test_update_event_falls_back_to_row_id() {
        let change =
            ChangePayload::new("project_members", ChangeAction::Delete).with_old(json!({"id": 4}));

        let event = RealtimeUpdateEvent::from_change(&change).unwrap();
        assert_eq!(event.entity_id, "4");
        assert_eq!(event.action, ChangeAction::Delete);
        assert!(event.project_id.is_none());

        let empty = ChangePayload::new("project_members", ChangeAction::Delete);
        assert!(RealtimeUpdateEvent::from_change(&empty).is_none());
    }
}
