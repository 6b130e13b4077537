//! Offline store
//!
//! In-memory drafts and snapshot, mirrored to a storage backend under two
//! namespaces (`offline_forms`, `offlineData`). The memory copy is always the
//! source of truth for the session: a failed write is logged and the store is
//! marked degraded, callers never see the error.

use crate::config::{OFFLINE_DATA_KEY, OFFLINE_FORMS_KEY};
use crate::models::{
    timestamp_now, FormDraft, FormFilter, FormPatch, OfflineFormRecord, OfflineSnapshot,
};
use crate::storage::StorageBackend;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct StoreState {
    forms: Vec<OfflineFormRecord>,
    snapshot: Option<OfflineSnapshot>,
    degraded: bool,
}

/// Local persistence for offline drafts and the offline snapshot
pub struct OfflineStore {
    backend: Arc<dyn StorageBackend>,
    state: RwLock<StoreState>,
}

impl OfflineStore {
    /// Hydrate from the backend. Unreadable or malformed namespaces start empty.
    pub async fn init(backend: Arc<dyn StorageBackend>) -> Self {
        let forms: Vec<OfflineFormRecord> = load_namespace(backend.as_ref(), OFFLINE_FORMS_KEY)
            .await
            .unwrap_or_default();
        let snapshot: Option<OfflineSnapshot> =
            load_namespace(backend.as_ref(), OFFLINE_DATA_KEY).await;

        tracing::info!(
            "Offline store hydrated: {} drafts, snapshot present: {}",
            forms.len(),
            snapshot.is_some()
        );

        Self {
            backend,
            state: RwLock::new(StoreState {
                forms,
                snapshot,
                degraded: false,
            }),
        }
    }

    /// Save a new draft. Drafts for the same template coexist.
    pub async fn save(&self, draft: FormDraft) -> OfflineFormRecord {
        let record = OfflineFormRecord {
            id: Uuid::new_v4().to_string(),
            form_template_id: draft.form_template_id,
            form_name: draft.form_name,
            data: draft.data,
            timestamp: timestamp_now(),
            is_submitted: false,
        };

        let mut state = self.state.write().await;
        state.forms.push(record.clone());
        self.persist_forms(&mut state).await;

        tracing::info!(
            "Saved offline draft {} for template {}",
            record.id,
            record.form_template_id
        );
        record
    }

    /// Apply a patch and renew the timestamp. Unknown ids return `None`.
    pub async fn update(&self, id: &str, patch: FormPatch) -> Option<OfflineFormRecord> {
        let mut state = self.state.write().await;

        let updated = {
            let record = state.forms.iter_mut().find(|r| r.id == id)?;
            if let Some(form_name) = patch.form_name {
                record.form_name = form_name;
            }
            if let Some(data) = patch.data {
                record.data = data;
            }
            if let Some(is_submitted) = patch.is_submitted {
                record.is_submitted = is_submitted;
            }
            record.timestamp = timestamp_now();
            record.clone()
        };

        self.persist_forms(&mut state).await;
        tracing::debug!("Updated offline draft {}", id);
        Some(updated)
    }

    /// Delete a draft; returns whether it existed
    pub async fn delete(&self, id: &str) -> bool {
        let mut state = self.state.write().await;
        let before = state.forms.len();
        state.forms.retain(|r| r.id != id);

        if state.forms.len() == before {
            return false;
        }

        self.persist_forms(&mut state).await;
        tracing::debug!("Deleted offline draft {}", id);
        true
    }

    pub async fn get(&self, id: &str) -> Option<OfflineFormRecord> {
        let state = self.state.read().await;
        state.forms.iter().find(|r| r.id == id).cloned()
    }

    /// Drafts matching `filter`, in save order
    pub async fn list(&self, filter: &FormFilter) -> Vec<OfflineFormRecord> {
        let state = self.state.read().await;
        state
            .forms
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    /// Drop every draft
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.forms.clear();
        self.remove_namespace(&mut state, OFFLINE_FORMS_KEY).await;
        tracing::info!("Cleared offline drafts");
    }

    pub async fn mark_submitted(&self, id: &str) -> Option<OfflineFormRecord> {
        self.update(
            id,
            FormPatch {
                is_submitted: Some(true),
                ..FormPatch::default()
            },
        )
        .await
    }

    /// The server acknowledged the submission; the draft stops being authoritative
    pub async fn acknowledge_submission(&self, id: &str) -> bool {
        let removed = self.delete(id).await;
        if removed {
            tracing::info!("Draft {} acknowledged by server and removed", id);
        }
        removed
    }

    /// Replace the snapshot wholesale (last full snapshot wins)
    pub async fn save_snapshot(&self, snapshot: OfflineSnapshot) {
        let mut state = self.state.write().await;
        state.snapshot = Some(snapshot);
        self.persist_snapshot(&mut state).await;
    }

    pub async fn snapshot(&self) -> Option<OfflineSnapshot> {
        self.state.read().await.snapshot.clone()
    }

    pub async fn clear_snapshot(&self) {
        let mut state = self.state.write().await;
        state.snapshot = None;
        self.remove_namespace(&mut state, OFFLINE_DATA_KEY).await;
    }

    /// Whether a write failed during this session
    pub async fn is_degraded(&self) -> bool {
        self.state.read().await.degraded
    }

    /// Final flush of both namespaces
    pub async fn teardown(&self) {
        let mut state = self.state.write().await;
        self.persist_forms(&mut state).await;
        if state.snapshot.is_some() {
            self.persist_snapshot(&mut state).await;
        }
        tracing::info!("Offline store flushed (degraded: {})", state.degraded);
    }

    async fn persist_forms(&self, state: &mut StoreState) {
        let ok = write_namespace(self.backend.as_ref(), OFFLINE_FORMS_KEY, &state.forms).await;
        if !ok {
            state.degraded = true;
        }
    }

    async fn persist_snapshot(&self, state: &mut StoreState) {
        if let Some(snapshot) = &state.snapshot {
            let ok = write_namespace(self.backend.as_ref(), OFFLINE_DATA_KEY, snapshot).await;
            if !ok {
                state.degraded = true;
            }
        }
    }

    async fn remove_namespace(&self, state: &mut StoreState, key: &str) {
        if let Err(e) = self.backend.remove(key).await {
            tracing::error!("Failed to remove {} from storage: {}", key, e);
            state.degraded = true;
        }
    }
}

async fn load_namespace<T: DeserializeOwned>(backend: &dyn StorageBackend, key: &str) -> Option<T> {
    let raw = match backend.read(key).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!("Failed to read {} from storage, starting empty: {}", key, e);
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Discarding malformed {} blob: {}", key, e);
            None
        }
    }
}

async fn write_namespace<T: Serialize + ?Sized>(
    backend: &dyn StorageBackend,
    key: &str,
    value: &T,
) -> bool {
    let json = match serde_json::to_string(value) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to serialize {}: {}", key, e);
            return false;
        }
    };

    match backend.write(key, &json).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("Failed to persist {}, keeping in-memory copy: {}", key, e);
            false
        }
    }
}
