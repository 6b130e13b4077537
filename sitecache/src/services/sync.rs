//! Reconciliation pass
//!
//! Runs when connectivity returns. Queued offline submissions are sent and
//! removed once acknowledged, then the offline snapshot is replaced with a
//! fresh full copy. There is no merge: the last full snapshot wins.

use crate::backend::{FormSubmissionBackend, SnapshotBackend};
use crate::models::FormFilter;
use crate::services::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::services::notifications::{Notification, Notifier};
use crate::storage::OfflineStore;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub skipped: bool,
    pub submitted: usize,
    pub failed: usize,
    pub snapshot_refreshed: bool,
}

pub struct SyncService {
    store: Arc<OfflineStore>,
    submissions: Arc<dyn FormSubmissionBackend>,
    snapshots: Arc<dyn SnapshotBackend>,
    connectivity: ConnectivityMonitor,
    notifier: Arc<dyn Notifier>,
}

impl SyncService {
    pub fn new(
        store: Arc<OfflineStore>,
        submissions: Arc<dyn FormSubmissionBackend>,
        snapshots: Arc<dyn SnapshotBackend>,
        connectivity: ConnectivityMonitor,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            submissions,
            snapshots,
            connectivity,
            notifier,
        }
    }

    /// Submit queued drafts and refresh the snapshot
    pub async fn reconcile(&self) -> SyncReport {
        if !self.connectivity.is_online() {
            tracing::debug!("Reconciliation skipped while offline");
            return SyncReport {
                skipped: true,
                ..SyncReport::default()
            };
        }

        tracing::info!("Starting reconciliation pass");
        let mut report = SyncReport::default();

        for record in self.store.list(&FormFilter::queued()).await {
            match self.submissions.submit_form(&record).await {
                Ok(()) => {
                    self.store.acknowledge_submission(&record.id).await;
                    report.submitted += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to submit offline form {}: {}", record.id, e);
                    report.failed += 1;
                }
            }
        }

        if report.submitted > 0 {
            self.notifier.notify(Notification::success(
                "Offline forms synced",
                format!("{} form(s) submitted after reconnecting.", report.submitted),
            ));
        }
        if report.failed > 0 {
            self.notifier.notify(Notification::error(
                "Some forms could not be submitted",
                format!("{} form(s) will be retried on the next sync.", report.failed),
            ));
        }

        match self.snapshots.fetch_snapshot().await {
            Ok(snapshot) => {
                tracing::info!(
                    "Offline snapshot refreshed: {} projects, {} tasks, {} team members",
                    snapshot.projects.len(),
                    snapshot.tasks.len(),
                    snapshot.team_members.len()
                );
                self.store.save_snapshot(snapshot).await;
                report.snapshot_refreshed = true;
            }
            Err(e) => tracing::warn!("Failed to refresh offline snapshot: {}", e),
        }

        report
    }

    /// Run `reconcile` on every return to online until `token` is cancelled
    pub fn spawn_on_reconnect(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let mut events = self.connectivity.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(ConnectivityEvent::WentOnline) => {
                            self.reconcile().await;
                        }
                        Ok(ConnectivityEvent::WentOffline) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("Reconnect listener lagged by {} events", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("Reconnect listener stopped");
        })
    }
}
