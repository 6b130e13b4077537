//! Scoped realtime listener
//!
//! Opens one channel, reconciles every delivered change into the query cache
//! and exposes the channel state. The listener lives until its view scope is
//! cancelled, `close()` is called or it is dropped; the channel is then
//! unsubscribed exactly once.

use super::channel::{ChannelMessage, ChannelSpec, ChannelState};
use super::queries::QueryCache;
use super::reconcile::{RealtimeUpdateEvent, Reconciler, TableBinding};
use super::transport::{RealtimeTransport, Subscription};
use crate::config::EVENT_CHANNEL_CAPACITY;
use crate::error::Result;
use crate::scope::ViewScope;
use crate::services::notifications::{Notification, Notifier};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct RealtimeListener {
    name: String,
    state: watch::Receiver<ChannelState>,
    updates: broadcast::Sender<RealtimeUpdateEvent>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RealtimeListener {
    pub async fn open(
        transport: Arc<dyn RealtimeTransport>,
        spec: ChannelSpec,
        bindings: Vec<TableBinding>,
        queries: Arc<QueryCache>,
        scope: &ViewScope,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let (sink, mut inbox) = mpsc::unbounded_channel();

        let subscription = match Subscription::open(transport, &spec, sink).await {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!("Failed to subscribe to {}: {}", spec.name, e);
                notifier.notify(Notification::error(
                    "Live updates unavailable",
                    format!("Could not subscribe to {}: {}", spec.name, e),
                ));
                return Err(e);
            }
        };

        let (state_tx, state) = watch::channel(ChannelState::Connecting);
        let (updates, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let token = scope.token().child_token();
        let reconciler = Reconciler::new(bindings);

        let task = {
            let token = token.clone();
            let updates = updates.clone();
            let name = spec.name.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        message = inbox.recv() => match message {
                            Some(ChannelMessage::Change(change)) => {
                                let outcome = reconciler.apply(&change, &queries).await;
                                tracing::debug!(
                                    "{} {} on {}: {:?}",
                                    name,
                                    change.event_type,
                                    change.table,
                                    outcome
                                );
                                if let Some(event) = RealtimeUpdateEvent::from_change(&change) {
                                    let _ = updates.send(event);
                                }
                            }
                            Some(ChannelMessage::State(next)) => {
                                if let ChannelState::Errored(reason) = &next {
                                    tracing::error!("Realtime channel {} errored: {}", name, reason);
                                    notifier.notify(Notification::error(
                                        "Live updates interrupted",
                                        reason.clone(),
                                    ));
                                }
                                let terminal = next.is_terminal();
                                state_tx.send_replace(next);
                                if terminal {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }

                if let Err(e) = subscription.unsubscribe().await {
                    tracing::warn!("Failed to unsubscribe {}: {}", name, e);
                }
                if !state_tx.borrow().is_terminal() {
                    state_tx.send_replace(ChannelState::Closed);
                }
                tracing::info!("Realtime listener {} stopped", name);
            })
        };

        tracing::info!("Realtime listener {} opened", spec.name);
        Ok(Self {
            name: spec.name,
            state,
            updates,
            token,
            task: Some(task),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<RealtimeUpdateEvent> {
        self.updates.subscribe()
    }

    /// Stop listening and wait for the unsubscribe to finish
    pub async fn close(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Realtime listener {} task failed: {}", self.name, e);
            }
        }
    }
}

impl Drop for RealtimeListener {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::channel::{ChangeAction, ChangePayload, TableFilter};
    use crate::realtime::queries::QueryKey;
    use crate::realtime::transport::LocalTransport;
    use crate::services::notifications::{NotificationCenter, NotificationVariant};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        transport: Arc<LocalTransport>,
        queries: Arc<QueryCache>,
        center: Arc<NotificationCenter>,
        key: QueryKey,
    }

    fn fixture() -> Fixture {
        Fixture {
            transport: Arc::new(LocalTransport::new()),
            queries: Arc::new(QueryCache::new()),
            center: Arc::new(NotificationCenter::new()),
            key: QueryKey::from("tasks:p1"),
        }
    }

    async fn open(f: &Fixture, scope: &ViewScope) -> Result<RealtimeListener> {
        RealtimeListener::open(
            f.transport.clone(),
            ChannelSpec::new("tasks-p1").with_table(TableFilter::eq("tasks", "project_id", "p1")),
            vec![TableBinding::new("tasks", f.key.clone()).patchable(["status"])],
            f.queries.clone(),
            scope,
            f.center.clone(),
        )
        .await
    }

    async fn wait_for_state(listener: &RealtimeListener, expected: ChannelState) {
        let mut rx = listener.watch_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == expected))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_insert_triggers_invalidation() {
        let f = fixture();
        let scope = ViewScope::new();
        let listener = open(&f, &scope).await.unwrap();
        let mut invalidations = f.queries.subscribe_invalidations();
        let mut updates = listener.subscribe_updates();
        wait_for_state(&listener, ChannelState::Subscribed).await;

        f.transport
            .publish(
                ChangePayload::new("tasks", ChangeAction::Insert)
                    .with_new(json!({"id": "t2", "project_id": "p1"})),
            )
            .await;

        assert_eq!(invalidations.recv().await.unwrap(), f.key);
        let event = updates.recv().await.unwrap();
        assert_eq!(event.entity_id, "t2");
        assert_eq!(event.project_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn test_scope_cancel_unsubscribes_once() {
        let f = fixture();
        let scope = ViewScope::new();
        let listener = open(&f, &scope).await.unwrap();
        wait_for_state(&listener, ChannelState::Subscribed).await;

        scope.cancel();
        wait_for_state(&listener, ChannelState::Closed).await;

        assert_eq!(f.transport.unsubscribe_count(), 1);
        assert!(f.transport.active_channels().await.is_empty());

        listener.close().await;
        assert_eq!(f.transport.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_failure_notifies() {
        let f = fixture();
        f.transport.reject_subscribe(true);
        let mut rx = f.center.subscribe();

        let scope = ViewScope::new();
        assert!(open(&f, &scope).await.is_err());

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.variant, NotificationVariant::Destructive);
        assert_eq!(notification.title, "Live updates unavailable");
    }

    #[tokio::test]
    async fn test_channel_error_notifies_and_stops() {
        let f = fixture();
        let scope = ViewScope::new();
        let listener = open(&f, &scope).await.unwrap();
        let mut rx = f.center.subscribe();
        wait_for_state(&listener, ChannelState::Subscribed).await;

        f.transport.fail_channel("tasks-p1", "replication slot lost").await;

        wait_for_state(
            &listener,
            ChannelState::Errored("replication slot lost".to_string()),
        )
        .await;
        assert_eq!(rx.recv().await.unwrap().title, "Live updates interrupted");

        listener.close().await;
        assert_eq!(f.transport.unsubscribe_count(), 1);
    }
}
