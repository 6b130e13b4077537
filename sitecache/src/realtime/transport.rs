//! Realtime transports
//!
//! A transport opens channels and delivers `ChannelMessage`s into a sink.
//! `Subscription` is the handle callers hold; releasing it, explicitly or by
//! drop, issues the one unsubscribe for that channel.

use super::channel::{ChangePayload, ChannelId, ChannelMessage, ChannelSpec, ChannelState};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

pub type ChannelSink = mpsc::UnboundedSender<ChannelMessage>;

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Open a channel; its messages go to `sink` until unsubscribed
    async fn subscribe(&self, spec: &ChannelSpec, sink: ChannelSink) -> Result<ChannelId>;

    /// Close a channel. Unknown ids are ignored.
    async fn unsubscribe(&self, id: ChannelId) -> Result<()>;
}

/// Handle to an open channel
pub struct Subscription {
    id: ChannelId,
    transport: Arc<dyn RealtimeTransport>,
    released: bool,
}

impl Subscription {
    pub async fn open(
        transport: Arc<dyn RealtimeTransport>,
        spec: &ChannelSpec,
        sink: ChannelSink,
    ) -> Result<Self> {
        let id = transport.subscribe(spec, sink).await?;
        tracing::debug!("Subscribed to channel {} ({})", spec.name, id);
        Ok(Self {
            id,
            transport,
            released: false,
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub async fn unsubscribe(mut self) -> Result<()> {
        self.released = true;
        tracing::debug!("Unsubscribing channel {}", self.id);
        self.transport.unsubscribe(self.id).await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let id = self.id;
        let transport = Arc::clone(&self.transport);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transport.unsubscribe(id).await {
                        tracing::warn!("Failed to unsubscribe dropped channel {}: {}", id, e);
                    }
                });
            }
            Err(_) => tracing::warn!("Channel {} dropped outside a runtime", id),
        }
    }
}

struct LocalChannel {
    spec: ChannelSpec,
    sink: ChannelSink,
}

/// In-process hub. Published changes reach every open channel whose
/// filters admit them.
#[derive(Default)]
pub struct LocalTransport {
    channels: Mutex<HashMap<ChannelId, LocalChannel>>,
    next_id: AtomicU64,
    unsubscribes: AtomicUsize,
    reject_subscribe: AtomicBool,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent subscribe calls fail
    pub fn reject_subscribe(&self, reject: bool) {
        self.reject_subscribe.store(reject, Ordering::SeqCst);
    }

    /// Deliver a change; returns how many channels received it
    pub async fn publish(&self, change: ChangePayload) -> usize {
        let channels = self.channels.lock().await;
        let mut delivered = 0;
        for channel in channels.values() {
            if channel.spec.admits(&change)
                && channel
                    .sink
                    .send(ChannelMessage::Change(change.clone()))
                    .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Push an error into every open channel with this name
    pub async fn fail_channel(&self, name: &str, reason: &str) {
        let channels = self.channels.lock().await;
        for channel in channels.values().filter(|c| c.spec.name == name) {
            let _ = channel
                .sink
                .send(ChannelMessage::State(ChannelState::Errored(reason.to_string())));
        }
    }

    pub async fn active_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .lock()
            .await
            .values()
            .map(|c| c.spec.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeTransport for LocalTransport {
    async fn subscribe(&self, spec: &ChannelSpec, sink: ChannelSink) -> Result<ChannelId> {
        if self.reject_subscribe.load(Ordering::SeqCst) {
            return Err(AppError::Realtime(format!(
                "subscription to {} was rejected",
                spec.name
            )));
        }

        let id = ChannelId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let _ = sink.send(ChannelMessage::State(ChannelState::Connecting));
        let _ = sink.send(ChannelMessage::State(ChannelState::Subscribed));
        self.channels.lock().await.insert(
            id,
            LocalChannel {
                spec: spec.clone(),
                sink,
            },
        );
        Ok(id)
    }

    async fn unsubscribe(&self, id: ChannelId) -> Result<()> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        if let Some(channel) = self.channels.lock().await.remove(&id) {
            let _ = channel
                .sink
                .send(ChannelMessage::State(ChannelState::Closed));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::channel::{ChangeAction, TableFilter};
    use serde_json::json;

    fn task_channel() -> ChannelSpec {
        ChannelSpec::new("tasks-p1").with_table(TableFilter::eq("tasks", "project_id", "p1"))
    }

    #[tokio::test]
    async fn test_publish_routes_admitted_changes() {
        let transport = Arc::new(LocalTransport::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = Subscription::open(transport.clone(), &task_channel(), tx)
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(ChannelMessage::State(ChannelState::Connecting))
        );
        assert_eq!(
            rx.recv().await,
            Some(ChannelMessage::State(ChannelState::Subscribed))
        );

        let matching = ChangePayload::new("tasks", ChangeAction::Insert)
            .with_new(json!({"id": "t1", "project_id": "p1"}));
        let foreign = ChangePayload::new("tasks", ChangeAction::Insert)
            .with_new(json!({"id": "t2", "project_id": "p2"}));

        assert_eq!(transport.publish(matching.clone()).await, 1);
        assert_eq!(transport.publish(foreign).await, 0);
        assert_eq!(rx.recv().await, Some(ChannelMessage::Change(matching)));
    }

    #[tokio::test]
    async fn test_explicit_unsubscribe_happens_once() {
        let transport = Arc::new(LocalTransport::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let sub = Subscription::open(transport.clone(), &task_channel(), tx)
            .await
            .unwrap();
        assert_eq!(transport.active_channels().await, vec!["tasks-p1"]);

        sub.unsubscribe().await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(transport.unsubscribe_count(), 1);
        assert!(transport.active_channels().await.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_handle_unsubscribes() {
        let transport = Arc::new(LocalTransport::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = Subscription::open(transport.clone(), &task_channel(), tx)
            .await
            .unwrap();

        drop(sub);

        loop {
            match rx.recv().await {
                Some(ChannelMessage::State(ChannelState::Closed)) => break,
                Some(_) => continue,
                None => panic!("sink closed before Closed state"),
            }
        }
        assert_eq!(transport.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_subscribe() {
        let transport = Arc::new(LocalTransport::new());
        transport.reject_subscribe(true);
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = Subscription::open(transport.clone(), &task_channel(), tx).await;
        assert!(matches!(result, Err(AppError::Realtime(_))));
        assert_eq!(transport.unsubscribe_count(), 0);
    }
}
