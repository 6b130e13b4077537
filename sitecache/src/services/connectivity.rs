//! Connectivity monitor
//!
//! Two-state machine fed by the host's network-status signal. The host signal
//! is trusted as is; nothing here probes the network. Transitions are
//! edge-triggered: one event per real change, none for a repeated status.

use crate::config::EVENT_CHANNEL_CAPACITY;
use serde::Serialize;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn from_online(online: bool) -> Self {
        if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectivityEvent {
    WentOnline,
    WentOffline,
}

/// Tracks online/offline transitions
#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: watch::Sender<ConnectivityState>,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    /// Create a monitor seeded with the status the host reports at startup
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(ConnectivityState::from_online(initially_online));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        tracing::info!(
            "Connectivity monitor started ({})",
            if initially_online { "online" } else { "offline" }
        );
        Self { state, events }
    }

    /// Feed a host status report; returns the transition it caused, if any
    pub fn report(&self, online: bool) -> Option<ConnectivityEvent> {
        let next = ConnectivityState::from_online(online);
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });

        if !changed {
            return None;
        }

        let event = match next {
            ConnectivityState::Online => ConnectivityEvent::WentOnline,
            ConnectivityState::Offline => ConnectivityEvent::WentOffline,
        };
        tracing::info!("Connectivity changed: {:?}", event);
        let _ = self.events.send(event);
        Some(event)
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    /// Transition events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    /// Persistent state, for the connectivity indicator
    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }
}
