//! Phoenix websocket transport
//!
//! Speaks the hosted realtime protocol over one socket: `phx_join` per channel
//! carrying its `postgres_changes` filters, heartbeats on the `phoenix` topic,
//! `phx_leave` on unsubscribe. Replies, errors and closes are mapped onto
//! channel states.

use super::channel::{
    non_empty, ChangeAction, ChangePayload, ChannelId, ChannelMessage, ChannelSpec, ChannelState,
};
use super::transport::{ChannelSink, RealtimeTransport};
use crate::config::REALTIME_HEARTBEAT;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;

const SOCKET_TOPIC: &str = "phoenix";

/// Wire frame of the JSON serializer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

/// Server shape of a row change
#[derive(Debug, Deserialize)]
struct WireChange {
    schema: String,
    table: String,
    #[serde(rename = "type")]
    action: ChangeAction,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
    #[serde(default)]
    commit_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChangeEnvelope {
    data: WireChange,
}

impl From<WireChange> for ChangePayload {
    fn from(wire: WireChange) -> Self {
        ChangePayload {
            schema: wire.schema,
            table: wire.table,
            event_type: wire.action,
            new: wire.record.and_then(non_empty),
            old: wire.old_record.and_then(non_empty),
            commit_timestamp: wire
                .commit_timestamp
                .as_deref()
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc)),
        }
    }
}

enum Command {
    Join {
        id: ChannelId,
        spec: ChannelSpec,
        sink: ChannelSink,
    },
    Leave {
        id: ChannelId,
    },
}

pub struct PhoenixTransport {
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    task: JoinHandle<()>,
}

impl PhoenixTransport {
    /// Open the socket. `url` is the full websocket URL including `apikey`
    /// and `vsn` query parameters.
    pub async fn connect(url: Url, access_token: Option<String>) -> Result<Self> {
        Self::connect_with_heartbeat(url, access_token, REALTIME_HEARTBEAT).await
    }

    pub async fn connect_with_heartbeat(
        url: Url,
        access_token: Option<String>,
        heartbeat: Duration,
    ) -> Result<Self> {
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        tracing::info!(
            "Realtime socket connected to {}",
            url.host_str().unwrap_or("localhost")
        );

        let (commands, inbox) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(socket, inbox, access_token, heartbeat));

        Ok(Self {
            commands,
            next_id: AtomicU64::new(0),
            task,
        })
    }

    pub fn is_connected(&self) -> bool {
        !self.task.is_finished()
    }
}

#[async_trait]
impl RealtimeTransport for PhoenixTransport {
    async fn subscribe(&self, spec: &ChannelSpec, sink: ChannelSink) -> Result<ChannelId> {
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.commands
            .send(Command::Join {
                id,
                spec: spec.clone(),
                sink,
            })
            .map_err(|_| AppError::Realtime("realtime socket is closed".to_string()))?;
        Ok(id)
    }

    async fn unsubscribe(&self, id: ChannelId) -> Result<()> {
        // A closed socket has already dropped every channel
        if self.commands.send(Command::Leave { id }).is_err() {
            tracing::debug!("Realtime socket already closed when leaving {}", id);
        }
        Ok(())
    }
}

struct OpenChannel {
    topic: String,
    join_ref: String,
    sink: ChannelSink,
}

#[derive(Default)]
struct SocketState {
    channels: HashMap<ChannelId, OpenChannel>,
    topics: HashMap<String, ChannelId>,
    pending_joins: HashMap<String, ChannelId>,
    access_token: Option<String>,
    next_ref: u64,
}

impl SocketState {
    fn next_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    /// Join `spec` on the socket. A channel already holding the topic is
    /// closed and left first; its own late leave is then a no-op.
    fn join(
        &mut self,
        id: ChannelId,
        spec: ChannelSpec,
        sink: ChannelSink,
    ) -> Vec<PhoenixMessage> {
        let topic = format!("realtime:{}", spec.name);
        let mut outgoing = Vec::new();
        if let Some(previous) = self.topics.get(&topic).copied() {
            tracing::debug!("Channel {} replaces {} on {}", id, previous, topic);
            outgoing.extend(self.leave(previous));
        }

        let join_ref = self.next_ref();
        let _ = sink.send(ChannelMessage::State(ChannelState::Connecting));

        let mut payload = json!({
            "config": {
                "broadcast": {"ack": false, "self": false},
                "presence": {"key": ""},
                "postgres_changes": postgres_changes(&spec),
                "private": false
            }
        });
        if let Some(token) = &self.access_token {
            payload["access_token"] = json!(token);
        }

        self.pending_joins.insert(join_ref.clone(), id);
        self.topics.insert(topic.clone(), id);
        self.channels.insert(
            id,
            OpenChannel {
                topic: topic.clone(),
                join_ref: join_ref.clone(),
                sink,
            },
        );

        outgoing.push(PhoenixMessage {
            topic,
            event: "phx_join".to_string(),
            payload,
            msg_ref: Some(join_ref.clone()),
            join_ref: Some(join_ref),
        });
        outgoing
    }

    fn leave(&mut self, id: ChannelId) -> Option<PhoenixMessage> {
        let channel = self.remove(id)?;
        let _ = channel.sink.send(ChannelMessage::State(ChannelState::Closed));
        Some(PhoenixMessage {
            topic: channel.topic,
            event: "phx_leave".to_string(),
            payload: json!({}),
            msg_ref: Some(self.next_ref()),
            join_ref: Some(channel.join_ref),
        })
    }

    fn heartbeat(&mut self) -> PhoenixMessage {
        PhoenixMessage {
            topic: SOCKET_TOPIC.to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            msg_ref: Some(self.next_ref()),
            join_ref: None,
        }
    }

    fn remove(&mut self, id: ChannelId) -> Option<OpenChannel> {
        let channel = self.channels.remove(&id)?;
        if self.topics.get(&channel.topic) == Some(&id) {
            self.topics.remove(&channel.topic);
        }
        self.pending_joins.retain(|_, pending| *pending != id);
        Some(channel)
    }

    /// Channel currently holding the message's topic. Frames tagged with the
    /// join ref of a replaced channel resolve to nothing.
    fn current(&self, message: &PhoenixMessage) -> Option<ChannelId> {
        let id = self.topics.get(&message.topic).copied()?;
        let channel = self.channels.get(&id)?;
        match &message.join_ref {
            Some(join_ref) if *join_ref != channel.join_ref => None,
            _ => Some(id),
        }
    }

    fn set_state(&mut self, id: ChannelId, state: ChannelState) {
        let terminal = state.is_terminal();
        if let Some(channel) = self.channels.get(&id) {
            let _ = channel.sink.send(ChannelMessage::State(state));
        }
        if terminal {
            self.remove(id);
        }
    }

    fn handle(&mut self, message: PhoenixMessage) {
        match message.event.as_str() {
            "phx_reply" if message.topic == SOCKET_TOPIC => {}
            "phx_reply" => {
                let Some(id) = message
                    .msg_ref
                    .as_ref()
                    .and_then(|r| self.pending_joins.remove(r))
                else {
                    return;
                };
                let state = if message.payload["status"] == "ok" {
                    ChannelState::Subscribed
                } else {
                    ChannelState::Errored(reply_reason(&message.payload))
                };
                if let Some(channel) = self.channels.get(&id) {
                    tracing::debug!("Join reply for {}: {:?}", channel.topic, state);
                }
                self.set_state(id, state);
            }
            "postgres_changes" => {
                let Some(id) = self.current(&message) else {
                    return;
                };
                match serde_json::from_value::<ChangeEnvelope>(message.payload) {
                    Ok(envelope) => {
                        if let Some(channel) = self.channels.get(&id) {
                            let _ = channel
                                .sink
                                .send(ChannelMessage::Change(envelope.data.into()));
                        }
                    }
                    Err(e) => tracing::warn!("Malformed change on {}: {}", message.topic, e),
                }
            }
            "phx_error" | "phx_close" | "system" => {
                let Some(id) = self.current(&message) else {
                    tracing::debug!("Ignoring {} for a replaced channel", message.event);
                    return;
                };
                match message.event.as_str() {
                    "phx_error" => {
                        self.set_state(id, ChannelState::Errored("channel error".to_string()))
                    }
                    "phx_close" => self.set_state(id, ChannelState::Closed),
                    _ if message.payload["status"] == "error" => {
                        let reason = message.payload["message"]
                            .as_str()
                            .unwrap_or("realtime system error")
                            .to_string();
                        self.set_state(id, ChannelState::Errored(reason));
                    }
                    _ => {}
                }
            }
            other => tracing::debug!("Ignoring {} on {}", other, message.topic),
        }
    }

    fn fail_all(&mut self, reason: &str) {
        for (_, channel) in self.channels.drain() {
            let _ = channel
                .sink
                .send(ChannelMessage::State(ChannelState::Errored(reason.to_string())));
        }
        self.topics.clear();
        self.pending_joins.clear();
    }
}

fn postgres_changes(spec: &ChannelSpec) -> Vec<Value> {
    spec.filters
        .iter()
        .map(|filter| {
            let mut entry = json!({
                "event": "*",
                "schema": spec.schema,
                "table": filter.table,
            });
            if let Some(expr) = &filter.filter {
                entry["filter"] = json!(expr);
            }
            entry
        })
        .collect()
}

fn reply_reason(payload: &Value) -> String {
    match &payload["response"]["reason"] {
        Value::String(reason) => reason.clone(),
        _ => format!("join rejected: {}", payload["response"]),
    }
}

async fn send<W>(writer: &mut W, message: &PhoenixMessage) -> Result<()>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(message)?;
    writer.send(Message::Text(text.into())).await?;
    Ok(())
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run_socket(
    socket: Socket,
    mut commands: mpsc::UnboundedReceiver<Command>,
    access_token: Option<String>,
    heartbeat: Duration,
) {
    let (mut writer, mut reader) = socket.split();
    let mut state = SocketState {
        access_token,
        ..SocketState::default()
    };
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

    'socket: loop {
        let outgoing: Vec<PhoenixMessage> = tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Join { id, spec, sink }) => state.join(id, spec, sink),
                Some(Command::Leave { id }) => state.leave(id).into_iter().collect(),
                None => {
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<PhoenixMessage>(text.as_str()) {
                        Ok(message) => state.handle(message),
                        Err(e) => tracing::warn!("Unreadable realtime frame: {}", e),
                    }
                    Vec::new()
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::warn!("Realtime socket closed by server");
                    state.fail_all("connection closed");
                    break;
                }
                Some(Ok(_)) => Vec::new(),
                Some(Err(e)) => {
                    tracing::error!("Realtime socket error: {}", e);
                    state.fail_all(&e.to_string());
                    break;
                }
            },
            _ = ticker.tick() => vec![state.heartbeat()],
        };

        for message in &outgoing {
            if let Err(e) = send(&mut writer, message).await {
                tracing::error!("Failed to write realtime frame: {}", e);
                state.fail_all(&e.to_string());
                break 'socket;
            }
        }
    }

    tracing::info!("Realtime socket task stopped");
}
