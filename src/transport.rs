use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{net::TcpStream, sync::mpsc, sync::Mutex};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::{
    errors::{TransportError, TransportResult},
    events::{ChangeEvent, EventKind},
    types::{ChannelName, EventTimestamp, Table},
};

/// One table-level interest sent to the transport when joining a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSpec {
    pub table: Table,
    pub event: EventKind,
    #[serde(default)]
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl TopicSpec {
    pub fn new(table: Table, event: EventKind, filter: Option<String>) -> Self {
        Self {
            table,
            event,
            schema: "public".to_string(),
            filter,
        }
    }
}

/// Connection status reported by the transport for a joined channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Active,
    Error,
    TimedOut,
    Closed,
}

/// A frame delivered on a joined channel.
#[derive(Debug, Clone)]
pub enum TransportFrame {
    Event(ChangeEvent),
    Status(ChannelStatus),
}

/// Seam to the backend change feed.
///
/// The transport may silently drop messages while a channel is disconnected;
/// no replay is requested on rejoin. Consumers needing strict consistency
/// after a gap re-fetch a snapshot.
#[async_trait]
pub trait ChangeTransport: Send + Sync {
    /// Joins (or rejoins in place) a channel with the full topic list.
    /// Resolves once the server confirms the subscription; subsequent frames
    /// arrive on the returned receiver.
    async fn subscribe(
        &self,
        channel: &ChannelName,
        topics: &[TopicSpec],
    ) -> TransportResult<mpsc::Receiver<TransportFrame>>;

    async fn unsubscribe(&self, channel: &ChannelName) -> TransportResult<()>;

    /// Liveness probe for a joined channel. `UnknownChannel` means the
    /// channel is already defunct on the transport side.
    async fn ping(&self, channel: &ChannelName) -> TransportResult<()>;
}

type WsWriter = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    Message,
>;

/// Connection settings for the bundled WebSocket transport.
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    pub host: String,
    pub path: String,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            path: "/feed".to_string(),
        }
    }
}

/// WebSocket-backed change-feed transport. Each pooled channel maps to one
/// socket; the pool drives reconnection, so a socket-level failure here just
/// surfaces as a status frame.
pub struct WsTransport {
    url: Url,
    auth_token: std::sync::Mutex<Option<String>>,
    writers: Mutex<HashMap<ChannelName, Arc<Mutex<WsWriter>>>>,
}

impl WsTransport {
    pub fn new(config: WsTransportConfig) -> TransportResult<Self> {
        let url = build_url(&config)?;
        Ok(Self {
            url,
            auth_token: std::sync::Mutex::new(None),
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Access token attached to subscribe frames, refreshed on session change.
    pub fn set_auth_token(&self, token: Option<String>) {
        *self.auth_token.lock().expect("token mutex poisoned") = token;
    }

    fn subscribe_payload(&self, channel: &ChannelName, topics: &[TopicSpec]) -> String {
        let mut payload = json!({
            "type": "subscribe",
            "channel": channel.as_str(),
            "topics": topics,
        });
        let token = self.auth_token.lock().expect("token mutex poisoned");
        if let Some(token) = token.as_deref() {
            payload["token"] = json!(token);
        }
        payload.to_string()
    }

    async fn drop_writer(&self, channel: &ChannelName) -> Option<Arc<Mutex<WsWriter>>> {
        self.writers.lock().await.remove(channel)
    }
}

#[async_trait]
impl ChangeTransport for WsTransport {
    async fn subscribe(
        &self,
        channel: &ChannelName,
        topics: &[TopicSpec],
    ) -> TransportResult<mpsc::Receiver<TransportFrame>> {
        // Rejoin in place: a previous socket for this channel is abandoned.
        if let Some(stale) = self.drop_writer(channel).await {
            let _ = stale.lock().await.close().await;
        }

        let (stream, _) = connect_async(self.url.as_str()).await?;
        let (mut write, mut read) = stream.split();
        write
            .send(Message::Text(self.subscribe_payload(channel, topics)))
            .await?;

        // Wait for the server's subscription acknowledgement before handing
        // the channel over; the pool bounds this whole call with its join
        // timeout.
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let ack: AckEnvelope = serde_json::from_str(&text)?;
                    match ack.kind.as_str() {
                        "subscribed" => break,
                        "error" => {
                            return Err(TransportError::InvalidFrame(
                                ack.reason.unwrap_or_else(|| "subscribe rejected".to_string()),
                            ))
                        }
                        _ => continue,
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
                None => return Err(TransportError::Closed),
            }
        }

        let writer = Arc::new(Mutex::new(write));
        self.writers
            .lock()
            .await
            .insert(channel.clone(), Arc::clone(&writer));

        let (frames_tx, frames_rx) = mpsc::channel(256);
        let reader_channel = channel.clone();
        tokio::spawn(async move {
            run_reader(reader_channel, read, frames_tx, writer).await;
        });
        Ok(frames_rx)
    }

    async fn unsubscribe(&self, channel: &ChannelName) -> TransportResult<()> {
        let Some(writer) = self.drop_writer(channel).await else {
            return Ok(());
        };
        let payload = json!({"type": "unsubscribe", "channel": channel.as_str()}).to_string();
        let mut writer = writer.lock().await;
        writer.send(Message::Text(payload)).await?;
        writer.close().await?;
        Ok(())
    }

    async fn ping(&self, channel: &ChannelName) -> TransportResult<()> {
        let writer = {
            let writers = self.writers.lock().await;
            writers
                .get(channel)
                .cloned()
                .ok_or_else(|| TransportError::UnknownChannel(channel.clone()))?
        };
        let payload = json!({"type": "ping"}).to_string();
        writer.lock().await.send(Message::Text(payload)).await?;
        Ok(())
    }
}

async fn run_reader(
    channel: ChannelName,
    mut read: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    frames: mpsc::Sender<TransportFrame>,
    writer: Arc<Mutex<WsWriter>>,
) {
    let terminal = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                match handle_text(&channel, &text, &frames, &writer).await {
                    Ok(true) => continue,
                    Ok(false) => break ChannelStatus::Closed,
                    Err(err) => {
                        tracing::warn!(channel = %channel, %err, "dropping malformed frame");
                    }
                }
            }
            Some(Ok(Message::Binary(binary))) => match String::from_utf8(binary) {
                Ok(text) => match handle_text(&channel, &text, &frames, &writer).await {
                    Ok(true) => continue,
                    Ok(false) => break ChannelStatus::Closed,
                    Err(err) => {
                        tracing::warn!(channel = %channel, %err, "dropping malformed frame");
                    }
                },
                Err(_) => {
                    tracing::warn!(channel = %channel, "dropping non-utf8 payload");
                }
            },
            Some(Ok(Message::Ping(payload))) => {
                let _ = writer.lock().await.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => break ChannelStatus::Closed,
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(err)) => {
                tracing::warn!(channel = %channel, %err, "websocket read error");
                break ChannelStatus::Error;
            }
            None => break ChannelStatus::Closed,
        }
    };
    let _ = frames.send(TransportFrame::Status(terminal)).await;
}

/// Returns Ok(false) when the server announced channel shutdown.
async fn handle_text(
    channel: &ChannelName,
    text: &str,
    frames: &mpsc::Sender<TransportFrame>,
    writer: &Arc<Mutex<WsWriter>>,
) -> TransportResult<bool> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| TransportError::InvalidFrame("missing type field".to_string()))?;
    match kind {
        "event" => {
            let envelope: EventEnvelope = serde_json::from_value(value)?;
            if envelope.channel != channel.as_str() {
                tracing::warn!(
                    channel = %channel,
                    got = %envelope.channel,
                    "event for unexpected channel"
                );
            }
            let _ = frames.send(TransportFrame::Event(envelope.into_event())).await;
            Ok(true)
        }
        "ping" => {
            let pong = json!({"type": "pong"}).to_string();
            let _ = writer.lock().await.send(Message::Text(pong)).await;
            Ok(true)
        }
        "pong" | "subscribed" | "unsubscribed" => Ok(true),
        "error" => {
            let _ = frames.send(TransportFrame::Status(ChannelStatus::Error)).await;
            Ok(true)
        }
        "closed" => Ok(false),
        other => {
            tracing::debug!(channel = %channel, kind = other, "ignoring unknown frame type");
            Ok(true)
        }
    }
}

#[derive(Debug, Deserialize)]
struct AckEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    channel: String,
    table: Table,
    #[serde(rename = "event")]
    kind: EventKind,
    row: Value,
    #[serde(default)]
    old_row: Option<Value>,
    #[serde(rename = "ts")]
    timestamp: EventTimestamp,
}

impl EventEnvelope {
    fn into_event(self) -> ChangeEvent {
        ChangeEvent {
            table: self.table,
            kind: self.kind,
            row: self.row,
            old_row: self.old_row,
            timestamp: self.timestamp,
        }
    }
}

fn build_url(config: &WsTransportConfig) -> TransportResult<Url> {
    let mut candidate = config.host.clone();
    if candidate.starts_with("https://") {
        candidate = candidate.replacen("https://", "wss://", 1);
    } else if candidate.starts_with("http://") {
        candidate = candidate.replacen("http://", "ws://", 1);
    } else if !candidate.starts_with("ws://") && !candidate.starts_with("wss://") {
        candidate = format!("wss://{candidate}");
    }

    let mut url = Url::parse(&candidate)?;
    url.set_path(&config.path);
    Ok(url)
}

#[cfg(test)]
pub(crate) mod mock {
    use std::{
        collections::{HashMap, HashSet},
        sync::Mutex,
    };

    use super::*;

    #[derive(Default)]
    struct MockState {
        channels: HashMap<ChannelName, mpsc::Sender<TransportFrame>>,
        topics: HashMap<ChannelName, Vec<TopicSpec>>,
        joins: HashMap<ChannelName, usize>,
        pending_join_failures: u32,
        failing_pings: HashSet<ChannelName>,
        defunct: HashSet<ChannelName>,
        pings: usize,
    }

    /// Scriptable in-memory transport for pool and client tests.
    #[derive(Default)]
    pub struct MockTransport {
        state: Mutex<MockState>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.state.lock().expect("mock mutex poisoned")
        }

        /// The next `count` subscribe calls fail.
        pub fn fail_next_joins(&self, count: u32) {
            self.lock().pending_join_failures = count;
        }

        pub fn set_ping_failure(&self, channel: &ChannelName, failing: bool) {
            let mut state = self.lock();
            if failing {
                state.failing_pings.insert(channel.clone());
            } else {
                state.failing_pings.remove(channel);
            }
        }

        /// Pings on this channel report `UnknownChannel`.
        pub fn mark_defunct(&self, channel: &ChannelName) {
            self.lock().defunct.insert(channel.clone());
        }

        pub fn joins(&self, channel: &ChannelName) -> usize {
            self.lock().joins.get(channel).copied().unwrap_or(0)
        }

        pub fn topics(&self, channel: &ChannelName) -> Vec<TopicSpec> {
            self.lock().topics.get(channel).cloned().unwrap_or_default()
        }

        pub fn ping_count(&self) -> usize {
            self.lock().pings
        }

        pub fn joined_channels(&self) -> Vec<ChannelName> {
            let mut names: Vec<ChannelName> = self.lock().channels.keys().cloned().collect();
            names.sort();
            names
        }

        pub async fn emit(&self, channel: &ChannelName, event: ChangeEvent) {
            let sender = self.lock().channels.get(channel).cloned();
            if let Some(sender) = sender {
                let _ = sender.send(TransportFrame::Event(event)).await;
            }
        }

        pub async fn emit_status(&self, channel: &ChannelName, status: ChannelStatus) {
            let sender = self.lock().channels.get(channel).cloned();
            if let Some(sender) = sender {
                let _ = sender.send(TransportFrame::Status(status)).await;
            }
        }
    }

    #[async_trait]
    impl ChangeTransport for MockTransport {
        async fn subscribe(
            &self,
            channel: &ChannelName,
            topics: &[TopicSpec],
        ) -> TransportResult<mpsc::Receiver<TransportFrame>> {
            let mut state = self.lock();
            *state.joins.entry(channel.clone()).or_insert(0) += 1;
            if state.pending_join_failures > 0 {
                state.pending_join_failures -= 1;
                return Err(TransportError::Closed);
            }
            let (tx, rx) = mpsc::channel(256);
            state.channels.insert(channel.clone(), tx);
            state.topics.insert(channel.clone(), topics.to_vec());
            state.defunct.remove(channel);
            Ok(rx)
        }

        async fn unsubscribe(&self, channel: &ChannelName) -> TransportResult<()> {
            let mut state = self.lock();
            state.channels.remove(channel);
            state.topics.remove(channel);
            Ok(())
        }

        async fn ping(&self, channel: &ChannelName) -> TransportResult<()> {
            let mut state = self.lock();
            state.pings += 1;
            if state.defunct.contains(channel) {
                return Err(TransportError::UnknownChannel(channel.clone()));
            }
            if state.failing_pings.contains(channel) {
                return Err(TransportError::Closed);
            }
            if !state.channels.contains_key(channel) {
                return Err(TransportError::UnknownChannel(channel.clone()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_schemes() {
        let url = build_url(&WsTransportConfig {
            host: "https://sync.example.com".to_string(),
            path: "/feed".to_string(),
        })
        .unwrap();
        assert_eq!(url.as_str(), "wss://sync.example.com/feed");

        let url = build_url(&WsTransportConfig {
            host: "sync.example.com".to_string(),
            path: "/feed".to_string(),
        })
        .unwrap();
        assert_eq!(url.as_str(), "wss://sync.example.com/feed");

        let url = build_url(&WsTransportConfig {
            host: "ws://localhost:4000".to_string(),
            path: "/feed".to_string(),
        })
        .unwrap();
        assert_eq!(url.as_str(), "ws://localhost:4000/feed");
    }

    #[test]
    fn test_event_envelope_parses() {
        let text = r#"{
            "type": "event",
            "channel": "sync:0",
            "table": "orders",
            "event": "update",
            "row": {"id": 7, "status": "ready"},
            "old_row": {"id": 7, "status": "preparing"},
            "ts": 1723000000000
        }"#;
        let value: Value = serde_json::from_str(text).unwrap();
        let envelope: EventEnvelope = serde_json::from_value(value).unwrap();
        let event = envelope.into_event();
        assert_eq!(event.table, Table::from("orders"));
        assert_eq!(event.kind, EventKind::Update);
        assert_eq!(event.row["status"], "ready");
        assert_eq!(event.old_row.unwrap()["status"], "preparing");
        assert_eq!(event.timestamp, EventTimestamp::millis(1_723_000_000_000));
    }

    #[test]
    fn test_topic_spec_serializes_filter_only_when_present() {
        let spec = TopicSpec::new(Table::from("orders"), EventKind::Insert, None);
        let text = serde_json::to_string(&spec).unwrap();
        assert!(!text.contains("filter"));

        let spec = TopicSpec::new(
            Table::from("orders"),
            EventKind::Insert,
            Some("server_id=eq.srv-1".to_string()),
        );
        let text = serde_json::to_string(&spec).unwrap();
        assert!(text.contains("server_id=eq.srv-1"));
    }
}
