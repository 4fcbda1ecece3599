//! Realtime change notifications.
//!
//! Speaks the Phoenix channel protocol used by the hosted realtime service:
//! - Joins `realtime:{channel}` with a `postgres_changes` filter on one table
//! - Sends heartbeats on the `phoenix` topic
//! - Forwards every `postgres_changes` message as a [`ChangeEvent`]
//! - Reconnects with exponential backoff, signalling a re-fetch afterwards
//! - Leaves the channel when the feed is released

use std::time::Duration;

use catalog_core::{ChangeEvent, ChangeFeed, CollectionKind, StoreError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Protocol version sent in the connection URL.
pub const PROTOCOL_VERSION: &str = "1.0.0";

const HEARTBEAT_TOPIC: &str = "phoenix";
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const CHANGES_EVENT: &str = "postgres_changes";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Writer = SplitSink<Socket, Message>;
type Reader = SplitStream<Socket>;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Connection settings for one realtime endpoint.
#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    /// WebSocket endpoint, e.g. `wss://abc.supabase.co/realtime/v1/websocket`
    pub url: String,
    pub api_key: String,
    /// Sent in the join payload so row-level security applies
    pub access_token: Option<String>,
    pub schema: String,
    pub heartbeat: Duration,
    pub reconnect: ReconnectConfig,
}

impl RealtimeOptions {
    /// Full connection URL including the key and protocol version.
    pub fn endpoint(&self) -> String {
        format!(
            "{}?apikey={}&vsn={}",
            self.url, self.api_key, PROTOCOL_VERSION
        )
    }
}

/// One Phoenix protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// True for a change notification on `kind`'s channel.
    pub fn is_change_for(&self, kind: CollectionKind) -> bool {
        self.event == CHANGES_EVENT && self.topic == topic(kind)
    }

    /// True for the server's reply to the message sent with `reference`.
    pub fn is_reply_to(&self, reference: &str) -> bool {
        self.event == "phx_reply" && self.reference.as_deref() == Some(reference)
    }

    /// Error reason carried by a failed `phx_reply`.
    pub fn reply_error(&self) -> Option<String> {
        if self.event != "phx_reply" || self.payload["status"] != "error" {
            return None;
        }
        let reason = &self.payload["response"]["reason"];
        Some(
            reason
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| self.payload["response"].to_string()),
        )
    }
}

/// Channel topic for a collection.
pub fn topic(kind: CollectionKind) -> String {
    format!("realtime:{}", kind.channel_name())
}

/// Join request subscribing to every change on `kind`'s table.
pub fn join_message(
    kind: CollectionKind,
    schema: &str,
    access_token: Option<&str>,
    reference: &str,
) -> PhoenixMessage {
    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [
                { "event": "*", "schema": schema, "table": kind.table() }
            ]
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    PhoenixMessage {
        topic: topic(kind),
        event: "phx_join".to_string(),
        payload,
        reference: Some(reference.to_string()),
        join_ref: Some(reference.to_string()),
    }
}

pub fn heartbeat_message(reference: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: HEARTBEAT_TOPIC.to_string(),
        event: "heartbeat".to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
        join_ref: None,
    }
}

pub fn leave_message(kind: CollectionKind, reference: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: topic(kind),
        event: "phx_leave".to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
        join_ref: None,
    }
}

/// Open a channel for `kind` and return its change feed.
///
/// The first connection is made and the join acknowledged before returning,
/// so an unreachable endpoint or a refused join surfaces as an error here.
/// Later disconnects are retried in the background.
pub async fn subscribe(options: RealtimeOptions, kind: CollectionKind) -> Result<ChangeFeed, StoreError> {
    let mut refs = RefCounter::default();
    let (write, read) = open(&options, kind, &mut refs).await?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel();

    tokio::spawn(run(options, kind, write, read, refs, event_tx, stop_rx));

    Ok(ChangeFeed::new(kind, event_rx, move || {
        let _ = stop_tx.send(());
    }))
}

#[derive(Default)]
struct RefCounter(u64);

impl RefCounter {
    fn next(&mut self) -> String {
        self.0 += 1;
        self.0.to_string()
    }
}

async fn open(
    options: &RealtimeOptions,
    kind: CollectionKind,
    refs: &mut RefCounter,
) -> Result<(Writer, Reader), StoreError> {
    let (socket, _) = connect_async(options.endpoint())
        .await
        .map_err(|e| StoreError::Network(format!("realtime connect failed: {e}")))?;
    let (mut write, mut read) = socket.split();

    let join = join_message(
        kind,
        &options.schema,
        options.access_token.as_deref(),
        &refs.next(),
    );
    send(&mut write, &join).await?;

    let reference = join.reference.as_deref().unwrap_or_default();
    match tokio::time::timeout(JOIN_TIMEOUT, await_reply(&mut read, reference)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = write.close().await;
            return Err(e);
        }
        Err(_) => {
            let _ = write.close().await;
            return Err(StoreError::Timeout(format!("no reply to join on {}", join.topic)));
        }
    }
    debug!("Joined {}", join.topic);

    Ok((write, read))
}

/// Read frames until the reply to `reference` arrives.
async fn await_reply(read: &mut Reader, reference: &str) -> Result<(), StoreError> {
    while let Some(frame) = read.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(StoreError::Network(e.to_string())),
        };
        let message = match PhoenixMessage::from_text(text.as_str()) {
            Ok(message) if message.is_reply_to(reference) => message,
            Ok(_) => continue,
            Err(e) => {
                debug!("Ignoring unparseable realtime frame: {}", e);
                continue;
            }
        };
        if let Some(reason) = message.reply_error() {
            return Err(StoreError::PermissionDenied(reason));
        }
        return match message.payload["status"].as_str() {
            Some("ok") => Ok(()),
            status => Err(StoreError::Network(format!(
                "join on {} answered with status {:?}",
                message.topic, status
            ))),
        };
    }
    Err(StoreError::Network("realtime connection closed before join reply".into()))
}

async fn send(write: &mut Writer, message: &PhoenixMessage) -> Result<(), StoreError> {
    let text = message
        .to_text()
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    write
        .send(Message::text(text))
        .await
        .map_err(|e| StoreError::Network(e.to_string()))
}

enum Exit {
    /// The feed was released.
    Stopped,
    /// The connection dropped.
    Disconnected,
}

async fn run(
    options: RealtimeOptions,
    kind: CollectionKind,
    mut write: Writer,
    mut read: Reader,
    mut refs: RefCounter,
    events: mpsc::UnboundedSender<ChangeEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        match pump(&options, kind, &mut write, &mut read, &mut refs, &events, &mut stop).await {
            Exit::Stopped => {
                let leave = leave_message(kind, &refs.next());
                let _ = send(&mut write, &leave).await;
                let _ = write.close().await;
                debug!("Left {}", leave.topic);
                return;
            }
            Exit::Disconnected => {}
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(max) = options.reconnect.max_attempts {
                if attempt > max {
                    warn!("Giving up on {} realtime after {} attempts", kind, max);
                    return;
                }
            }

            let delay = calculate_backoff(attempt, &options.reconnect);
            info!("Reconnecting {} realtime in {:?} (attempt {})", kind, delay, attempt);
            tokio::select! {
                _ = &mut stop => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match open(&options, kind, &mut refs).await {
                Ok((w, r)) => {
                    write = w;
                    read = r;
                    // Changes made while disconnected were missed.
                    if events.send(ChangeEvent { kind }).is_err() {
                        return;
                    }
                    break;
                }
                Err(e) => warn!("Realtime reconnect for {} failed: {}", kind, e),
            }
        }
    }
}

async fn pump(
    options: &RealtimeOptions,
    kind: CollectionKind,
    write: &mut Writer,
    read: &mut Reader,
    refs: &mut RefCounter,
    events: &mpsc::UnboundedSender<ChangeEvent>,
    stop: &mut oneshot::Receiver<()>,
) -> Exit {
    let mut heartbeat = tokio::time::interval(options.heartbeat);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = &mut *stop => return Exit::Stopped,
            _ = heartbeat.tick() => {
                if let Err(e) = send(write, &heartbeat_message(&refs.next())).await {
                    warn!("Realtime heartbeat for {} failed: {}", kind, e);
                    return Exit::Disconnected;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match PhoenixMessage::from_text(text.as_str()) {
                    Ok(message) if message.is_change_for(kind) => {
                        debug!("Change notification on {}", message.topic);
                        if events.send(ChangeEvent { kind }).is_err() {
                            return Exit::Stopped;
                        }
                    }
                    Ok(message) => {
                        if let Some(reason) = message.reply_error() {
                            warn!("Realtime reply error on {}: {}", message.topic, reason);
                        }
                    }
                    Err(e) => debug!("Ignoring unparseable realtime frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("Realtime connection for {} closed", kind);
                    return Exit::Disconnected;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Realtime connection for {} failed: {}", kind, e);
                    return Exit::Disconnected;
                }
            }
        }
    }
}
