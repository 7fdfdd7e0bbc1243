//! Trait seam over the raw publish/subscribe socket, plus a WebSocket
//! implementation speaking a small JSON frame protocol.
//!
//! The coordinator core only depends on [`PushConnector`]/[`PushConnection`];
//! reconnect policy is the transport's own concern and is treated as opaque
//! by callers.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpStream, sync::broadcast, sync::Mutex, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Degraded => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Degraded,
            _ => ConnectionState::Disconnected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub endpoint: String,
    /// Identity announced to the broker; scopes the per-user channels.
    pub identity: i64,
}

/// Raw transport notifications. Payloads are untyped here; the adapter layer
/// decodes them into protocol events.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message {
        channel: String,
        event: String,
        payload: serde_json::Value,
    },
    StateChanged(ConnectionState),
}

#[async_trait]
pub trait PushConnection: Send + Sync {
    /// Joins a channel. Private channels require the `auth` token obtained
    /// from the authorizer handshake.
    async fn join(&self, channel: &str, auth: Option<&str>) -> Result<()>;
    async fn leave(&self, channel: &str) -> Result<()>;
    /// Fire-and-forget publish; no delivery guarantee, no retry.
    async fn publish(&self, channel: &str, event: &str, payload: serde_json::Value) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn state(&self) -> ConnectionState;
    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent>;
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn PushConnection>>;
}

/// Client-originated socket frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<String>,
    },
    Unsubscribe {
        channel: String,
    },
    Publish {
        channel: String,
        event: String,
        data: serde_json::Value,
    },
}

/// Broker-originated socket frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed {
        channel: String,
    },
    Event {
        channel: String,
        event: String,
        data: serde_json::Value,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WsPushConnection {
    sink: Mutex<WsSink>,
    state: AtomicU8,
    events: broadcast::Sender<TransportEvent>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsPushConnection {
    fn set_state(&self, next: ConnectionState) {
        let previous = ConnectionState::from_u8(self.state.swap(next.as_u8(), Ordering::SeqCst));
        if previous != next {
            let _ = self.events.send(TransportEvent::StateChanged(next));
        }
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
        let text = serde_json::to_string(frame).context("failed to encode client frame")?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text))
            .await
            .context("websocket send failed")
    }
}

#[async_trait]
impl PushConnection for WsPushConnection {
    async fn join(&self, channel: &str, auth: Option<&str>) -> Result<()> {
        self.send_frame(&ClientFrame::Subscribe {
            channel: channel.to_string(),
            auth: auth.map(str::to_string),
        })
        .await
    }

    async fn leave(&self, channel: &str) -> Result<()> {
        self.send_frame(&ClientFrame::Unsubscribe {
            channel: channel.to_string(),
        })
        .await
    }

    async fn publish(&self, channel: &str, event: &str, payload: serde_json::Value) -> Result<()> {
        self.send_frame(&ClientFrame::Publish {
            channel: channel.to_string(),
            event: event.to_string(),
            data: payload,
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

pub struct WsPushConnector;

#[async_trait]
impl PushConnector for WsPushConnector {
    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn PushConnection>> {
        let mut url = Url::parse(&options.endpoint)
            .with_context(|| format!("invalid transport endpoint: {}", options.endpoint))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(anyhow!("unsupported transport scheme: {other}")),
        }
        url.query_pairs_mut()
            .append_pair("identity", &options.identity.to_string());

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (sink, mut reader) = ws_stream.split();

        let (events, _) = broadcast::channel(1024);
        let connection = Arc::new(WsPushConnection {
            sink: Mutex::new(sink),
            state: AtomicU8::new(ConnectionState::Connected.as_u8()),
            events,
            reader_task: Mutex::new(None),
        });

        let pump = Arc::clone(&connection);
        let task = tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::Event {
                            channel,
                            event,
                            data,
                        }) => {
                            let _ = pump.events.send(TransportEvent::Message {
                                channel,
                                event,
                                payload: data,
                            });
                        }
                        Ok(ServerFrame::Subscribed { channel }) => {
                            debug!(channel, "transport: subscription confirmed");
                        }
                        Ok(ServerFrame::Error { message, channel }) => {
                            warn!(?channel, "transport: broker error: {message}");
                        }
                        Err(err) => {
                            warn!("transport: undecodable frame dropped: {err}");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("transport: websocket receive failed: {err}");
                        pump.set_state(ConnectionState::Degraded);
                        break;
                    }
                }
            }
            pump.set_state(ConnectionState::Disconnected);
        });
        *connection.reader_task.lock().await = Some(task);

        Ok(connection)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
