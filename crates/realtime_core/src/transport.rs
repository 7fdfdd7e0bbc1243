//! Channel Transport Adapter: owns the connection/channel lifecycle on top
//! of the raw push socket, and nothing else. Business state lives in the
//! store; the adapter only remembers which identity is connected and which
//! channels are joined.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use push_transport::{
    ConnectOptions, ConnectionState, PushConnection, PushConnector, TransportEvent,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{domain::UserId, error::ApiError};
use thiserror::Error;
use tokio::{sync::broadcast, sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

pub fn user_channel(user_id: UserId) -> String {
    format!("private-user.{}", user_id.0)
}

pub fn conversation_channel(conversation_id: shared::domain::ConversationId) -> String {
    format!("private-conversation.{}", conversation_id.0)
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    /// The authorizer rejected the join. The connection itself is fine.
    #[error("channel join rejected for {channel}: {message}")]
    Rejected { channel: String, message: String },
    #[error("not connected to the push transport")]
    NotConnected,
    #[error("channel subscription failed: {0}")]
    Transport(#[from] anyhow::Error),
}

/// External endpoint validating private channel joins. Returns an opaque
/// auth token on success; failure is a 4xx-style rejection, not a crash.
#[async_trait]
pub trait ChannelAuthorizer: Send + Sync {
    async fn authorize(&self, identity: UserId, channel: &str) -> Result<String, SubscribeError>;
}

#[derive(Serialize)]
struct AuthorizeRequest<'a> {
    channel_name: &'a str,
    identity: i64,
}

#[derive(Deserialize)]
struct AuthorizeResponse {
    auth: String,
}

pub struct HttpChannelAuthorizer {
    http: Client,
    endpoint: String,
}

impl HttpChannelAuthorizer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ChannelAuthorizer for HttpChannelAuthorizer {
    async fn authorize(&self, identity: UserId, channel: &str) -> Result<String, SubscribeError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&AuthorizeRequest {
                channel_name: channel,
                identity: identity.0,
            })
            .send()
            .await
            .context("authorizer endpoint unreachable")?;

        if response.status().is_client_error() {
            let message = match response.json::<ApiError>().await {
                Ok(body) => body.message,
                Err(_) => "channel authorization rejected".to_string(),
            };
            return Err(SubscribeError::Rejected {
                channel: channel.to_string(),
                message,
            });
        }

        let body: AuthorizeResponse = response
            .error_for_status()
            .context("authorizer endpoint failed")?
            .json()
            .await
            .context("invalid authorizer response body")?;
        Ok(body.auth)
    }
}

struct AdapterState {
    connection: Option<Arc<dyn PushConnection>>,
    identity: Option<UserId>,
    joined: HashSet<String>,
    forward_task: Option<JoinHandle<()>>,
}

pub struct TransportAdapter {
    connector: Arc<dyn PushConnector>,
    authorizer: Arc<dyn ChannelAuthorizer>,
    endpoint: String,
    inner: Mutex<AdapterState>,
    /// Stable event stream across reconnects; each live connection is
    /// forwarded into it.
    events: broadcast::Sender<TransportEvent>,
}

impl TransportAdapter {
    pub fn new(
        connector: Arc<dyn PushConnector>,
        authorizer: Arc<dyn ChannelAuthorizer>,
        endpoint: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            connector,
            authorizer,
            endpoint: endpoint.into(),
            inner: Mutex::new(AdapterState {
                connection: None,
                identity: None,
                joined: HashSet::new(),
                forward_task: None,
            }),
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub async fn identity(&self) -> Option<UserId> {
        self.inner.lock().await.identity
    }

    pub async fn connection_state(&self) -> ConnectionState {
        let guard = self.inner.lock().await;
        guard
            .connection
            .as_ref()
            .map(|c| c.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Idempotent per identity: connecting while already connected as the
    /// same user is a no-op; a different identity tears down and reconnects.
    pub async fn connect(&self, identity: UserId) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.connection.is_some() && guard.identity == Some(identity) {
            debug!(user_id = identity.0, "transport: already connected");
            return Ok(());
        }
        Self::teardown_locked(&mut guard).await;

        let connection = self
            .connector
            .connect(ConnectOptions {
                endpoint: self.endpoint.clone(),
                identity: identity.0,
            })
            .await
            .context("push transport connect failed")?;

        let mut source = connection.subscribe_events();
        let sink = self.events.clone();
        guard.forward_task = Some(tokio::spawn(async move {
            while let Ok(event) = source.recv().await {
                let _ = sink.send(event);
            }
        }));
        guard.connection = Some(connection);
        guard.identity = Some(identity);
        info!(user_id = identity.0, "transport: connected");
        Ok(())
    }

    /// Performs the authorization handshake, then joins. An authorization
    /// failure is reported to the caller but leaves the connection intact.
    pub async fn subscribe_private(&self, channel: &str) -> Result<(), SubscribeError> {
        let (connection, identity) = {
            let guard = self.inner.lock().await;
            if guard.joined.contains(channel) {
                return Ok(());
            }
            match (&guard.connection, guard.identity) {
                (Some(connection), Some(identity)) => (Arc::clone(connection), identity),
                _ => return Err(SubscribeError::NotConnected),
            }
        };

        let auth = self.authorizer.authorize(identity, channel).await?;
        connection
            .join(channel, Some(&auth))
            .await
            .context("channel join failed")?;

        self.inner.lock().await.joined.insert(channel.to_string());
        info!(channel, "transport: private channel joined");
        Ok(())
    }

    /// Fire-and-forget, non-persisted signal (typing, call signaling). No
    /// delivery guarantee and no retry; send failures are only logged.
    pub async fn publish_ephemeral(
        &self,
        channel: &str,
        event: &str,
        payload: serde_json::Value,
    ) {
        let connection = {
            let guard = self.inner.lock().await;
            guard.connection.as_ref().map(Arc::clone)
        };
        let Some(connection) = connection else {
            debug!(channel, event, "transport: ephemeral publish dropped, not connected");
            return;
        };
        if let Err(err) = connection.publish(channel, event, payload).await {
            warn!(channel, event, "transport: ephemeral publish failed: {err}");
        }
    }

    /// Idempotent; leaving a channel that was never joined is a no-op.
    pub async fn leave(&self, channel: &str) {
        let connection = {
            let mut guard = self.inner.lock().await;
            if !guard.joined.remove(channel) {
                return;
            }
            guard.connection.as_ref().map(Arc::clone)
        };
        if let Some(connection) = connection {
            if let Err(err) = connection.leave(channel).await {
                warn!(channel, "transport: leave failed: {err}");
            }
        }
    }

    /// Releases every subscription and clears ephemeral state. Safe to call
    /// on an already-disconnected adapter.
    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        Self::teardown_locked(&mut guard).await;
    }

    async fn teardown_locked(state: &mut AdapterState) {
        if let Some(task) = state.forward_task.take() {
            task.abort();
        }
        if let Some(connection) = state.connection.take() {
            if let Err(err) = connection.close().await {
                warn!("transport: close failed: {err}");
            }
        }
        state.joined.clear();
        state.identity = None;
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
