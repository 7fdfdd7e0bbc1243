//! Realtime messaging and call-signaling coordinator.
//!
//! [`RealtimeSession`] owns the push transport adapter, the conversation
//! store, the dedup pipeline, the call orchestrator, the guest router and
//! the fallback poll loop, and exposes one broadcast stream of
//! [`SessionEvent`]s to the presentation layer. Messages from every source
//! (channel push, sender echo, poll catch-up) funnel through the single
//! `ingest` path, so duplicate suppression and unread accounting behave the
//! same no matter how a message arrived.

pub mod api;
pub mod call;
pub mod config;
pub mod delivery;
pub mod events;
pub mod guest;
mod poll;
pub mod store;
pub mod transport;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use push_transport::{ConnectionState, PushConnector, TransportEvent};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{
        CallSignal, ChannelEvent, ConversationSummary, MessagePayload, OutgoingMessage,
        TypingPayload,
    },
};
use tokio::{sync::broadcast, sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    api::ConversationApi,
    call::{
        CallConfig, CallOrchestrator, CallSignalSender, MediaDevices, MissingMediaDevices,
        MissingPeerConnectionFactory, PeerConnectionFactory,
    },
    config::RealtimeConfig,
    delivery::DeliveryPipeline,
    events::SessionEvent,
    guest::{GuestInterceptRouter, IntentResolver, MissingIntentResolver},
    store::ConversationStore,
    transport::{conversation_channel, user_channel, ChannelAuthorizer, TransportAdapter},
};

/// Relays call signals to a peer's notification channel over the push
/// transport. Best effort, like all ephemeral publishing.
struct AdapterSignalSender {
    adapter: Arc<TransportAdapter>,
}

#[async_trait]
impl CallSignalSender for AdapterSignalSender {
    async fn send(&self, to: UserId, signal: CallSignal) -> Result<()> {
        let from = self
            .adapter
            .identity()
            .await
            .ok_or_else(|| anyhow!("not connected to the push transport"))?;
        let (event, payload) = ChannelEvent::CallSignal { from, signal }.to_parts()?;
        self.adapter
            .publish_ephemeral(&user_channel(to), &event, payload)
            .await;
        Ok(())
    }
}

struct SessionState {
    viewer: Option<UserId>,
    display_name: String,
    /// Window/tab visibility; the poll loop only runs while visible.
    visible: bool,
    connection: ConnectionState,
    store: ConversationStore,
    pipeline: DeliveryPipeline,
    pump_task: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
}

pub struct RealtimeSession {
    pub(crate) api: Arc<dyn ConversationApi>,
    transport: Arc<TransportAdapter>,
    call: Arc<CallOrchestrator>,
    guest: Arc<GuestInterceptRouter>,
    pub(crate) config: RealtimeConfig,
    pub(crate) inner: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl RealtimeSession {
    /// Builds a session with stub media/peer/intent backends. Calls and
    /// guest bot replies will error until real backends are supplied via
    /// [`RealtimeSession::new_with_dependencies`].
    pub fn new(
        connector: Arc<dyn PushConnector>,
        authorizer: Arc<dyn ChannelAuthorizer>,
        api: Arc<dyn ConversationApi>,
        endpoint: impl Into<String>,
    ) -> Arc<Self> {
        Self::new_with_dependencies(
            connector,
            authorizer,
            api,
            endpoint,
            Arc::new(MissingMediaDevices),
            Arc::new(MissingPeerConnectionFactory),
            Arc::new(MissingIntentResolver),
            RealtimeConfig::default(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_with_dependencies(
        connector: Arc<dyn PushConnector>,
        authorizer: Arc<dyn ChannelAuthorizer>,
        api: Arc<dyn ConversationApi>,
        endpoint: impl Into<String>,
        media: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        resolver: Arc<dyn IntentResolver>,
        config: RealtimeConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let transport = Arc::new(TransportAdapter::new(connector, authorizer, endpoint));
        let signals = Arc::new(AdapterSignalSender {
            adapter: Arc::clone(&transport),
        });
        let call = CallOrchestrator::new(
            media,
            peers,
            signals,
            CallConfig {
                ring_timeout: config.ring_timeout,
                busy_grace: config.busy_grace,
            },
            events.clone(),
        );
        let guest = Arc::new(GuestInterceptRouter::new(
            resolver,
            Arc::clone(&api),
            events.clone(),
        ));
        let pipeline = DeliveryPipeline::new(config.dedup_capacity);
        Arc::new(Self {
            api,
            transport,
            call,
            guest,
            config,
            inner: Mutex::new(SessionState {
                viewer: None,
                display_name: String::new(),
                visible: true,
                connection: ConnectionState::Disconnected,
                store: ConversationStore::new(),
                pipeline,
                pump_task: None,
                poll_task: None,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn call(&self) -> &Arc<CallOrchestrator> {
        &self.call
    }

    pub fn guest(&self) -> &Arc<GuestInterceptRouter> {
        &self.guest
    }

    /// Connects as `identity`, joins the per-user notification channel and
    /// starts the event pump and poll loop. Re-initializing replaces any
    /// previous identity's tasks.
    pub async fn init(
        self: &Arc<Self>,
        identity: UserId,
        display_name: impl Into<String>,
    ) -> Result<()> {
        {
            let mut guard = self.inner.lock().await;
            guard.viewer = Some(identity);
            guard.display_name = display_name.into();
        }

        self.transport.connect(identity).await?;
        self.transport
            .subscribe_private(&user_channel(identity))
            .await
            .context("notification channel join failed")?;

        let mut guard = self.inner.lock().await;
        if let Some(task) = guard.pump_task.take() {
            task.abort();
        }
        if let Some(task) = guard.poll_task.take() {
            task.abort();
        }
        guard.pump_task = Some(self.spawn_pump_task());
        guard.poll_task = Some(self.spawn_poll_task());
        guard.connection = ConnectionState::Connected;
        let _ = self
            .events
            .send(SessionEvent::ConnectionChanged(ConnectionState::Connected));
        info!(user_id = identity.0, "session: initialized");
        Ok(())
    }

    fn spawn_pump_task(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        let mut source = self.transport.subscribe_events();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(TransportEvent::Message { event, payload, .. }) => {
                        match ChannelEvent::from_parts(&event, payload) {
                            Ok(decoded) => session.handle_channel_event(decoded).await,
                            Err(err) => {
                                debug!(event = %event, "session: undecodable event dropped: {err}")
                            }
                        }
                    }
                    Ok(TransportEvent::StateChanged(state)) => {
                        session.inner.lock().await.connection = state;
                        let _ = session.events.send(SessionEvent::ConnectionChanged(state));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The poll loop reconciles anything missed here.
                        warn!(skipped, "session: event pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::MessageCreated { message } => {
                if let Err(err) = self.ingest(message).await {
                    warn!("session: message ingest failed: {err}");
                    let _ = self.events.send(SessionEvent::Error(err.to_string()));
                }
            }
            ChannelEvent::MessageDeleted {
                conversation_id,
                message_id,
            } => {
                self.inner
                    .lock()
                    .await
                    .store
                    .remove_message(conversation_id, message_id);
                let _ = self.events.send(SessionEvent::MessageDeleted {
                    conversation_id,
                    message_id,
                });
            }
            ChannelEvent::Typing(payload) => {
                let viewer = { self.inner.lock().await.viewer };
                if viewer == Some(payload.user_id) {
                    // Own typing echo from the conversation channel.
                    return;
                }
                let names = {
                    let mut guard = self.inner.lock().await;
                    guard.store.set_typing(&payload)
                };
                let _ = self.events.send(SessionEvent::TypingChanged {
                    conversation_id: payload.conversation_id,
                    names,
                });
            }
            ChannelEvent::CallSignal { from, signal } => {
                self.call.handle_signal(from, signal).await;
            }
            ChannelEvent::GuestSessionUpdated {
                guest_token,
                conversation_id,
                status,
            } => {
                self.guest.sync_status(&guest_token, status).await;
                let _ = self.events.send(SessionEvent::GuestSessionUpdated {
                    guest_token,
                    conversation_id,
                    status,
                });
            }
        }
    }

    /// Single entry point for inbound messages from every delivery path.
    ///
    /// Dedup happens first and atomically with the known-conversation check.
    /// A message for an unknown conversation triggers at most one summary
    /// fetch per conversation per session; if the fetch fails the message is
    /// dropped and a later sighting of the same conversation will not retry.
    pub(crate) async fn ingest(&self, message: MessagePayload) -> Result<()> {
        let (fresh, known, viewer) = {
            let mut guard = self.inner.lock().await;
            let fresh = guard.pipeline.observe(message.message_id);
            (
                fresh,
                guard.store.contains(message.conversation_id),
                guard.viewer,
            )
        };
        if !fresh {
            debug!(
                message_id = message.message_id.0,
                "session: duplicate delivery dropped"
            );
            return Ok(());
        }

        if !known {
            let first_attempt = {
                let mut guard = self.inner.lock().await;
                guard.pipeline.note_fetch_attempt(message.conversation_id)
            };
            if !first_attempt {
                debug!(
                    conversation_id = message.conversation_id.0,
                    "session: message for unfetchable conversation dropped"
                );
                return Ok(());
            }
            match self.api.get_conversation(message.conversation_id).await {
                Ok(mut summary) => {
                    // The unread counter is driven locally from this point;
                    // the message being ingested right now is the first one.
                    summary.unread = 0;
                    let mut guard = self.inner.lock().await;
                    guard.pipeline.clear_fetch_attempt(message.conversation_id);
                    guard.store.upsert_summary(summary);
                }
                Err(err) => {
                    warn!(
                        conversation_id = message.conversation_id.0,
                        "session: conversation summary fetch failed: {err}"
                    );
                    return Ok(());
                }
            }
        }

        let (application, title) = {
            let mut guard = self.inner.lock().await;
            let application = guard.store.apply_incoming(message.clone(), viewer);
            let title = guard
                .store
                .get(message.conversation_id)
                .map(|c| c.title.clone());
            (application, title)
        };

        let _ = self.events.send(SessionEvent::NewMessage {
            message: message.clone(),
        });
        if application.viewing {
            if let Err(err) = self.api.mark_as_read(message.conversation_id).await {
                warn!(
                    conversation_id = message.conversation_id.0,
                    "session: mark-as-read failed: {err}"
                );
            }
        }
        if application.toast {
            let _ = self.events.send(SessionEvent::ShowToast {
                conversation_id: message.conversation_id,
                title: title.unwrap_or_default(),
                body: message.body,
            });
        }
        Ok(())
    }

    /// Switches the viewer to a conversation: joins its channel, loads its
    /// history and resets the unread counter. History ids are pre-seeded
    /// into the dedup set so a concurrent push of a loaded message is a
    /// no-op.
    pub async fn select_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let known = { self.inner.lock().await.store.contains(conversation_id) };
        if !known {
            let summary = self.api.get_conversation(conversation_id).await?;
            self.inner.lock().await.store.upsert_summary(summary);
        }

        let previous = { self.inner.lock().await.store.selected() };
        if let Some(previous) = previous {
            if previous != conversation_id {
                self.publish_typing(previous, false).await;
                self.transport.leave(&conversation_channel(previous)).await;
                self.inner.lock().await.store.clear_typing(previous);
            }
        }

        if let Err(err) = self
            .transport
            .subscribe_private(&conversation_channel(conversation_id))
            .await
        {
            // The notification channel still delivers this conversation's
            // messages; only typing indicators are lost.
            warn!(
                conversation_id = conversation_id.0,
                "session: conversation channel join failed: {err}"
            );
        }

        let history = self
            .api
            .get_messages(conversation_id, self.config.history_page_size, None)
            .await?;
        {
            let mut guard = self.inner.lock().await;
            for message in &history {
                guard.pipeline.observe(message.message_id);
            }
            guard.store.select(conversation_id, history);
        }

        if let Err(err) = self.api.mark_as_read(conversation_id).await {
            warn!(
                conversation_id = conversation_id.0,
                "session: mark-as-read failed: {err}"
            );
        }
        let _ = self
            .events
            .send(SessionEvent::SelectConversation(conversation_id));
        Ok(())
    }

    /// Sends a message and feeds the created copy through `ingest`, so the
    /// later push echo of the same id deduplicates away.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        mut message: OutgoingMessage,
    ) -> Result<MessagePayload> {
        if message.client_ref.is_none() {
            message.client_ref = Some(Uuid::new_v4().to_string());
        }
        let created = self.api.send_message(conversation_id, message).await?;
        self.ingest(created.clone()).await?;
        Ok(created)
    }

    /// Broadcasts the viewer's typing state on the selected conversation's
    /// channel. No-op when nothing is selected or the session is signed out.
    pub async fn send_typing(&self, is_typing: bool) {
        let selected = { self.inner.lock().await.store.selected() };
        if let Some(conversation_id) = selected {
            self.publish_typing(conversation_id, is_typing).await;
        }
    }

    async fn publish_typing(&self, conversation_id: ConversationId, is_typing: bool) {
        let (viewer, display_name) = {
            let guard = self.inner.lock().await;
            (guard.viewer, guard.display_name.clone())
        };
        let Some(user_id) = viewer else { return };
        let event = ChannelEvent::Typing(TypingPayload {
            conversation_id,
            user_id,
            display_name,
            is_typing,
        });
        match event.to_parts() {
            Ok((name, payload)) => {
                self.transport
                    .publish_ephemeral(&conversation_channel(conversation_id), &name, payload)
                    .await;
            }
            Err(err) => warn!("session: typing payload encode failed: {err}"),
        }
    }

    pub async fn mark_read(&self, conversation_id: ConversationId) -> Result<()> {
        self.api.mark_as_read(conversation_id).await?;
        self.inner.lock().await.store.reset_unread(conversation_id);
        Ok(())
    }

    pub async fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<()> {
        self.api.delete_message(message_id).await?;
        self.inner
            .lock()
            .await
            .store
            .remove_message(conversation_id, message_id);
        let _ = self.events.send(SessionEvent::MessageDeleted {
            conversation_id,
            message_id,
        });
        Ok(())
    }

    /// Drops a conversation from the local projection. A later message for
    /// it re-learns the conversation through the unknown-conversation fetch.
    pub async fn remove_conversation(&self, conversation_id: ConversationId) {
        let selected = { self.inner.lock().await.store.selected() };
        if selected == Some(conversation_id) {
            self.transport
                .leave(&conversation_channel(conversation_id))
                .await;
        }
        let mut guard = self.inner.lock().await;
        guard.store.remove_conversation(conversation_id);
        guard.pipeline.clear_fetch_attempt(conversation_id);
    }

    pub async fn set_visibility(&self, visible: bool) {
        self.inner.lock().await.visible = visible;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.connection
    }

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.inner.lock().await.store.list_conversations().to_vec()
    }

    pub async fn selected_conversation(&self) -> Option<ConversationId> {
        self.inner.lock().await.store.selected()
    }

    pub async fn messages(&self) -> Vec<MessagePayload> {
        self.inner.lock().await.store.messages().to_vec()
    }

    pub async fn typing_names(&self, conversation_id: ConversationId) -> Vec<String> {
        self.inner.lock().await.store.typing_names(conversation_id)
    }

    /// Ends any live call, stops the background tasks, disconnects the
    /// transport and clears local state. Safe to call twice.
    pub async fn teardown(&self) {
        {
            let mut guard = self.inner.lock().await;
            if let Some(task) = guard.pump_task.take() {
                task.abort();
            }
            if let Some(task) = guard.poll_task.take() {
                task.abort();
            }
            guard.viewer = None;
            guard.display_name.clear();
            guard.store.clear();
            // The dedup window and fetch markers are scoped to one signed-in
            // session; the next init starts from a clean slate.
            guard.pipeline = DeliveryPipeline::new(self.config.dedup_capacity);
            guard.connection = ConnectionState::Disconnected;
        }
        let _ = self.call.end().await;
        self.transport.disconnect().await;
        let _ = self.events.send(SessionEvent::ConnectionChanged(
            ConnectionState::Disconnected,
        ));
        info!("session: torn down");
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
