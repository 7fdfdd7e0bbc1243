//! Per-user call session orchestration: ringing, WebRTC signaling relay,
//! pending-offer/candidate buffering and busy-race suppression.
//!
//! A user is in at most one call at a time. Transitions are gated by an
//! explicit table; a teardown invoked from a state with no path to a
//! terminal is rejected by construction, which is what makes teardown
//! idempotent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{CallEndReason, CallKind, ConversationId, UserId},
    protocol::{CallSignal, IceCandidatePayload, SessionDescription},
};
use thiserror::Error;
use tokio::{sync::broadcast, sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::events::SessionEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    Ringing,
    Connecting,
    Active,
    Ended,
    Rejected,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// The transition table. Anything not listed is rejected, including
/// re-entrant teardowns (no terminal state can be entered twice).
fn can_transition(from: CallStatus, to: CallStatus) -> bool {
    use CallStatus::*;
    matches!(
        (from, to),
        (Idle, Ringing)
            | (Ringing, Connecting)
            | (Connecting, Active)
            | (Ringing, Ended)
            | (Ringing, Rejected)
            | (Ringing, Busy)
            | (Connecting, Ended)
            | (Active, Ended)
            | (Ended, Idle)
            | (Rejected, Idle)
            | (Busy, Idle)
    )
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call action '{action}' not allowed from {from:?}")]
    InvalidState {
        from: CallStatus,
        action: &'static str,
    },
    #[error("media permission denied")]
    PermissionDenied,
    #[error("media device failure: {0}")]
    Media(String),
    #[error("peer connection failure: {0}")]
    Peer(String),
}

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("media permission denied")]
    Denied,
    #[error("media devices unavailable: {0}")]
    Unavailable(String),
}

/// Device permission and capture seam.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn request_permission(&self, kind: CallKind) -> Result<(), PermissionError>;
    async fn open_stream(&self, kind: CallKind) -> Result<Arc<dyn MediaStream>>;
}

pub trait MediaStream: Send + Sync {
    fn stop_tracks(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<()>;
    async fn close(&self);
}

/// Relays a signal to a peer over the push transport; best effort.
#[async_trait]
pub trait CallSignalSender: Send + Sync {
    async fn send(&self, to: UserId, signal: CallSignal) -> Result<()>;
}

pub struct MissingMediaDevices;

#[async_trait]
impl MediaDevices for MissingMediaDevices {
    async fn request_permission(&self, _kind: CallKind) -> Result<(), PermissionError> {
        Err(PermissionError::Unavailable(
            "media backend is unavailable".to_string(),
        ))
    }

    async fn open_stream(&self, _kind: CallKind) -> Result<Arc<dyn MediaStream>> {
        Err(anyhow!("media backend is unavailable"))
    }
}

pub struct MissingPeerConnectionFactory;

#[async_trait]
impl PeerConnectionFactory for MissingPeerConnectionFactory {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>> {
        Err(anyhow!("peer connection backend is unavailable"))
    }
}

pub struct MissingSignalSender;

#[async_trait]
impl CallSignalSender for MissingSignalSender {
    async fn send(&self, to: UserId, _signal: CallSignal) -> Result<()> {
        Err(anyhow!("call signaling is unavailable for user {}", to.0))
    }
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ring_timeout: Duration,
    pub busy_grace: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(60),
            busy_grace: Duration::from_secs(3),
        }
    }
}

/// UI-facing view of the call session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub status: CallStatus,
    pub role: Option<CallRole>,
    pub kind: Option<CallKind>,
    pub conversation_id: Option<ConversationId>,
    pub remote_peer: Option<UserId>,
    pub permission_denied: bool,
}

struct CallSessionState {
    status: CallStatus,
    role: Option<CallRole>,
    kind: Option<CallKind>,
    conversation_id: Option<ConversationId>,
    remote_peer: Option<UserId>,
    permission_denied: bool,
    /// At most one outstanding offer, buffered while the receiver has not
    /// yet accepted.
    pending_offer: Option<SessionDescription>,
    /// Candidates that arrived before the remote description; flushed in
    /// arrival order once it is set.
    pending_candidates: Vec<IceCandidatePayload>,
    remote_description_set: bool,
    ring_started_at: Option<Instant>,
    connected_at: Option<Instant>,
    ring_timer: Option<JoinHandle<()>>,
    peer: Option<Arc<dyn PeerConnection>>,
    media: Option<Arc<dyn MediaStream>>,
    /// Bumped on every call setup and teardown; stale timers compare it.
    generation: u64,
}

impl CallSessionState {
    fn new() -> Self {
        Self {
            status: CallStatus::Idle,
            role: None,
            kind: None,
            conversation_id: None,
            remote_peer: None,
            permission_denied: false,
            pending_offer: None,
            pending_candidates: Vec::new(),
            remote_description_set: false,
            ring_started_at: None,
            connected_at: None,
            ring_timer: None,
            peer: None,
            media: None,
            generation: 0,
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            status: self.status,
            role: self.role,
            kind: self.kind,
            conversation_id: self.conversation_id,
            remote_peer: self.remote_peer,
            permission_denied: self.permission_denied,
        }
    }

    fn advance(&mut self, to: CallStatus, action: &'static str) -> Result<(), CallError> {
        if !can_transition(self.status, to) {
            return Err(CallError::InvalidState {
                from: self.status,
                action,
            });
        }
        self.status = to;
        Ok(())
    }

    fn cancel_ring_timer(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
    }
}

pub struct CallOrchestrator {
    media: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    signals: Arc<dyn CallSignalSender>,
    config: CallConfig,
    inner: Mutex<CallSessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl CallOrchestrator {
    pub fn new(
        media: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        signals: Arc<dyn CallSignalSender>,
        config: CallConfig,
        events: broadcast::Sender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            media,
            peers,
            signals,
            config,
            inner: Mutex::new(CallSessionState::new()),
            events,
        })
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        self.inner.lock().await.snapshot()
    }

    fn emit_snapshot(&self, snapshot: CallSnapshot) {
        let _ = self.events.send(SessionEvent::CallChanged(snapshot));
    }

    fn spawn_ring_timer(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            orchestrator.handle_ring_timeout(generation).await;
        })
    }

    async fn handle_ring_timeout(self: &Arc<Self>, generation: u64) {
        let expired = {
            let guard = self.inner.lock().await;
            guard.generation == generation && guard.status == CallStatus::Ringing
        };
        if !expired {
            return;
        }
        info!("call: ring timeout fired, ending call");
        self.send_to_remote(|conversation_id| CallSignal::End { conversation_id })
            .await;
        self.teardown(CallEndReason::Timeout).await;
    }

    /// Starts an outgoing call. Allowed only from idle. The session goes to
    /// ringing optimistically, before the permission check, so the caller UI
    /// reflects intent immediately; permission denial leaves it ringing with
    /// an error flag so a retry does not have to re-dial.
    pub async fn initiate(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        target: UserId,
        kind: CallKind,
    ) -> Result<(), CallError> {
        let generation = {
            let mut guard = self.inner.lock().await;
            guard.advance(CallStatus::Ringing, "initiate")?;
            guard.role = Some(CallRole::Caller);
            guard.kind = Some(kind);
            guard.conversation_id = Some(conversation_id);
            guard.remote_peer = Some(target);
            guard.permission_denied = false;
            guard.ring_started_at = Some(Instant::now());
            guard.generation += 1;
            guard.generation
        };
        {
            let timer = self.spawn_ring_timer(generation);
            let mut guard = self.inner.lock().await;
            guard.cancel_ring_timer();
            guard.ring_timer = Some(timer);
            self.emit_snapshot(guard.snapshot());
        }

        if let Err(err) = self.media.request_permission(kind).await {
            warn!("call: permission request failed: {err}");
            let mut guard = self.inner.lock().await;
            if guard.generation == generation {
                guard.permission_denied = true;
                self.emit_snapshot(guard.snapshot());
            }
            return Err(CallError::PermissionDenied);
        }

        if let Err(err) = self
            .signals
            .send(
                target,
                CallSignal::Initiate {
                    conversation_id,
                    kind,
                },
            )
            .await
        {
            // Ephemeral signaling carries no delivery guarantee; the ring
            // timeout is the backstop if the invite never lands.
            warn!("call: initiate signal failed: {err}");
        }
        Ok(())
    }

    /// Reacts to a remote invite. A duplicate of the current call's invite
    /// is ignored; any other invite while not idle gets an immediate busy
    /// reply without disturbing the current call.
    pub async fn handle_incoming(
        self: &Arc<Self>,
        from: UserId,
        conversation_id: ConversationId,
        kind: CallKind,
    ) -> Result<(), CallError> {
        let generation = {
            let mut guard = self.inner.lock().await;
            if guard.status != CallStatus::Idle {
                if guard.remote_peer == Some(from)
                    && guard.conversation_id == Some(conversation_id)
                {
                    debug!(user_id = from.0, "call: duplicate invite ignored");
                    return Ok(());
                }
                drop(guard);
                if let Err(err) = self
                    .signals
                    .send(from, CallSignal::Busy { conversation_id })
                    .await
                {
                    warn!("call: busy reply failed: {err}");
                }
                return Ok(());
            }
            guard.advance(CallStatus::Ringing, "handle_incoming")?;
            guard.role = Some(CallRole::Callee);
            guard.kind = Some(kind);
            guard.conversation_id = Some(conversation_id);
            guard.remote_peer = Some(from);
            guard.permission_denied = false;
            guard.ring_started_at = Some(Instant::now());
            guard.generation += 1;
            guard.generation
        };

        let timer = self.spawn_ring_timer(generation);
        let mut guard = self.inner.lock().await;
        guard.cancel_ring_timer();
        guard.ring_timer = Some(timer);
        self.emit_snapshot(guard.snapshot());
        Ok(())
    }

    /// Accepts an incoming call. Drains the buffered offer if one arrived
    /// before the accept; offer-then-accept and accept-then-offer converge
    /// on the same connecting sequence.
    pub async fn accept(self: &Arc<Self>) -> Result<(), CallError> {
        let (kind, remote, generation) = {
            let guard = self.inner.lock().await;
            if guard.status != CallStatus::Ringing || guard.role != Some(CallRole::Callee) {
                return Err(CallError::InvalidState {
                    from: guard.status,
                    action: "accept",
                });
            }
            (
                guard.kind.unwrap_or(CallKind::Audio),
                guard.remote_peer,
                guard.generation,
            )
        };

        if let Err(err) = self.media.request_permission(kind).await {
            warn!("call: permission request failed on accept: {err}");
            let mut guard = self.inner.lock().await;
            if guard.generation == generation {
                guard.permission_denied = true;
                self.emit_snapshot(guard.snapshot());
            }
            return Err(CallError::PermissionDenied);
        }

        let buffered_offer = {
            let mut guard = self.inner.lock().await;
            if guard.generation != generation {
                return Err(CallError::InvalidState {
                    from: guard.status,
                    action: "accept",
                });
            }
            guard.advance(CallStatus::Connecting, "accept")?;
            guard.cancel_ring_timer();
            guard.permission_denied = false;
            self.emit_snapshot(guard.snapshot());
            guard.pending_offer.take()
        };

        if let Err(err) = self.setup_media_and_peer(kind, generation).await {
            self.fail_call(err).await;
            return Err(CallError::Media("media setup failed".to_string()));
        }

        if let Some(remote) = remote {
            if let Some(conversation_id) = self.conversation_id().await {
                if let Err(err) = self
                    .signals
                    .send(remote, CallSignal::Accept { conversation_id })
                    .await
                {
                    warn!("call: accept signal failed: {err}");
                }
            }
        }

        if let Some(offer) = buffered_offer {
            self.apply_remote_offer(offer, generation).await;
        }
        Ok(())
    }

    /// Declines a ringing incoming call: best-effort reject signal, then
    /// unconditional teardown.
    pub async fn reject(self: &Arc<Self>) -> Result<(), CallError> {
        {
            let guard = self.inner.lock().await;
            if guard.status == CallStatus::Idle {
                return Ok(());
            }
        }
        self.send_to_remote(|conversation_id| CallSignal::Reject { conversation_id })
            .await;
        self.teardown(CallEndReason::Rejected).await;
        Ok(())
    }

    /// Local hangup from any non-idle state: best-effort end signal, then
    /// unconditional teardown.
    pub async fn end(self: &Arc<Self>) -> Result<(), CallError> {
        {
            let guard = self.inner.lock().await;
            if guard.status == CallStatus::Idle {
                return Ok(());
            }
        }
        self.send_to_remote(|conversation_id| CallSignal::End { conversation_id })
            .await;
        self.teardown(CallEndReason::Hangup).await;
        Ok(())
    }

    /// Entry point for all remote signaling.
    pub async fn handle_signal(self: &Arc<Self>, from: UserId, signal: CallSignal) {
        match signal {
            CallSignal::Initiate {
                conversation_id,
                kind,
            } => {
                if let Err(err) = self.handle_incoming(from, conversation_id, kind).await {
                    warn!("call: incoming invite rejected: {err}");
                }
            }
            CallSignal::Accept { .. } => self.handle_remote_accept(from).await,
            CallSignal::Reject { .. } => {
                if self.is_current_peer(from).await {
                    self.teardown(CallEndReason::Rejected).await;
                }
            }
            CallSignal::End { .. } => {
                if self.is_current_peer(from).await {
                    self.teardown(CallEndReason::Hangup).await;
                }
            }
            CallSignal::Busy { .. } => self.handle_busy(from).await,
            CallSignal::Offer { description, .. } => self.handle_offer(from, description).await,
            CallSignal::Answer { description, .. } => self.handle_answer(from, description).await,
            CallSignal::IceCandidate { candidate, .. } => {
                self.handle_candidate(from, candidate).await
            }
        }
    }

    async fn handle_remote_accept(self: &Arc<Self>, from: UserId) {
        let (kind, generation) = {
            let mut guard = self.inner.lock().await;
            if guard.role != Some(CallRole::Caller)
                || guard.status != CallStatus::Ringing
                || guard.remote_peer != Some(from)
            {
                debug!(user_id = from.0, "call: unexpected accept ignored");
                return;
            }
            if guard.advance(CallStatus::Connecting, "remote_accept").is_err() {
                return;
            }
            guard.cancel_ring_timer();
            self.emit_snapshot(guard.snapshot());
            (guard.kind.unwrap_or(CallKind::Audio), guard.generation)
        };

        if let Err(err) = self.setup_media_and_peer(kind, generation).await {
            self.fail_call(err).await;
            return;
        }

        let peer = self.current_peer(generation).await;
        let Some(peer) = peer else { return };
        let offer = match peer.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                self.fail_call(err).await;
                return;
            }
        };
        if let Err(err) = peer.set_local_description(offer.clone()).await {
            self.fail_call(err).await;
            return;
        }
        if let Some(conversation_id) = self.conversation_id().await {
            if let Err(err) = self
                .signals
                .send(
                    from,
                    CallSignal::Offer {
                        conversation_id,
                        description: offer,
                    },
                )
                .await
            {
                warn!("call: offer signal failed: {err}");
            }
        }
    }

    /// A busy signal within the grace window of ring start is a stale echo
    /// from a mutual-dial race and must not kill a progressing call.
    async fn handle_busy(self: &Arc<Self>, from: UserId) {
        {
            let guard = self.inner.lock().await;
            if guard.remote_peer != Some(from) || guard.status == CallStatus::Idle {
                return;
            }
            if let Some(started) = guard.ring_started_at {
                if started.elapsed() <= self.config.busy_grace {
                    info!(
                        user_id = from.0,
                        "call: busy signal inside grace window ignored"
                    );
                    return;
                }
            }
        }
        self.teardown(CallEndReason::Busy).await;
    }

    async fn handle_offer(self: &Arc<Self>, from: UserId, description: SessionDescription) {
        let action = {
            let mut guard = self.inner.lock().await;
            if guard.remote_peer != Some(from) {
                debug!(user_id = from.0, "call: offer from unexpected peer dropped");
                return;
            }
            match guard.status {
                // Receiver has not accepted yet: buffer, at most one.
                CallStatus::Ringing => {
                    guard.pending_offer = Some(description);
                    None
                }
                // Accepted but media setup has not stored the peer yet;
                // buffer and let the setup path drain it.
                CallStatus::Connecting if guard.peer.is_none() => {
                    debug!(user_id = from.0, "call: offer buffered during media setup");
                    guard.pending_offer = Some(description);
                    None
                }
                CallStatus::Connecting | CallStatus::Active => {
                    Some((guard.generation, description))
                }
                _ => {
                    debug!(status = ?guard.status, "call: late offer dropped");
                    None
                }
            }
        };
        if let Some((generation, description)) = action {
            self.apply_remote_offer(description, generation).await;
        }
    }

    async fn handle_answer(self: &Arc<Self>, from: UserId, description: SessionDescription) {
        let generation = {
            let guard = self.inner.lock().await;
            if guard.role != Some(CallRole::Caller)
                || guard.status != CallStatus::Connecting
                || guard.remote_peer != Some(from)
            {
                debug!(user_id = from.0, "call: unexpected answer ignored");
                return;
            }
            guard.generation
        };
        let Some(peer) = self.current_peer(generation).await else {
            return;
        };
        if let Err(err) = peer.set_remote_description(description).await {
            warn!("call: applying answer failed: {err}");
            return;
        }
        self.after_remote_description(generation).await;
        self.mark_active(generation).await;
    }

    async fn handle_candidate(self: &Arc<Self>, from: UserId, candidate: IceCandidatePayload) {
        let ready = {
            let mut guard = self.inner.lock().await;
            if guard.remote_peer != Some(from) || guard.status == CallStatus::Idle {
                return;
            }
            if !guard.remote_description_set {
                guard.pending_candidates.push(candidate);
                return;
            }
            guard.peer.as_ref().map(Arc::clone)
        };
        if let Some(peer) = ready {
            // Per-candidate failures never abort the call.
            if let Err(err) = peer.add_ice_candidate(candidate).await {
                warn!("call: ice candidate rejected: {err}");
            }
        }
    }

    /// Relays a locally gathered ICE candidate to the remote peer.
    pub async fn send_local_candidate(&self, candidate: IceCandidatePayload) {
        if let Some(conversation_id) = self.conversation_id().await {
            self.send_to_remote(|_| CallSignal::IceCandidate {
                conversation_id,
                candidate: candidate.clone(),
            })
            .await;
        }
    }

    async fn apply_remote_offer(self: &Arc<Self>, offer: SessionDescription, generation: u64) {
        let Some(peer) = self.current_peer(generation).await else {
            return;
        };
        if let Err(err) = peer.set_remote_description(offer).await {
            warn!("call: applying offer failed: {err}");
            return;
        }
        self.after_remote_description(generation).await;

        let answer = match peer.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                warn!("call: answer creation failed: {err}");
                return;
            }
        };
        if let Err(err) = peer.set_local_description(answer.clone()).await {
            warn!("call: applying local answer failed: {err}");
            return;
        }
        let remote = { self.inner.lock().await.remote_peer };
        if let (Some(remote), Some(conversation_id)) = (remote, self.conversation_id().await) {
            if let Err(err) = self
                .signals
                .send(
                    remote,
                    CallSignal::Answer {
                        conversation_id,
                        description: answer,
                    },
                )
                .await
            {
                warn!("call: answer signal failed: {err}");
            }
        }
        self.mark_active(generation).await;
    }

    /// Marks the remote description applied and flushes queued candidates in
    /// arrival order. The queue is drained exactly once per call setup.
    async fn after_remote_description(self: &Arc<Self>, generation: u64) {
        let (peer, queued) = {
            let mut guard = self.inner.lock().await;
            if guard.generation != generation {
                return;
            }
            guard.remote_description_set = true;
            (
                guard.peer.as_ref().map(Arc::clone),
                std::mem::take(&mut guard.pending_candidates),
            )
        };
        let Some(peer) = peer else { return };
        for candidate in queued {
            if let Err(err) = peer.add_ice_candidate(candidate).await {
                warn!("call: queued ice candidate rejected: {err}");
            }
        }
    }

    async fn mark_active(&self, generation: u64) {
        let mut guard = self.inner.lock().await;
        if guard.generation != generation || guard.status != CallStatus::Connecting {
            return;
        }
        if guard.advance(CallStatus::Active, "mark_active").is_ok() {
            guard.connected_at = Some(Instant::now());
            self.emit_snapshot(guard.snapshot());
        }
    }

    async fn setup_media_and_peer(self: &Arc<Self>, kind: CallKind, generation: u64) -> Result<()> {
        let media = self.media.open_stream(kind).await?;
        let peer = self.peers.create().await?;
        let stashed = {
            let mut guard = self.inner.lock().await;
            if guard.generation != generation {
                media.stop_tracks();
                drop(guard);
                peer.close().await;
                return Err(anyhow!("call torn down during media setup"));
            }
            guard.media = Some(media);
            guard.peer = Some(peer);
            // An offer that raced the setup window is applied now that the
            // peer exists.
            guard.pending_offer.take()
        };
        if let Some(offer) = stashed {
            self.apply_remote_offer(offer, generation).await;
        }
        Ok(())
    }

    async fn fail_call(self: &Arc<Self>, err: anyhow::Error) {
        warn!("call: setup failed, ending: {err}");
        self.send_to_remote(|conversation_id| CallSignal::End { conversation_id })
            .await;
        self.teardown(CallEndReason::Error).await;
    }

    async fn current_peer(&self, generation: u64) -> Option<Arc<dyn PeerConnection>> {
        let guard = self.inner.lock().await;
        if guard.generation != generation {
            return None;
        }
        guard.peer.as_ref().map(Arc::clone)
    }

    async fn conversation_id(&self) -> Option<ConversationId> {
        self.inner.lock().await.conversation_id
    }

    async fn is_current_peer(&self, from: UserId) -> bool {
        self.inner.lock().await.remote_peer == Some(from)
    }

    async fn send_to_remote<F>(&self, build: F)
    where
        F: FnOnce(ConversationId) -> CallSignal,
    {
        let (remote, conversation_id) = {
            let guard = self.inner.lock().await;
            (guard.remote_peer, guard.conversation_id)
        };
        if let (Some(remote), Some(conversation_id)) = (remote, conversation_id) {
            if let Err(err) = self.signals.send(remote, build(conversation_id)).await {
                warn!("call: signal send failed: {err}");
            }
        }
    }

    /// Tears the session down to idle: cancels the ring timer, stops media
    /// tracks, closes the peer connection, clears every buffer and queue.
    /// Re-entrant invocations are rejected by the transition table, so
    /// network signals and teardown side effects never fire twice.
    pub async fn teardown(self: &Arc<Self>, reason: CallEndReason) {
        let (terminal_snapshot, media, peer) = {
            let mut guard = self.inner.lock().await;
            let terminal = match reason {
                CallEndReason::Rejected => CallStatus::Rejected,
                CallEndReason::Busy => CallStatus::Busy,
                _ => CallStatus::Ended,
            };
            // The reason-specific terminals only exist off the ringing
            // phase; from a live call every reason funnels through ended.
            // Only a teardown that cannot even reach ended is re-entrant.
            if guard.advance(terminal, "teardown").is_err()
                && guard.advance(CallStatus::Ended, "teardown").is_err()
            {
                debug!(?reason, "call: re-entrant teardown ignored");
                return;
            }
            guard.cancel_ring_timer();
            let media = guard.media.take();
            let peer = guard.peer.take();
            let snapshot = guard.snapshot();
            match guard.connected_at {
                Some(connected) => info!(
                    ?reason,
                    seconds = connected.elapsed().as_secs(),
                    "call: ended"
                ),
                None => info!(?reason, "call: ended before connecting"),
            }

            guard.status = CallStatus::Idle;
            guard.role = None;
            guard.kind = None;
            guard.conversation_id = None;
            guard.remote_peer = None;
            guard.permission_denied = false;
            guard.pending_offer = None;
            guard.pending_candidates.clear();
            guard.remote_description_set = false;
            guard.ring_started_at = None;
            guard.connected_at = None;
            guard.generation += 1;
            (snapshot, media, peer)
        };

        if let Some(media) = media {
            media.stop_tracks();
        }
        if let Some(peer) = peer {
            peer.close().await;
        }

        self.emit_snapshot(terminal_snapshot);
        let _ = self.events.send(SessionEvent::CallEnded { reason });
        let idle = self.inner.lock().await.snapshot();
        self.emit_snapshot(idle);
    }
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
