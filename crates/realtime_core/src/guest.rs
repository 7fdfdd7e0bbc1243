//! Guest chat routing: the bot intercepts guest messages until a handover
//! is triggered, after which the session waits for a staff member. Handoff
//! is sticky; once the bot steps aside it never re-engages, even if later
//! messages would have matched an intent.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, GuestStatus, MessageKind, UserId},
    protocol::OutgoingMessage,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::{api::ConversationApi, events::SessionEvent};

/// Output of the external intent resolver; the router only consumes these
/// two fields.
#[derive(Debug, Clone, Default)]
pub struct IntentOutcome {
    pub reply: Option<String>,
    pub handover_requested: bool,
}

/// Pure phrase-to-intent function. NL quality is out of scope here; a
/// resolver that never matches simply routes every guest to staff.
pub trait IntentResolver: Send + Sync {
    fn resolve(&self, text: &str) -> IntentOutcome;
}

/// Resolver used before a real bot backend is wired in: no reply, no
/// explicit handover, so the no-match fallback hands every guest to staff.
pub struct MissingIntentResolver;

impl IntentResolver for MissingIntentResolver {
    fn resolve(&self, _text: &str) -> IntentOutcome {
        IntentOutcome::default()
    }
}

#[derive(Debug, Clone)]
pub struct GuestSession {
    pub token: String,
    pub conversation_id: ConversationId,
    pub display_name: String,
    pub contact: Option<String>,
    pub assigned_staff: Option<UserId>,
    pub status: GuestStatus,
    pub last_activity_at: DateTime<Utc>,
}

pub struct GuestInterceptRouter {
    resolver: Arc<dyn IntentResolver>,
    api: Arc<dyn ConversationApi>,
    /// Acknowledgment sent to the guest before bot assistance is withdrawn.
    transfer_message: String,
    inner: Mutex<HashMap<String, GuestSession>>,
    events: broadcast::Sender<SessionEvent>,
}

impl GuestInterceptRouter {
    pub fn new(
        resolver: Arc<dyn IntentResolver>,
        api: Arc<dyn ConversationApi>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            resolver,
            api,
            transfer_message: "One moment, we are transferring you to a human colleague."
                .to_string(),
            inner: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn with_transfer_message(mut self, message: impl Into<String>) -> Self {
        self.transfer_message = message.into();
        self
    }

    /// Registers a guest session on first contact. Re-registering an
    /// existing token refreshes the contact details but never rewinds the
    /// routing status.
    pub async fn open_session(
        &self,
        token: impl Into<String>,
        conversation_id: ConversationId,
        display_name: impl Into<String>,
        contact: Option<String>,
    ) {
        let token = token.into();
        let mut guard = self.inner.lock().await;
        match guard.get_mut(&token) {
            Some(existing) => {
                existing.display_name = display_name.into();
                existing.contact = contact;
                existing.last_activity_at = Utc::now();
            }
            None => {
                guard.insert(
                    token.clone(),
                    GuestSession {
                        token,
                        conversation_id,
                        display_name: display_name.into(),
                        contact,
                        assigned_staff: None,
                        status: GuestStatus::Active,
                        last_activity_at: Utc::now(),
                    },
                );
            }
        }
    }

    pub async fn snapshot(&self, token: &str) -> Option<GuestSession> {
        self.inner.lock().await.get(token).cloned()
    }

    /// Routes one guest message. While the session is active the bot either
    /// replies or hands over; after handover the router stays out entirely.
    pub async fn handle_guest_message(&self, token: &str, text: &str) -> Result<()> {
        let (conversation_id, outcome) = {
            let mut guard = self.inner.lock().await;
            let session = guard
                .get_mut(token)
                .ok_or_else(|| anyhow!("unknown guest session"))?;
            session.last_activity_at = Utc::now();
            if session.status != GuestStatus::Active {
                // Sticky handoff: no bot engagement past this point.
                return Ok(());
            }
            (session.conversation_id, self.resolver.resolve(text))
        };

        if outcome.handover_requested || outcome.reply.is_none() {
            self.hand_over(token, conversation_id).await
        } else if let Some(reply) = outcome.reply {
            self.send_bot_message(conversation_id, reply).await
        } else {
            Ok(())
        }
    }

    /// Sends the canned transfer acknowledgment and only then flips the
    /// session to waiting-for-staff, so the guest is never left without a
    /// response before losing bot assistance.
    async fn hand_over(&self, token: &str, conversation_id: ConversationId) -> Result<()> {
        self.send_bot_message(conversation_id, self.transfer_message.clone())
            .await?;

        let flipped = {
            let mut guard = self.inner.lock().await;
            match guard.get_mut(token) {
                Some(session) if session.status == GuestStatus::Active => {
                    session.status = GuestStatus::WaitingForStaff;
                    true
                }
                _ => false,
            }
        };
        if flipped {
            info!(guest_token = token, "guest: handed over to staff queue");
            let _ = self.events.send(SessionEvent::GuestHandover {
                guest_token: token.to_string(),
                conversation_id,
            });
        }
        Ok(())
    }

    async fn send_bot_message(&self, conversation_id: ConversationId, body: String) -> Result<()> {
        self.api
            .send_message(
                conversation_id,
                OutgoingMessage {
                    body,
                    kind: MessageKind::System,
                    reply_to: None,
                    attachments: Vec::new(),
                    client_ref: None,
                },
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                warn!(
                    conversation_id = conversation_id.0,
                    "guest: bot message failed: {err}"
                );
                // The guest-facing surface shows a generic retry prompt; the
                // underlying failure stays in the logs.
                anyhow!("guest message could not be delivered, please retry")
            })
    }

    /// External operation performed by staff tooling; not reversible by
    /// further guest messages.
    pub async fn assign_staff(&self, token: &str, staff: UserId) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let session = guard
            .get_mut(token)
            .ok_or_else(|| anyhow!("unknown guest session"))?;
        if session.status == GuestStatus::Closed {
            return Err(anyhow!("guest session is closed"));
        }
        session.assigned_staff = Some(staff);
        info!(guest_token = token, staff_id = staff.0, "guest: staff assigned");
        Ok(())
    }

    /// Applies an externally observed status change (expiry, staff closing
    /// the conversation). Status only moves forward.
    pub async fn sync_status(&self, token: &str, status: GuestStatus) {
        let mut guard = self.inner.lock().await;
        if let Some(session) = guard.get_mut(token) {
            let forward = matches!(
                (session.status, status),
                (GuestStatus::Active, GuestStatus::WaitingForStaff)
                    | (GuestStatus::Active, GuestStatus::Closed)
                    | (GuestStatus::WaitingForStaff, GuestStatus::Closed)
            );
            if forward {
                session.status = status;
            }
        }
    }

    pub async fn close(&self, token: &str) {
        self.sync_status(token, GuestStatus::Closed).await;
    }
}

#[cfg(test)]
#[path = "tests/guest_tests.rs"]
mod tests;
