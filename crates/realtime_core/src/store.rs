//! Authoritative in-memory projection of conversations, messages and typing
//! users. The single source of truth for everything the UI renders; mutated
//! only by the delivery pipeline and explicit user actions.
//!
//! Every mutation here is synchronous with respect to the caller so that
//! dedup ordering stays deterministic; all async work happens before or
//! after, never inside.

use std::collections::{BTreeMap, HashMap};

use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{ConversationSummary, MessagePayload, TypingPayload},
};

/// What applying one inbound message did to the store, so the session layer
/// can decide which events to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestApplication {
    /// The viewer had the message's conversation open.
    pub viewing: bool,
    pub unread_incremented: bool,
    /// A toast should be shown (not viewing, not a self message, not muted).
    pub toast: bool,
}

#[derive(Default)]
pub struct ConversationStore {
    conversations: Vec<ConversationSummary>,
    selected: Option<ConversationId>,
    /// History of the selected conversation, ascending by send time.
    messages: Vec<MessagePayload>,
    typing: HashMap<ConversationId, BTreeMap<UserId, String>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Display ordering: pinned first, then latest activity descending.
    pub fn list_conversations(&self) -> &[ConversationSummary] {
        &self.conversations
    }

    pub fn selected(&self) -> Option<ConversationId> {
        self.selected
    }

    pub fn messages(&self) -> &[MessagePayload] {
        &self.messages
    }

    pub fn contains(&self, conversation_id: ConversationId) -> bool {
        self.conversations
            .iter()
            .any(|c| c.conversation_id == conversation_id)
    }

    pub fn get(&self, conversation_id: ConversationId) -> Option<&ConversationSummary> {
        self.conversations
            .iter()
            .find(|c| c.conversation_id == conversation_id)
    }

    fn get_mut(&mut self, conversation_id: ConversationId) -> Option<&mut ConversationSummary> {
        self.conversations
            .iter_mut()
            .find(|c| c.conversation_id == conversation_id)
    }

    fn resort(&mut self) {
        self.conversations.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then(b.last_activity_at.cmp(&a.last_activity_at))
        });
    }

    /// Inserts or refreshes a conversation from a repository summary. The
    /// selected conversation's unread count stays zero regardless of what
    /// the server claims; the viewer is looking at it. For everything else
    /// a server count fetched before a push landed must not rewind the
    /// locally observed one, so the higher count wins.
    pub fn upsert_summary(&mut self, mut summary: ConversationSummary) {
        if self.selected == Some(summary.conversation_id) {
            summary.unread = 0;
        }
        match self.get_mut(summary.conversation_id) {
            Some(existing) => {
                summary.unread = summary.unread.max(existing.unread);
                *existing = summary;
            }
            None => self.conversations.push(summary),
        }
        self.resort();
    }

    /// Applies an inbound, already-deduplicated message. The conversation
    /// must be known; unknown conversations are fetched by the caller first.
    pub fn apply_incoming(
        &mut self,
        message: MessagePayload,
        viewer: Option<UserId>,
    ) -> IngestApplication {
        let viewing = self.selected == Some(message.conversation_id);
        let is_self = viewer.is_some() && message.sender_id == viewer;

        let mut unread_incremented = false;
        let mut toast = false;
        if let Some(conversation) = self.get_mut(message.conversation_id) {
            conversation.last_activity_at = message.sent_at;
            conversation.latest_message = Some(message.clone());
            if viewing {
                conversation.unread = 0;
            } else if !is_self {
                conversation.unread += 1;
                unread_incremented = true;
                toast = !conversation.muted;
            }
        }

        if viewing && !self.messages.iter().any(|m| m.message_id == message.message_id) {
            self.messages.push(message);
        }

        self.resort();
        IngestApplication {
            viewing,
            unread_incremented,
            toast,
        }
    }

    /// Appends a message to the visible history without counter side effects
    /// (used for locally originated sends while viewing).
    pub fn append_message(&mut self, message: MessagePayload) {
        if self.selected == Some(message.conversation_id)
            && !self.messages.iter().any(|m| m.message_id == message.message_id)
        {
            self.messages.push(message);
        }
    }

    /// Switches the viewer to a conversation: installs its history, resets
    /// the unread counter and drops stale typing entries.
    pub fn select(&mut self, conversation_id: ConversationId, history: Vec<MessagePayload>) {
        self.selected = Some(conversation_id);
        self.messages = history;
        self.reset_unread(conversation_id);
        self.typing.remove(&conversation_id);
    }

    pub fn reset_unread(&mut self, conversation_id: ConversationId) {
        if let Some(conversation) = self.get_mut(conversation_id) {
            conversation.unread = 0;
        }
    }

    pub fn remove_message(&mut self, conversation_id: ConversationId, message_id: MessageId) {
        if self.selected == Some(conversation_id) {
            self.messages.retain(|m| m.message_id != message_id);
        }
        if let Some(conversation) = self.get_mut(conversation_id) {
            if conversation
                .latest_message
                .as_ref()
                .is_some_and(|m| m.message_id == message_id)
            {
                conversation.latest_message = None;
            }
        }
        if self.selected == Some(conversation_id) {
            let replacement = self.messages.last().cloned();
            if let Some(conversation) = self.get_mut(conversation_id) {
                if conversation.latest_message.is_none() {
                    conversation.latest_message = replacement;
                }
            }
        }
    }

    pub fn remove_conversation(&mut self, conversation_id: ConversationId) {
        self.conversations
            .retain(|c| c.conversation_id != conversation_id);
        self.typing.remove(&conversation_id);
        if self.selected == Some(conversation_id) {
            self.selected = None;
            self.messages.clear();
        }
    }

    /// Records or clears a typing entry and returns the display names still
    /// typing in that conversation.
    pub fn set_typing(&mut self, payload: &TypingPayload) -> Vec<String> {
        let entry = self.typing.entry(payload.conversation_id).or_default();
        if payload.is_typing {
            entry.insert(payload.user_id, payload.display_name.clone());
        } else {
            entry.remove(&payload.user_id);
        }
        let names: Vec<String> = entry.values().cloned().collect();
        if names.is_empty() {
            self.typing.remove(&payload.conversation_id);
        }
        names
    }

    pub fn typing_names(&self, conversation_id: ConversationId) -> Vec<String> {
        self.typing
            .get(&conversation_id)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_typing(&mut self, conversation_id: ConversationId) {
        self.typing.remove(&conversation_id);
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
        self.selected = None;
        self.messages.clear();
        self.typing.clear();
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
