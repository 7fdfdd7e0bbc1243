//! Typed events emitted to the presentation layer. This is the only UI
//! contract; the core renders nothing itself.

use push_transport::ConnectionState;
use shared::{
    domain::{CallEndReason, ConversationId, GuestStatus, MessageId},
    protocol::MessagePayload,
};

use crate::call::CallSnapshot;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    NewMessage {
        message: MessagePayload,
    },
    ShowToast {
        conversation_id: ConversationId,
        title: String,
        body: String,
    },
    SelectConversation(ConversationId),
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    TypingChanged {
        conversation_id: ConversationId,
        names: Vec<String>,
    },
    ConnectionChanged(ConnectionState),
    CallChanged(CallSnapshot),
    CallEnded {
        reason: CallEndReason,
    },
    GuestHandover {
        guest_token: String,
        conversation_id: ConversationId,
    },
    GuestSessionUpdated {
        guest_token: String,
        conversation_id: ConversationId,
        status: GuestStatus,
    },
    Error(String),
}
