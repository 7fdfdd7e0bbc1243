use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    CallKind, ConversationId, ConversationKind, GuestStatus, MessageId, MessageKind, UserId,
};

/// REST envelope used by the conversation repository: `{"data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    /// `None` for system/bot messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub body: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub filename: String,
    pub url: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Viewer-scoped conversation projection as served by the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub title: String,
    pub member_ids: Vec<UserId>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub unread: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_message: Option<MessagePayload>,
    pub last_activity_at: DateTime<Utc>,
}

/// Client-side message submission body; the repository assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub body: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
    /// Echo token so the sender can correlate the created message with the
    /// optimistic local copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingPayload {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub display_name: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: String,
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

/// Ephemeral peer-to-peer call signaling relayed through the push transport.
/// None of these are persisted or acknowledged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CallSignal {
    Initiate {
        conversation_id: ConversationId,
        kind: CallKind,
    },
    Accept {
        conversation_id: ConversationId,
    },
    Reject {
        conversation_id: ConversationId,
    },
    End {
        conversation_id: ConversationId,
    },
    Busy {
        conversation_id: ConversationId,
    },
    Offer {
        conversation_id: ConversationId,
        description: SessionDescription,
    },
    Answer {
        conversation_id: ConversationId,
        description: SessionDescription,
    },
    IceCandidate {
        conversation_id: ConversationId,
        candidate: IceCandidatePayload,
    },
}

impl CallSignal {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            CallSignal::Initiate {
                conversation_id, ..
            }
            | CallSignal::Accept { conversation_id }
            | CallSignal::Reject { conversation_id }
            | CallSignal::End { conversation_id }
            | CallSignal::Busy { conversation_id }
            | CallSignal::Offer {
                conversation_id, ..
            }
            | CallSignal::Answer {
                conversation_id, ..
            }
            | CallSignal::IceCandidate {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}

/// Events arriving on subscribed channels, regardless of whether the channel
/// is per-conversation or the viewer's notification channel. On the socket
/// the enum tag travels as the event name and the content as the event
/// payload; [`ChannelEvent::to_parts`] and [`ChannelEvent::from_parts`]
/// bridge the two shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChannelEvent {
    MessageCreated {
        message: MessagePayload,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    Typing(TypingPayload),
    CallSignal {
        from: UserId,
        signal: CallSignal,
    },
    GuestSessionUpdated {
        guest_token: String,
        conversation_id: ConversationId,
        status: GuestStatus,
    },
}

impl ChannelEvent {
    /// Splits the event into the socket-level `(event name, payload)` pair.
    pub fn to_parts(&self) -> Result<(String, serde_json::Value), serde_json::Error> {
        let value = serde_json::to_value(self)?;
        let name = value
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let payload = value
            .get("payload")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        Ok((name, payload))
    }

    /// Reassembles an event from the socket-level pair.
    pub fn from_parts(
        name: &str,
        payload: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "type": name,
            "payload": payload,
        }))
    }
}
