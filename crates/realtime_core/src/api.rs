//! Conversation/message repository client. The repository itself is an
//! external collaborator; this module only shapes the request/response
//! contract the coordinator consumes.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use shared::{
    domain::{ConversationId, MessageId},
    protocol::{ConversationSummary, DataEnvelope, MessagePayload, OutgoingMessage},
};

#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn list_conversations(&self, page: u32) -> Result<Vec<ConversationSummary>>;
    async fn get_conversation(&self, conversation_id: ConversationId)
        -> Result<ConversationSummary>;
    async fn get_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>>;
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        message: OutgoingMessage,
    ) -> Result<MessagePayload>;
    async fn mark_as_read(&self, conversation_id: ConversationId) -> Result<()>;
    async fn delete_message(&self, message_id: MessageId) -> Result<()>;
}

/// Fallback used before a session is wired to a real backend.
pub struct MissingConversationApi;

#[async_trait]
impl ConversationApi for MissingConversationApi {
    async fn list_conversations(&self, _page: u32) -> Result<Vec<ConversationSummary>> {
        Err(anyhow!("conversation repository is unavailable"))
    }

    async fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ConversationSummary> {
        Err(anyhow!(
            "conversation repository is unavailable for conversation {}",
            conversation_id.0
        ))
    }

    async fn get_messages(
        &self,
        conversation_id: ConversationId,
        _limit: u32,
        _before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>> {
        Err(anyhow!(
            "conversation repository is unavailable for conversation {}",
            conversation_id.0
        ))
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        _message: OutgoingMessage,
    ) -> Result<MessagePayload> {
        Err(anyhow!(
            "conversation repository is unavailable for conversation {}",
            conversation_id.0
        ))
    }

    async fn mark_as_read(&self, conversation_id: ConversationId) -> Result<()> {
        Err(anyhow!(
            "conversation repository is unavailable for conversation {}",
            conversation_id.0
        ))
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        Err(anyhow!(
            "conversation repository is unavailable for message {}",
            message_id.0
        ))
    }
}

#[derive(Serialize)]
struct ListMessagesQuery {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<i64>,
}

pub struct HttpConversationApi {
    http: Client,
    base_url: String,
}

impl HttpConversationApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn list_conversations(&self, page: u32) -> Result<Vec<ConversationSummary>> {
        let envelope: DataEnvelope<Vec<ConversationSummary>> = self
            .http
            .get(format!("{}/conversations", self.base_url))
            .query(&[("page", page)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.data)
    }

    async fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ConversationSummary> {
        let envelope: DataEnvelope<ConversationSummary> = self
            .http
            .get(format!(
                "{}/conversations/{}",
                self.base_url, conversation_id.0
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.data)
    }

    async fn get_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>> {
        let limit = limit.clamp(1, 100);
        let envelope: DataEnvelope<Vec<MessagePayload>> = self
            .http
            .get(format!(
                "{}/conversations/{}/messages",
                self.base_url, conversation_id.0
            ))
            .query(&ListMessagesQuery {
                limit,
                before: before.map(|id| id.0),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.data)
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        message: OutgoingMessage,
    ) -> Result<MessagePayload> {
        let envelope: DataEnvelope<MessagePayload> = self
            .http
            .post(format!(
                "{}/conversations/{}/messages",
                self.base_url, conversation_id.0
            ))
            .json(&message)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.data)
    }

    async fn mark_as_read(&self, conversation_id: ConversationId) -> Result<()> {
        self.http
            .post(format!(
                "{}/conversations/{}/read",
                self.base_url, conversation_id.0
            ))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        self.http
            .delete(format!("{}/messages/{}", self.base_url, message_id.0))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
