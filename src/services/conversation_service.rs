use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::dto::conversation_dto::ConversationSummary;
use crate::error::{Error, Result};
use crate::models::{
    actor::Actor,
    conversation::Conversation,
    message::{Message, NewMessage},
};
use crate::services::conversation_session::ConversationSession;
use crate::store::Store;

/// Longest accepted message body, in UTF-8 bytes after trimming.
pub const MAX_MESSAGE_BYTES: usize = 4000;

/// Writes one message and bumps the conversation's activity time.
///
/// Content is trimmed, must not be empty and must fit in
/// [`MAX_MESSAGE_BYTES`]. Failing to bump `updated_at`
/// only costs inbox ordering, so that error is logged and dropped.
pub(crate) async fn deliver(
    store: &dyn Store,
    conversation_id: Uuid,
    sender_id: Uuid,
    content: &str,
) -> Result<Message> {
    let content = content.trim();
    if content.is_empty() {
        return Err(Error::BadRequest("Message cannot be empty".into()));
    }
    if content.len() > MAX_MESSAGE_BYTES {
        return Err(Error::BadRequest(format!(
            "Message is too long ({} bytes, at most {})",
            content.len(),
            MAX_MESSAGE_BYTES
        )));
    }

    let message = store
        .insert_message(NewMessage {
            conversation_id,
            sender_id,
            content: content.to_string(),
        })
        .await?;

    if let Err(e) = store.touch_conversation(conversation_id).await {
        tracing::warn!(%conversation_id, error = %e, "Failed to update conversation activity");
    }

    Ok(message)
}

#[derive(Clone)]
pub struct ConversationService {
    store: Arc<dyn Store>,
    reconnect_delay: Duration,
}

impl ConversationService {
    pub fn new(store: Arc<dyn Store>, reconnect_delay: Duration) -> Self {
        Self {
            store,
            reconnect_delay,
        }
    }

    /// Loads a conversation the viewer takes part in.
    async fn participating(&self, conversation_id: Uuid, viewer: &Actor) -> Result<Conversation> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| Error::NotFound("Conversation not found".into()))?;
        if !conversation.has_participant(viewer.id) {
            return Err(Error::Forbidden(
                "You are not part of this conversation".into(),
            ));
        }
        Ok(conversation)
    }

    pub async fn open(&self, conversation_id: Uuid, viewer: &Actor) -> Result<ConversationSession> {
        let conversation = self.participating(conversation_id, viewer).await?;
        ConversationSession::open(
            self.store.clone(),
            conversation,
            *viewer,
            self.reconnect_delay,
        )
        .await
    }

    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        sender: &Actor,
        content: &str,
    ) -> Result<Message> {
        self.participating(conversation_id, sender).await?;
        let message = deliver(self.store.as_ref(), conversation_id, sender.id, content).await?;
        tracing::debug!(%conversation_id, message_id = %message.id, "Message sent");
        Ok(message)
    }

    /// Ordered history. Messages from the other participant are marked read.
    pub async fn history(&self, conversation_id: Uuid, viewer: &Actor) -> Result<Vec<Message>> {
        self.participating(conversation_id, viewer).await?;
        let messages = self.store.list_messages(conversation_id).await?;
        if let Err(e) = self.store.mark_read(conversation_id, viewer.id).await {
            tracing::warn!(%conversation_id, error = %e, "Failed to mark messages read");
        }
        Ok(messages)
    }

    /// Inbox of `viewer`, most recently active first.
    pub async fn list_for(&self, viewer: &Actor) -> Result<Vec<ConversationSummary>> {
        let conversations = self.store.list_conversations(viewer.participant()).await?;

        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let other_user_id = conversation
                .counterpart_of(viewer.id)
                .ok_or_else(|| Error::Internal("Conversation listed for a non-participant".into()))?;

            let room_title = self
                .store
                .get_room(conversation.room_id)
                .await?
                .map(|r| r.title)
                .unwrap_or_default();
            let other_user_name = self
                .store
                .get_profile(other_user_id)
                .await?
                .map(|p| p.full_name)
                .unwrap_or_default();
            let last_message = self.store.last_message(conversation.id).await?;
            let unread_count = self.store.count_unread(conversation.id, viewer.id).await?;

            summaries.push(ConversationSummary {
                id: conversation.id,
                room_id: conversation.room_id,
                room_title,
                other_user_id,
                other_user_name,
                last_message: last_message.map(Into::into),
                unread_count,
                updated_at: conversation.updated_at,
            });
        }
        Ok(summaries)
    }
}
