use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::message::Message;
use crate::services::conversation_session::{ConnectionStatus, SessionUpdate};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SendMessageRequest {
    #[validate(length(min = 1))]
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastMessage {
    pub content: String,
    pub sender_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl From<Message> for LastMessage {
    fn from(message: Message) -> Self {
        Self {
            content: message.content,
            sender_id: message.sender_id,
            created_at: message.created_at,
        }
    }
}

/// Inbox row for one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub room_id: Uuid,
    pub room_title: String,
    pub other_user_id: Uuid,
    pub other_user_name: String,
    pub last_message: Option<LastMessage>,
    pub unread_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// Frames pushed to a live client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Status { status: ConnectionStatus },
    Message { message: Message },
    Resync { messages: Vec<Message> },
    Error { error: String },
}

impl From<SessionUpdate> for ServerFrame {
    fn from(update: SessionUpdate) -> Self {
        match update {
            SessionUpdate::Appended(message) => ServerFrame::Message { message },
            SessionUpdate::Resynced { messages } => ServerFrame::Resync { messages },
        }
    }
}

/// Frames accepted from a live client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Draft { content: String },
    Send { content: Option<String> },
}
