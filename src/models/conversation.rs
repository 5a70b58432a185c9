use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub room_id: Uuid,
    pub elderly_id: Uuid,
    pub student_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, profile_id: Uuid) -> bool {
        self.elderly_id == profile_id || self.student_id == profile_id
    }

    /// The other side of the conversation, if `profile_id` takes part in it.
    pub fn counterpart_of(&self, profile_id: Uuid) -> Option<Uuid> {
        if profile_id == self.elderly_id {
            Some(self.student_id)
        } else if profile_id == self.student_id {
            Some(self.elderly_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub room_id: Uuid,
    pub elderly_id: Uuid,
    pub student_id: Uuid,
}
