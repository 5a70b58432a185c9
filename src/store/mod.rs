//! Data store seam.
//!
//! Everything the application and messaging services read or write goes
//! through [`Store`]. The store offers no transactions: multi-step flows are
//! sequences of independent calls and the services decide which steps are
//! allowed to fail.

pub mod feed;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    actor::Participant,
    application::{Application, ApplicationStatus, NewApplication},
    conversation::{Conversation, NewConversation},
    message::{Message, NewMessage},
    payment::{NewPayment, Payment},
    profile::{Profile, StudentProfile},
    rental::{NewRental, Rental},
    room::Room,
};

pub use feed::{FeedEvent, MessageFeed};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    /// A unique constraint rejected the write; the payload names the
    /// constraint or carries the driver message.
    #[error("unique constraint violation: {0}")]
    UniqueViolation(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }
}

const PG_UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) if db.code().as_deref() == Some(PG_UNIQUE_VIOLATION) => {
                StoreError::UniqueViolation(
                    db.constraint()
                        .map(str::to_string)
                        .unwrap_or_else(|| db.message().to_string()),
                )
            }
            other => StoreError::Database(other),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_room(&self, id: Uuid) -> StoreResult<Option<Room>>;
    async fn set_room_availability(&self, id: Uuid, is_available: bool) -> StoreResult<Room>;

    async fn get_profile(&self, id: Uuid) -> StoreResult<Option<Profile>>;
    async fn get_profiles(&self, ids: &[Uuid]) -> StoreResult<Vec<Profile>>;
    async fn get_student_profiles(&self, ids: &[Uuid]) -> StoreResult<Vec<StudentProfile>>;

    async fn insert_application(&self, new: NewApplication) -> StoreResult<Application>;
    async fn get_application(&self, id: Uuid) -> StoreResult<Option<Application>>;
    async fn find_application(
        &self,
        room_id: Uuid,
        student_id: Uuid,
    ) -> StoreResult<Option<Application>>;
    /// Newest first.
    async fn list_applications_for_room(&self, room_id: Uuid) -> StoreResult<Vec<Application>>;
    /// Newest first.
    async fn list_applications_for_student(
        &self,
        student_id: Uuid,
    ) -> StoreResult<Vec<Application>>;
    async fn set_application_status(
        &self,
        id: Uuid,
        status: ApplicationStatus,
    ) -> StoreResult<Application>;
    /// Rejects every `pending` application of `room_id` except `keep`.
    /// Returns how many rows changed.
    async fn reject_pending_siblings(&self, room_id: Uuid, keep: Uuid) -> StoreResult<u64>;

    /// Fails with [`StoreError::UniqueViolation`] when the
    /// (room, elderly, student) triple already has a conversation.
    async fn insert_conversation(&self, new: NewConversation) -> StoreResult<Conversation>;
    async fn get_conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>>;
    /// Most recently active first.
    async fn list_conversations(&self, participant: Participant) -> StoreResult<Vec<Conversation>>;
    /// Bumps `updated_at` to now.
    async fn touch_conversation(&self, id: Uuid) -> StoreResult<()>;

    async fn insert_message(&self, new: NewMessage) -> StoreResult<Message>;
    /// Oldest first.
    async fn list_messages(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>>;
    async fn last_message(&self, conversation_id: Uuid) -> StoreResult<Option<Message>>;
    async fn count_unread(&self, conversation_id: Uuid, viewer_id: Uuid) -> StoreResult<i64>;
    /// Marks every unread message not sent by `viewer_id` as read.
    async fn mark_read(&self, conversation_id: Uuid, viewer_id: Uuid) -> StoreResult<u64>;

    async fn insert_rental(&self, new: NewRental) -> StoreResult<Rental>;
    async fn find_active_rental(
        &self,
        room_id: Uuid,
        student_id: Uuid,
    ) -> StoreResult<Option<Rental>>;
    async fn insert_payment(&self, new: NewPayment) -> StoreResult<Payment>;

    /// Opens the insert feed of one conversation. Lifecycle (subscribed,
    /// error, timeout) is reported in-band on the returned feed.
    async fn subscribe_messages(&self, conversation_id: Uuid) -> StoreResult<MessageFeed>;
}
