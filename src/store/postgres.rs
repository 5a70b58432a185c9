use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::feed::{FeedEvent, MessageFeed, FEED_BUFFER};
use super::{Store, StoreError, StoreResult};
use crate::models::{
    actor::Participant,
    application::{Application, ApplicationStatus, NewApplication},
    conversation::{Conversation, NewConversation},
    message::{Message, NewMessage},
    payment::{NewPayment, Payment},
    profile::{Profile, StudentProfile},
    rental::{NewRental, Rental, RentalStatus},
    room::Room,
};

const ROOM_COLUMNS: &str = "id, elderly_id, title, location, monthly_price, total_monthly_price, is_available, created_at, updated_at";
const PROFILE_COLUMNS: &str = "id, user_type, full_name, age, bio, location, created_at, updated_at";
const APPLICATION_COLUMNS: &str = "id, room_id, student_id, status, message, created_at, updated_at";
const CONVERSATION_COLUMNS: &str = "id, room_id, elderly_id, student_id, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, is_read, created_at";
const RENTAL_COLUMNS: &str = "id, room_id, student_id, elderly_id, monthly_amount, start_date, end_date, status, created_at";

/// Name of the `LISTEN` channel the insert trigger notifies for a conversation.
pub fn feed_channel(conversation_id: Uuid) -> String {
    format!("conversation_{}", conversation_id.simple())
}

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Payload of a `messages` insert notification. The row itself is fetched
/// afterwards, so the payload stays far below the `NOTIFY` size limit.
#[derive(Debug, Deserialize)]
struct InsertNotice {
    id: Uuid,
    conversation_id: Uuid,
}

async fn fetch_message(pool: &PgPool, id: Uuid) -> Result<Option<Message>, sqlx::Error> {
    sqlx::query_as::<_, Message>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_room(&self, id: Uuid) -> StoreResult<Option<Room>> {
        let room = sqlx::query_as::<_, Room>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(room)
    }

    async fn set_room_availability(&self, id: Uuid, is_available: bool) -> StoreResult<Room> {
        let room = sqlx::query_as::<_, Room>(&format!(
            r#"
            UPDATE rooms
            SET is_available = $1, updated_at = NOW()
            WHERE id = $2
            RETURNING {ROOM_COLUMNS}
            "#
        ))
        .bind(is_available)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(room)
    }

    async fn get_profile(&self, id: Uuid) -> StoreResult<Option<Profile>> {
        let profile = sqlx::query_as::<_, Profile>(&format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(profile)
    }

    async fn get_profiles(&self, ids: &[Uuid]) -> StoreResult<Vec<Profile>> {
        let profiles = sqlx::query_as::<_, Profile>(&format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(profiles)
    }

    async fn get_student_profiles(&self, ids: &[Uuid]) -> StoreResult<Vec<StudentProfile>> {
        let profiles = sqlx::query_as::<_, StudentProfile>(
            r#"
            SELECT id, university, course, student_type
            FROM student_profiles
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(profiles)
    }

    async fn insert_application(&self, new: NewApplication) -> StoreResult<Application> {
        let application = sqlx::query_as::<_, Application>(&format!(
            r#"
            INSERT INTO room_applications (room_id, student_id, message, status)
            VALUES ($1, $2, $3, 'pending')
            RETURNING {APPLICATION_COLUMNS}
            "#
        ))
        .bind(new.room_id)
        .bind(new.student_id)
        .bind(&new.message)
        .fetch_one(&self.pool)
        .await?;
        Ok(application)
    }

    async fn get_application(&self, id: Uuid) -> StoreResult<Option<Application>> {
        let application = sqlx::query_as::<_, Application>(&format!(
            "SELECT {APPLICATION_COLUMNS} FROM room_applications WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(application)
    }

    async fn find_application(
        &self,
        room_id: Uuid,
        student_id: Uuid,
    ) -> StoreResult<Option<Application>> {
        let application = sqlx::query_as::<_, Application>(&format!(
            r#"
            SELECT {APPLICATION_COLUMNS} FROM room_applications
            WHERE room_id = $1 AND student_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(room_id)
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(application)
    }

    async fn list_applications_for_room(&self, room_id: Uuid) -> StoreResult<Vec<Application>> {
        let applications = sqlx::query_as::<_, Application>(&format!(
            r#"
            SELECT {APPLICATION_COLUMNS} FROM room_applications
            WHERE room_id = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(applications)
    }

    async fn list_applications_for_student(
        &self,
        student_id: Uuid,
    ) -> StoreResult<Vec<Application>> {
        let applications = sqlx::query_as::<_, Application>(&format!(
            r#"
            SELECT {APPLICATION_COLUMNS} FROM room_applications
            WHERE student_id = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(applications)
    }

    async fn set_application_status(
        &self,
        id: Uuid,
        status: ApplicationStatus,
    ) -> StoreResult<Application> {
        let application = sqlx::query_as::<_, Application>(&format!(
            r#"
            UPDATE room_applications
            SET status = $1, updated_at = NOW()
            WHERE id = $2
            RETURNING {APPLICATION_COLUMNS}
            "#
        ))
        .bind(status)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(application)
    }

    async fn reject_pending_siblings(&self, room_id: Uuid, keep: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE room_applications
            SET status = 'rejected', updated_at = NOW()
            WHERE room_id = $1 AND status = 'pending' AND id <> $2
            "#,
        )
        .bind(room_id)
        .bind(keep)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_conversation(&self, new: NewConversation) -> StoreResult<Conversation> {
        let conversation = sqlx::query_as::<_, Conversation>(&format!(
            r#"
            INSERT INTO conversations (room_id, elderly_id, student_id)
            VALUES ($1, $2, $3)
            RETURNING {CONVERSATION_COLUMNS}
            "#
        ))
        .bind(new.room_id)
        .bind(new.elderly_id)
        .bind(new.student_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
        let conversation = sqlx::query_as::<_, Conversation>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(conversation)
    }

    async fn list_conversations(&self, participant: Participant) -> StoreResult<Vec<Conversation>> {
        let conversations = sqlx::query_as::<_, Conversation>(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS} FROM conversations
            WHERE {} = $1
            ORDER BY updated_at DESC
            "#,
            participant.column()
        ))
        .bind(participant.id())
        .fetch_all(&self.pool)
        .await?;
        Ok(conversations)
    }

    async fn touch_conversation(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("UPDATE conversations SET updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn insert_message(&self, new: NewMessage) -> StoreResult<Message> {
        let message = sqlx::query_as::<_, Message>(&format!(
            r#"
            INSERT INTO messages (conversation_id, sender_id, content, is_read)
            VALUES ($1, $2, $3, FALSE)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(new.conversation_id)
        .bind(new.sender_id)
        .bind(&new.content)
        .fetch_one(&self.pool)
        .await?;
        Ok(message)
    }

    async fn list_messages(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at ASC
            "#
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    async fn last_message(&self, conversation_id: Uuid) -> StoreResult<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(message)
    }

    async fn count_unread(&self, conversation_id: Uuid, viewer_id: Uuid) -> StoreResult<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE conversation_id = $1 AND sender_id <> $2 AND is_read = FALSE
            "#,
        )
        .bind(conversation_id)
        .bind(viewer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }

    async fn mark_read(&self, conversation_id: Uuid, viewer_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET is_read = TRUE
            WHERE conversation_id = $1 AND sender_id <> $2 AND is_read = FALSE
            "#,
        )
        .bind(conversation_id)
        .bind(viewer_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_rental(&self, new: NewRental) -> StoreResult<Rental> {
        let rental = sqlx::query_as::<_, Rental>(&format!(
            r#"
            INSERT INTO rentals (room_id, student_id, elderly_id, monthly_amount, start_date, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {RENTAL_COLUMNS}
            "#
        ))
        .bind(new.room_id)
        .bind(new.student_id)
        .bind(new.elderly_id)
        .bind(new.monthly_amount)
        .bind(new.start_date)
        .bind(RentalStatus::Active)
        .fetch_one(&self.pool)
        .await?;
        Ok(rental)
    }

    async fn find_active_rental(
        &self,
        room_id: Uuid,
        student_id: Uuid,
    ) -> StoreResult<Option<Rental>> {
        let rental = sqlx::query_as::<_, Rental>(&format!(
            r#"
            SELECT {RENTAL_COLUMNS} FROM rentals
            WHERE room_id = $1 AND student_id = $2 AND status = 'active'
            LIMIT 1
            "#
        ))
        .bind(room_id)
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(rental)
    }

    async fn insert_payment(&self, new: NewPayment) -> StoreResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (rental_id, amount, platform_fee, elderly_amount, payment_date, due_date, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, rental_id, amount, platform_fee, elderly_amount, payment_date, due_date, status, created_at
            "#,
        )
        .bind(new.rental_id)
        .bind(new.split.amount)
        .bind(new.split.platform_fee)
        .bind(new.split.elderly_amount)
        .bind(new.payment_date)
        .bind(new.due_date)
        .bind(new.status)
        .fetch_one(&self.pool)
        .await?;
        Ok(payment)
    }

    async fn subscribe_messages(&self, conversation_id: Uuid) -> StoreResult<MessageFeed> {
        let channel = feed_channel(conversation_id);
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let pool = self.pool.clone();

        let task = tokio::spawn(async move {
            let listen = async {
                let mut listener = PgListener::connect_with(&pool).await?;
                listener.listen(&channel).await?;
                Ok::<_, sqlx::Error>(listener)
            };

            let mut listener = match tokio::time::timeout(SUBSCRIBE_TIMEOUT, listen).await {
                Ok(Ok(listener)) => listener,
                Ok(Err(e)) => {
                    tracing::error!(%conversation_id, error = %e, "Failed to listen for messages");
                    let _ = tx.send(FeedEvent::Error(e.to_string())).await;
                    return;
                }
                Err(_) => {
                    tracing::error!(%conversation_id, "Timed out subscribing to messages");
                    let _ = tx.send(FeedEvent::TimedOut).await;
                    return;
                }
            };

            if tx.send(FeedEvent::Subscribed).await.is_err() {
                return;
            }
            tracing::debug!(%conversation_id, %channel, "Listening for message inserts");

            loop {
                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        let notice = match serde_json::from_str::<InsertNotice>(notification.payload()) {
                            Ok(notice) if notice.conversation_id == conversation_id => notice,
                            Ok(_) => continue,
                            Err(e) => {
                                tracing::warn!(%conversation_id, error = %e, "Dropping malformed message notification");
                                continue;
                            }
                        };
                        match fetch_message(&pool, notice.id).await {
                            Ok(Some(message)) => {
                                if tx.send(FeedEvent::Inserted(message)).await.is_err() {
                                    return;
                                }
                            }
                            Ok(None) => {
                                tracing::debug!(%conversation_id, message_id = %notice.id, "Notified message is gone");
                            }
                            // A resync after reconnecting picks the message up.
                            Err(e) => {
                                let _ = tx.send(FeedEvent::Error(e.to_string())).await;
                                return;
                            }
                        }
                    }
                    // The listener lost its connection; anything sent meanwhile is gone.
                    Ok(None) => {
                        let _ = tx
                            .send(FeedEvent::Error("listener connection lost".to_string()))
                            .await;
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(FeedEvent::Error(e.to_string())).await;
                        return;
                    }
                }
            }
        });

        Ok(MessageFeed::new(rx, Some(task.abort_handle())))
    }
}
