use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::feed::{FeedEvent, MessageFeed, FEED_BUFFER};
use super::{Store, StoreError, StoreResult};
use crate::models::{
    actor::{Participant, Role},
    application::{Application, ApplicationStatus, NewApplication},
    conversation::{Conversation, NewConversation},
    message::{Message, NewMessage},
    payment::{NewPayment, Payment},
    profile::{Profile, StudentProfile, StudentType},
    rental::{NewRental, Rental, RentalStatus},
    room::Room,
};

/// Operations that [`MemoryStore::fail_next`] can make fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    SetRoomAvailability,
    GetProfiles,
    GetStudentProfiles,
    InsertApplication,
    SetApplicationStatus,
    RejectPendingSiblings,
    InsertConversation,
    TouchConversation,
    InsertMessage,
    ListMessages,
    MarkRead,
    InsertRental,
    InsertPayment,
    Subscribe,
}

#[derive(Default)]
struct Tables {
    profiles: HashMap<Uuid, Profile>,
    student_profiles: HashMap<Uuid, StudentProfile>,
    rooms: HashMap<Uuid, Room>,
    applications: Vec<Application>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    rentals: Vec<Rental>,
    payments: Vec<Payment>,
    feeds: HashMap<Uuid, Vec<mpsc::Sender<FeedEvent>>>,
    failures: HashSet<Op>,
    last_tick: Option<DateTime<Utc>>,
}

impl Tables {
    /// Strictly increasing timestamps so ordering by `created_at` is stable.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last_tick {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_tick = Some(next);
        next
    }

    fn check(&mut self, op: Op) -> StoreResult<()> {
        if self.failures.remove(&op) {
            return Err(StoreError::Unavailable(format!("injected failure: {:?}", op)));
        }
        Ok(())
    }

    fn publish(&mut self, conversation_id: Uuid, event: FeedEvent) {
        if let Some(senders) = self.feeds.get_mut(&conversation_id) {
            senders.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(%conversation_id, "Feed subscriber lagging, event dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }
}

/// In-process [`Store`] with the same uniqueness rules as the Postgres
/// schema. Used by tests and by `STORE_BACKEND=memory`.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    auto_ack: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            auto_ack: true,
        }
    }

    /// When disabled, new feeds stay unacknowledged until
    /// [`MemoryStore::emit`] sends [`FeedEvent::Subscribed`].
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes the next call of `op` fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, op: Op) {
        self.tables().failures.insert(op);
    }

    /// Pushes a raw event to every open feed of a conversation.
    pub fn emit(&self, conversation_id: Uuid, event: FeedEvent) {
        self.tables().publish(conversation_id, event);
    }

    /// Closes every open feed of a conversation, as a dropped transport would.
    pub fn drop_feeds(&self, conversation_id: Uuid) {
        self.tables().feeds.remove(&conversation_id);
    }

    pub fn open_feeds(&self, conversation_id: Uuid) -> usize {
        self.tables()
            .feeds
            .get(&conversation_id)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn add_profile(&self, id: Uuid, user_type: Role, full_name: &str) -> Profile {
        let mut tables = self.tables();
        let now = tables.tick();
        let profile = Profile {
            id,
            user_type,
            full_name: full_name.to_string(),
            age: 0,
            bio: String::new(),
            location: String::new(),
            created_at: now,
            updated_at: now,
        };
        tables.profiles.insert(id, profile.clone());
        profile
    }

    pub fn add_student_profile(
        &self,
        id: Uuid,
        university: &str,
        course: &str,
        student_type: StudentType,
    ) -> StudentProfile {
        let profile = StudentProfile {
            id,
            university: university.to_string(),
            course: course.to_string(),
            student_type,
        };
        self.tables().student_profiles.insert(id, profile.clone());
        profile
    }

    pub fn add_room(
        &self,
        elderly_id: Uuid,
        title: &str,
        monthly_price: Decimal,
        total_monthly_price: Option<Decimal>,
    ) -> Room {
        let mut tables = self.tables();
        let now = tables.tick();
        let room = Room {
            id: Uuid::new_v4(),
            elderly_id,
            title: title.to_string(),
            location: String::new(),
            monthly_price,
            total_monthly_price,
            is_available: true,
            created_at: now,
            updated_at: now,
        };
        tables.rooms.insert(room.id, room.clone());
        room
    }

    /// Inserts a message without notifying any feed, as if the event were
    /// lost in transit.
    pub fn insert_message_unnotified(&self, new: NewMessage) -> Message {
        let mut tables = self.tables();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            content: new.content,
            is_read: false,
            created_at: tables.tick(),
        };
        tables.messages.push(message.clone());
        message
    }

    pub fn rentals(&self) -> Vec<Rental> {
        self.tables().rentals.clone()
    }

    pub fn payments(&self) -> Vec<Payment> {
        self.tables().payments.clone()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.tables().conversations.clone()
    }

    pub fn messages(&self, conversation_id: Uuid) -> Vec<Message> {
        self.tables()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_room(&self, id: Uuid) -> StoreResult<Option<Room>> {
        Ok(self.tables().rooms.get(&id).cloned())
    }

    async fn set_room_availability(&self, id: Uuid, is_available: bool) -> StoreResult<Room> {
        let mut tables = self.tables();
        tables.check(Op::SetRoomAvailability)?;
        let now = tables.tick();
        let room = tables.rooms.get_mut(&id).ok_or(StoreError::NotFound)?;
        room.is_available = is_available;
        room.updated_at = now;
        Ok(room.clone())
    }

    async fn get_profile(&self, id: Uuid) -> StoreResult<Option<Profile>> {
        Ok(self.tables().profiles.get(&id).cloned())
    }

    async fn get_profiles(&self, ids: &[Uuid]) -> StoreResult<Vec<Profile>> {
        let mut tables = self.tables();
        tables.check(Op::GetProfiles)?;
        Ok(ids
            .iter()
            .filter_map(|id| tables.profiles.get(id).cloned())
            .collect())
    }

    async fn get_student_profiles(&self, ids: &[Uuid]) -> StoreResult<Vec<StudentProfile>> {
        let mut tables = self.tables();
        tables.check(Op::GetStudentProfiles)?;
        Ok(ids
            .iter()
            .filter_map(|id| tables.student_profiles.get(id).cloned())
            .collect())
    }

    async fn insert_application(&self, new: NewApplication) -> StoreResult<Application> {
        let mut tables = self.tables();
        tables.check(Op::InsertApplication)?;
        if tables
            .applications
            .iter()
            .any(|a| a.room_id == new.room_id && a.student_id == new.student_id)
        {
            return Err(StoreError::UniqueViolation(
                "room_applications_room_id_student_id_key".to_string(),
            ));
        }
        let now = tables.tick();
        let application = Application {
            id: Uuid::new_v4(),
            room_id: new.room_id,
            student_id: new.student_id,
            status: ApplicationStatus::Pending,
            message: new.message,
            created_at: now,
            updated_at: now,
        };
        tables.applications.push(application.clone());
        Ok(application)
    }

    async fn get_application(&self, id: Uuid) -> StoreResult<Option<Application>> {
        Ok(self
            .tables()
            .applications
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    async fn find_application(
        &self,
        room_id: Uuid,
        student_id: Uuid,
    ) -> StoreResult<Option<Application>> {
        Ok(self
            .tables()
            .applications
            .iter()
            .rev()
            .find(|a| a.room_id == room_id && a.student_id == student_id)
            .cloned())
    }

    async fn list_applications_for_room(&self, room_id: Uuid) -> StoreResult<Vec<Application>> {
        Ok(self
            .tables()
            .applications
            .iter()
            .rev()
            .filter(|a| a.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn list_applications_for_student(
        &self,
        student_id: Uuid,
    ) -> StoreResult<Vec<Application>> {
        Ok(self
            .tables()
            .applications
            .iter()
            .rev()
            .filter(|a| a.student_id == student_id)
            .cloned()
            .collect())
    }

    async fn set_application_status(
        &self,
        id: Uuid,
        status: ApplicationStatus,
    ) -> StoreResult<Application> {
        let mut tables = self.tables();
        tables.check(Op::SetApplicationStatus)?;
        let now = tables.tick();
        let application = tables
            .applications
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(StoreError::NotFound)?;
        application.status = status;
        application.updated_at = now;
        Ok(application.clone())
    }

    async fn reject_pending_siblings(&self, room_id: Uuid, keep: Uuid) -> StoreResult<u64> {
        let mut tables = self.tables();
        tables.check(Op::RejectPendingSiblings)?;
        let now = tables.tick();
        let mut changed = 0;
        for application in tables.applications.iter_mut().filter(|a| {
            a.room_id == room_id && a.id != keep && a.status == ApplicationStatus::Pending
        }) {
            application.status = ApplicationStatus::Rejected;
            application.updated_at = now;
            changed += 1;
        }
        Ok(changed)
    }

    async fn insert_conversation(&self, new: NewConversation) -> StoreResult<Conversation> {
        let mut tables = self.tables();
        tables.check(Op::InsertConversation)?;
        if tables.conversations.iter().any(|c| {
            c.room_id == new.room_id
                && c.elderly_id == new.elderly_id
                && c.student_id == new.student_id
        }) {
            return Err(StoreError::UniqueViolation(
                "conversations_room_id_elderly_id_student_id_key".to_string(),
            ));
        }
        let now = tables.tick();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            room_id: new.room_id,
            elderly_id: new.elderly_id,
            student_id: new.student_id,
            created_at: now,
            updated_at: now,
        };
        tables.conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
        Ok(self
            .tables()
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn list_conversations(&self, participant: Participant) -> StoreResult<Vec<Conversation>> {
        let mut conversations: Vec<Conversation> = self
            .tables()
            .conversations
            .iter()
            .filter(|c| match participant {
                Participant::Elderly(id) => c.elderly_id == id,
                Participant::Student(id) => c.student_id == id,
            })
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn touch_conversation(&self, id: Uuid) -> StoreResult<()> {
        let mut tables = self.tables();
        tables.check(Op::TouchConversation)?;
        let now = tables.tick();
        let conversation = tables
            .conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::NotFound)?;
        conversation.updated_at = now;
        Ok(())
    }

    async fn insert_message(&self, new: NewMessage) -> StoreResult<Message> {
        let mut tables = self.tables();
        tables.check(Op::InsertMessage)?;
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            content: new.content,
            is_read: false,
            created_at: tables.tick(),
        };
        tables.messages.push(message.clone());
        tables.publish(message.conversation_id, FeedEvent::Inserted(message.clone()));
        Ok(message)
    }

    async fn list_messages(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>> {
        let mut tables = self.tables();
        tables.check(Op::ListMessages)?;
        let mut messages: Vec<Message> = tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    async fn last_message(&self, conversation_id: Uuid) -> StoreResult<Option<Message>> {
        Ok(self
            .tables()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .max_by_key(|m| m.created_at)
            .cloned())
    }

    async fn count_unread(&self, conversation_id: Uuid, viewer_id: Uuid) -> StoreResult<i64> {
        Ok(self
            .tables()
            .messages
            .iter()
            .filter(|m| {
                m.conversation_id == conversation_id && m.sender_id != viewer_id && !m.is_read
            })
            .count() as i64)
    }

    async fn mark_read(&self, conversation_id: Uuid, viewer_id: Uuid) -> StoreResult<u64> {
        let mut tables = self.tables();
        tables.check(Op::MarkRead)?;
        let mut changed = 0;
        for message in tables.messages.iter_mut().filter(|m| {
            m.conversation_id == conversation_id && m.sender_id != viewer_id && !m.is_read
        }) {
            message.is_read = true;
            changed += 1;
        }
        Ok(changed)
    }

    async fn insert_rental(&self, new: NewRental) -> StoreResult<Rental> {
        let mut tables = self.tables();
        tables.check(Op::InsertRental)?;
        if tables
            .rentals
            .iter()
            .any(|r| r.room_id == new.room_id && r.status == RentalStatus::Active)
        {
            return Err(StoreError::UniqueViolation(
                "idx_rentals_one_active_per_room".to_string(),
            ));
        }
        let rental = Rental {
            id: Uuid::new_v4(),
            room_id: new.room_id,
            student_id: new.student_id,
            elderly_id: new.elderly_id,
            monthly_amount: new.monthly_amount,
            start_date: new.start_date,
            end_date: None,
            status: RentalStatus::Active,
            created_at: tables.tick(),
        };
        tables.rentals.push(rental.clone());
        Ok(rental)
    }

    async fn find_active_rental(
        &self,
        room_id: Uuid,
        student_id: Uuid,
    ) -> StoreResult<Option<Rental>> {
        Ok(self
            .tables()
            .rentals
            .iter()
            .find(|r| {
                r.room_id == room_id
                    && r.student_id == student_id
                    && r.status == RentalStatus::Active
            })
            .cloned())
    }

    async fn insert_payment(&self, new: NewPayment) -> StoreResult<Payment> {
        let mut tables = self.tables();
        tables.check(Op::InsertPayment)?;
        if !tables.rentals.iter().any(|r| r.id == new.rental_id) {
            return Err(StoreError::NotFound);
        }
        let payment = Payment {
            id: Uuid::new_v4(),
            rental_id: new.rental_id,
            amount: new.split.amount,
            platform_fee: new.split.platform_fee,
            elderly_amount: new.split.elderly_amount,
            payment_date: new.payment_date,
            due_date: new.due_date,
            status: new.status,
            created_at: tables.tick(),
        };
        tables.payments.push(payment.clone());
        Ok(payment)
    }

    async fn subscribe_messages(&self, conversation_id: Uuid) -> StoreResult<MessageFeed> {
        let mut tables = self.tables();
        tables.check(Op::Subscribe)?;
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        if self.auto_ack {
            // Fresh channel with free capacity, cannot fail.
            let _ = tx.try_send(FeedEvent::Subscribed);
        }
        tables.feeds.entry(conversation_id).or_default().push(tx);
        Ok(MessageFeed::new(rx, None))
    }
}
