//! Live view of one conversation.
//!
//! A [`ConversationSession`] keeps the ordered message list of a conversation
//! in sync with the store. A single driver task owns the insert feed and the
//! reconnect timer; the handle shares only the message log, the draft and the
//! in-flight flag with it.

use std::collections::HashSet;
use std::future::pending;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{actor::Actor, conversation::Conversation, message::Message};
use crate::services::conversation_service::deliver;
use crate::store::{FeedEvent, MessageFeed, Store};

const UPDATE_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Change to the message list, as seen by subscribers of
/// [`ConversationSession::updates`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Appended(Message),
    /// The list was replaced by a fresh copy of the history.
    Resynced { messages: Vec<Message> },
}

/// Ordered messages of a conversation, unique by id.
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
    seen: HashSet<Uuid>,
}

impl MessageLog {
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages.clear();
        self.seen.clear();
        for message in messages {
            self.merge(message);
        }
    }

    /// Appends `message` unless a message with the same id is already
    /// present. Returns whether it was appended.
    pub fn merge(&mut self, message: Message) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
}

#[derive(Default)]
struct Shared {
    log: Mutex<MessageLog>,
    draft: Mutex<String>,
    sending: AtomicBool,
}

impl Shared {
    fn log(&self) -> MutexGuard<'_, MessageLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn draft(&self) -> MutexGuard<'_, String> {
        self.draft.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Clears the in-flight flag when a send finishes, whichever way it ends.
struct SendingGuard<'a>(&'a AtomicBool);

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// State the driver task and the handle both need.
#[derive(Clone)]
struct Context {
    conversation_id: Uuid,
    viewer: Actor,
    store: Arc<dyn Store>,
    shared: Arc<Shared>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl Context {
    /// Merges a message into the log and announces it if it is new.
    fn merge(&self, message: Message) -> bool {
        let appended = self.shared.log().merge(message.clone());
        if appended {
            // No subscribers is fine.
            let _ = self.updates.send(SessionUpdate::Appended(message));
        }
        appended
    }

    async fn mark_read(&self) {
        if let Err(e) = self
            .store
            .mark_read(self.conversation_id, self.viewer.id)
            .await
        {
            tracing::warn!(conversation_id = %self.conversation_id, error = %e, "Failed to mark messages read");
        }
    }

    async fn subscribe(&self) -> Option<MessageFeed> {
        match self.store.subscribe_messages(self.conversation_id).await {
            Ok(feed) => Some(feed),
            Err(e) => {
                tracing::warn!(conversation_id = %self.conversation_id, error = %e, "Failed to subscribe to conversation");
                None
            }
        }
    }

    /// Replaces the log with the stored history.
    async fn resync(&self) {
        match self.store.list_messages(self.conversation_id).await {
            Ok(messages) => {
                self.shared.log().replace(messages.clone());
                let _ = self.updates.send(SessionUpdate::Resynced { messages });
            }
            Err(e) => {
                tracing::warn!(conversation_id = %self.conversation_id, error = %e, "Failed to refetch messages");
            }
        }
    }
}

struct Driver {
    ctx: Context,
    status: watch::Sender<ConnectionStatus>,
    reconnect_delay: Duration,
    feed: Option<MessageFeed>,
    reconnect: Option<Pin<Box<Sleep>>>,
}

async fn next_event(feed: &mut Option<MessageFeed>) -> Option<FeedEvent> {
    match feed {
        Some(feed) => feed.recv().await,
        None => pending().await,
    }
}

async fn expire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

impl Driver {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        if self.feed.is_none() {
            self.disconnected();
        }

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = next_event(&mut self.feed) => match event {
                    Some(FeedEvent::Subscribed) => {
                        self.status.send_replace(ConnectionStatus::Connected);
                    }
                    Some(FeedEvent::Inserted(message)) => self.on_inserted(message).await,
                    Some(FeedEvent::Error(reason)) => {
                        tracing::warn!(conversation_id = %self.ctx.conversation_id, %reason, "Conversation feed error");
                        self.disconnected();
                    }
                    Some(FeedEvent::TimedOut) => {
                        tracing::warn!(conversation_id = %self.ctx.conversation_id, "Conversation feed timed out");
                        self.disconnected();
                    }
                    None => {
                        tracing::warn!(conversation_id = %self.ctx.conversation_id, "Conversation feed closed");
                        self.feed = None;
                        self.disconnected();
                    }
                },
                _ = expire(&mut self.reconnect) => {
                    self.reconnect = None;
                    self.reconnect().await;
                }
            }
        }

        tracing::debug!(conversation_id = %self.ctx.conversation_id, "Conversation session closed");
    }

    async fn on_inserted(&self, message: Message) {
        if message.conversation_id != self.ctx.conversation_id {
            return;
        }
        let inbound = message.sender_id != self.ctx.viewer.id;
        self.ctx.merge(message);
        if inbound {
            self.ctx.mark_read().await;
        }
    }

    /// Arms the reconnect timer unless one is already pending.
    fn disconnected(&mut self) {
        self.status.send_replace(ConnectionStatus::Disconnected);
        if self.reconnect.is_none() {
            self.reconnect = Some(Box::pin(sleep(self.reconnect_delay)));
        }
    }

    async fn reconnect(&mut self) {
        tracing::info!(conversation_id = %self.ctx.conversation_id, "Reconnecting conversation feed");
        self.status.send_replace(ConnectionStatus::Connecting);

        // Subscribe before refetching so nothing inserted in between is lost.
        self.feed = None;
        self.feed = self.ctx.subscribe().await;
        self.ctx.resync().await;
        self.ctx.mark_read().await;

        if self.feed.is_none() {
            self.disconnected();
        }
    }
}

pub struct ConversationSession {
    conversation: Conversation,
    ctx: Context,
    status: watch::Receiver<ConnectionStatus>,
    shutdown: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
}

impl ConversationSession {
    /// Subscribes to the conversation, loads its history and marks inbound
    /// messages read. The caller has already checked that `viewer` takes part
    /// in `conversation`.
    pub(crate) async fn open(
        store: Arc<dyn Store>,
        conversation: Conversation,
        viewer: Actor,
        reconnect_delay: Duration,
    ) -> Result<Self> {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        let ctx = Context {
            conversation_id: conversation.id,
            viewer,
            store,
            shared: Arc::new(Shared::default()),
            updates,
        };

        let feed = ctx.subscribe().await;
        let history = ctx.store.list_messages(conversation.id).await?;
        ctx.shared.log().replace(history);
        ctx.mark_read().await;

        let (status_tx, status) = watch::channel(ConnectionStatus::Connecting);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let driver = Driver {
            ctx: ctx.clone(),
            status: status_tx,
            reconnect_delay,
            feed,
            reconnect: None,
        };
        let handle = tokio::spawn(driver.run(shutdown_rx));

        tracing::info!(conversation_id = %conversation.id, viewer_id = %viewer.id, "Conversation session opened");
        Ok(Self {
            conversation,
            ctx,
            status,
            shutdown: Some(shutdown_tx),
            driver: Some(handle),
        })
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn viewer(&self) -> Actor {
        self.ctx.viewer
    }

    /// Snapshot of the current message list.
    pub fn messages(&self) -> Vec<Message> {
        self.ctx.shared.log().messages().to_vec()
    }

    pub fn updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.ctx.updates.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn set_draft(&self, content: impl Into<String>) {
        *self.ctx.shared.draft() = content.into();
    }

    pub fn draft(&self) -> String {
        self.ctx.shared.draft().clone()
    }

    pub fn is_sending(&self) -> bool {
        self.ctx.shared.sending.load(Ordering::Acquire)
    }

    /// Sends the current draft.
    ///
    /// Returns `Ok(None)` without doing anything while another send of this
    /// session is in flight. The draft is cleared before the write and put
    /// back if the write fails.
    pub async fn send_draft(&self) -> Result<Option<Message>> {
        let shared = &self.ctx.shared;
        if shared.sending.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }
        let _guard = SendingGuard(&shared.sending);

        let draft = std::mem::take(&mut *shared.draft());
        let result = deliver(
            self.ctx.store.as_ref(),
            self.conversation.id,
            self.ctx.viewer.id,
            &draft,
        )
        .await;

        match result {
            Ok(message) => {
                self.ctx.merge(message.clone());
                Ok(Some(message))
            }
            Err(e) => {
                *shared.draft() = draft;
                Err(e)
            }
        }
    }

    /// Replaces the draft with `content` and sends it.
    pub async fn send(&self, content: impl Into<String>) -> Result<Option<Message>> {
        if self.is_sending() {
            return Ok(None);
        }
        self.set_draft(content);
        self.send_draft().await
    }

    /// Stops the driver, cancelling any pending reconnect and closing the
    /// feed.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                tracing::warn!(conversation_id = %self.conversation.id, error = %e, "Session driver ended abnormally");
            }
        }
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{
        actor::Role,
        conversation::NewConversation,
        message::NewMessage,
    };
    use crate::store::memory::{MemoryStore, Op};
    use rust_decimal::Decimal;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio_test::{assert_err, assert_ok};

    const DELAY: Duration = Duration::from_secs(5);

    struct Fixture {
        store: Arc<MemoryStore>,
        conversation: Conversation,
        elderly: Actor,
        student: Actor,
    }

    async fn fixture(store: MemoryStore) -> Fixture {
        let store = Arc::new(store);
        let elderly = Actor::elderly(Uuid::new_v4());
        let student = Actor::student(Uuid::new_v4());
        store.add_profile(elderly.id, Role::Elderly, "Maria");
        store.add_profile(student.id, Role::Student, "Sara");
        let room = store.add_room(elderly.id, "Quarto", Decimal::from(250), None);
        let conversation = store
            .insert_conversation(NewConversation {
                room_id: room.id,
                elderly_id: elderly.id,
                student_id: student.id,
            })
            .await
            .unwrap();
        Fixture {
            store,
            conversation,
            elderly,
            student,
        }
    }

    impl Fixture {
        async fn open(&self, viewer: Actor) -> ConversationSession {
            ConversationSession::open(self.store.clone(), self.conversation.clone(), viewer, DELAY)
                .await
                .unwrap()
        }

        fn message_from(&self, sender: Actor, content: &str) -> NewMessage {
            NewMessage {
                conversation_id: self.conversation.id,
                sender_id: sender.id,
                content: content.to_string(),
            }
        }
    }

    /// Lets the driver task process whatever is queued for it.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn ids(messages: &[Message]) -> Vec<Uuid> {
        messages.iter().map(|m| m.id).collect()
    }

    #[test]
    fn log_drops_duplicate_ids() {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            content: "hi".into(),
            is_read: false,
            created_at: chrono::Utc::now(),
        };
        let mut log = MessageLog::default();
        assert!(log.merge(message.clone()));
        assert!(!log.merge(message.clone()));
        assert_eq!(log.messages().len(), 1);

        log.replace(vec![message.clone(), message]);
        assert_eq!(log.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_loads_history_and_marks_inbound_read() {
        let f = fixture(MemoryStore::new()).await;
        let inbound = f
            .store
            .insert_message_unnotified(f.message_from(f.elderly, "Bem-vinda"));
        let own = f
            .store
            .insert_message_unnotified(f.message_from(f.student, "Obrigada"));

        let session = f.open(f.student).await;
        assert_eq!(ids(&session.messages()), vec![inbound.id, own.id]);

        let stored = f.store.messages(f.conversation.id);
        assert!(stored.iter().find(|m| m.id == inbound.id).unwrap().is_read);
        assert!(!stored.iter().find(|m| m.id == own.id).unwrap().is_read);

        settle().await;
        assert_eq!(session.connection_status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_push_events_are_merged_once() {
        let f = fixture(MemoryStore::new()).await;
        let session = f.open(f.student).await;
        let mut updates = session.updates();

        let message = f
            .store
            .insert_message_unnotified(f.message_from(f.elderly, "Olá"));
        f.store
            .emit(f.conversation.id, FeedEvent::Inserted(message.clone()));
        f.store
            .emit(f.conversation.id, FeedEvent::Inserted(message.clone()));
        settle().await;

        assert_eq!(ids(&session.messages()), vec![message.id]);
        assert_eq!(
            updates.try_recv().unwrap(),
            SessionUpdate::Appended(message)
        );
        assert_eq!(updates.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_message_marks_conversation_read() {
        let f = fixture(MemoryStore::new()).await;
        let session = f.open(f.student).await;

        let earlier = f
            .store
            .insert_message_unnotified(f.message_from(f.elderly, "Primeira"));
        f.store
            .insert_message(f.message_from(f.elderly, "Segunda"))
            .await
            .unwrap();
        settle().await;

        let stored = f.store.messages(f.conversation.id);
        assert!(stored.iter().all(|m| m.is_read));
        assert!(stored.iter().any(|m| m.id == earlier.id));
        // The unnotified message only arrives with a resync.
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn own_message_is_listed_once_and_stays_unread() {
        let f = fixture(MemoryStore::new()).await;
        let session = f.open(f.student).await;

        session.set_draft("  Posso visitar amanhã?  ");
        let sent = assert_ok!(session.send_draft().await).unwrap();
        assert_eq!(sent.content, "Posso visitar amanhã?");
        assert_eq!(session.draft(), "");
        settle().await;

        assert_eq!(ids(&session.messages()), vec![sent.id]);
        let stored = f.store.messages(f.conversation.id);
        assert!(!stored[0].is_read);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_restores_the_draft() {
        let f = fixture(MemoryStore::new()).await;
        let session = f.open(f.student).await;

        f.store.fail_next(Op::InsertMessage);
        session.set_draft("Olá Maria");
        assert_err!(session.send_draft().await);
        assert_eq!(session.draft(), "Olá Maria");
        assert!(!session.is_sending());
        assert!(session.messages().is_empty());

        let sent = assert_ok!(session.send_draft().await).unwrap();
        assert_eq!(sent.content, "Olá Maria");
    }

    #[tokio::test(start_paused = true)]
    async fn blank_draft_is_rejected() {
        let f = fixture(MemoryStore::new()).await;
        let session = f.open(f.student).await;

        let err = assert_err!(session.send("   ").await);
        assert!(matches!(err, Error::BadRequest(_)));
        assert!(f.store.messages(f.conversation.id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_send_keeps_the_draft() {
        let f = fixture(MemoryStore::new()).await;
        let session = f.open(f.student).await;

        let err = assert_err!(session.send("ã".repeat(50_000)).await);
        assert!(matches!(err, Error::BadRequest(_)));
        assert_eq!(session.draft().len(), 100_000);
        assert!(!session.is_sending());
        assert!(f.store.messages(f.conversation.id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_feed_reconnects_after_delay_and_resyncs() {
        let f = fixture(MemoryStore::new()).await;
        let first = f
            .store
            .insert_message_unnotified(f.message_from(f.elderly, "Primeira"));
        let session = f.open(f.student).await;
        let mut updates = session.updates();
        settle().await;
        assert_eq!(session.connection_status(), ConnectionStatus::Connected);

        f.store.drop_feeds(f.conversation.id);
        settle().await;
        assert_eq!(session.connection_status(), ConnectionStatus::Disconnected);

        let missed = f
            .store
            .insert_message_unnotified(f.message_from(f.elderly, "Perdida"));

        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert_eq!(session.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(ids(&session.messages()), vec![first.id]);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(ids(&session.messages()), vec![first.id, missed.id]);
        assert_eq!(session.connection_status(), ConnectionStatus::Connected);
        assert_eq!(f.store.open_feeds(f.conversation.id), 1);
        assert!(matches!(
            updates.try_recv().unwrap(),
            SessionUpdate::Resynced { messages } if messages.len() == 2
        ));

        let live = f
            .store
            .insert_message(f.message_from(f.elderly, "De volta"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(
            ids(&session.messages()),
            vec![first.id, missed.id, live.id]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pending_reconnect_is_not_rearmed() {
        let f = fixture(MemoryStore::new().with_auto_ack(false)).await;
        let session = f.open(f.student).await;
        let id = f.conversation.id;
        assert_eq!(session.connection_status(), ConnectionStatus::Connecting);

        f.store.emit(id, FeedEvent::Subscribed);
        settle().await;
        assert_eq!(session.connection_status(), ConnectionStatus::Connected);

        f.store.emit(id, FeedEvent::Error("channel error".into()));
        settle().await;
        assert_eq!(session.connection_status(), ConnectionStatus::Disconnected);

        tokio::time::advance(Duration::from_secs(3)).await;
        f.store.emit(id, FeedEvent::TimedOut);
        settle().await;

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(session.connection_status(), ConnectionStatus::Connecting);
        assert_eq!(f.store.open_feeds(id), 1);

        f.store.emit(id, FeedEvent::Subscribed);
        settle().await;
        assert_eq!(session.connection_status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_subscribe_on_open_retries_later() {
        let f = fixture(MemoryStore::new()).await;
        f.store.fail_next(Op::Subscribe);
        let session = f.open(f.student).await;
        settle().await;
        assert_eq!(session.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(f.store.open_feeds(f.conversation.id), 0);

        tokio::time::advance(DELAY).await;
        settle().await;
        assert_eq!(session.connection_status(), ConnectionStatus::Connected);
        assert_eq!(f.store.open_feeds(f.conversation.id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_reconnect() {
        let f = fixture(MemoryStore::new()).await;
        let session = f.open(f.student).await;
        settle().await;

        f.store.drop_feeds(f.conversation.id);
        settle().await;
        assert_eq!(session.connection_status(), ConnectionStatus::Disconnected);

        session.close().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(f.store.open_feeds(f.conversation.id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_session_closes_its_feed() {
        let f = fixture(MemoryStore::new()).await;
        let session = f.open(f.elderly).await;
        settle().await;
        assert_eq!(f.store.open_feeds(f.conversation.id), 1);

        drop(session);
        settle().await;
        assert_eq!(f.store.open_feeds(f.conversation.id), 0);
    }
}
