use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::models::message::Message;

pub const FEED_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// The transport acknowledged the subscription.
    Subscribed,
    Inserted(Message),
    Error(String),
    TimedOut,
}

/// Receiving end of a conversation's insert feed.
///
/// Dropping the feed stops whatever task is forwarding events into it.
#[derive(Debug)]
pub struct MessageFeed {
    rx: mpsc::Receiver<FeedEvent>,
    forwarder: Option<AbortHandle>,
}

impl MessageFeed {
    pub fn new(rx: mpsc::Receiver<FeedEvent>, forwarder: Option<AbortHandle>) -> Self {
        Self { rx, forwarder }
    }

    /// `None` once the sending side is gone.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.rx.recv().await
    }
}

impl Drop for MessageFeed {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}
