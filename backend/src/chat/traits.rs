//! Service contracts consumed by conversation sessions
//!
//! A session never talks to SQLite, the broadcast hub or the gateway
//! directly; it only sees these traits, so every backing can be swapped for
//! a test double (see [`super::mock`]).

use super::models::{Conversation, Message};
use crate::error::ChatError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Event delivered by a change feed to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A message was durably appended. May be delivered more than once.
    Inserted(Message),
    /// The subscription stopped delivering; the subscriber must resync
    Disconnected(String),
}

/// Where a change feed pushes events for one subscription
pub type FeedSink = mpsc::UnboundedSender<FeedEvent>;

/// Identifies one live feed subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    /// Feed-local subscription number
    pub id: u64,
    /// Conversation the subscription is filtered to
    pub conversation_id: String,
}

/// Acknowledgement that the gateway queued a visitor message
///
/// Accepted means queued for the external channel, not read by a human.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayAck {
    /// Durable copy of the visitor message, carrying the store-assigned id
    pub message: Message,
}

/// Durable, append-only message log and conversation registry
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append a message; `sender_id = None` marks a system/operator message
    async fn append(
        &self,
        conversation_id: &str,
        sender_id: Option<&str>,
        body: &str,
    ) -> Result<Message, ChatError>;

    /// All messages of a conversation, oldest first. Safe to call repeatedly.
    async fn list(&self, conversation_id: &str) -> Result<Vec<Message>, ChatError>;

    /// Find the conversation for this key, creating it if absent.
    ///
    /// Concurrent callers with an identical key must get the same conversation.
    async fn lookup_or_create(
        &self,
        participant_a: &str,
        participant_b: &str,
        subject_ref: Option<&str>,
    ) -> Result<Conversation, ChatError>;
}

/// Push notification of newly inserted messages
///
/// Delivery is at-least-once and unordered relative to concurrent inserts.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Start forwarding inserts for `conversation_id` into `sink`
    async fn subscribe(
        &self,
        conversation_id: &str,
        sink: FeedSink,
    ) -> Result<SubscriptionHandle, ChatError>;

    /// Stop a subscription. Must not block; unknown handles are ignored.
    fn unsubscribe(&self, handle: &SubscriptionHandle);
}

/// Bridge to an external, asynchronous human channel
#[async_trait]
pub trait BridgeRelay: Send + Sync {
    /// Register a new conversation for an anonymous visitor
    async fn create_bridged_conversation(
        &self,
        visitor_label: &str,
    ) -> Result<Conversation, ChatError>;

    /// Queue a visitor message for delivery on the external channel
    async fn relay(
        &self,
        conversation_id: &str,
        visitor_message: &Message,
    ) -> Result<RelayAck, ChatError>;

    /// Most recent operator reply, if any
    async fn fetch_latest_reply(&self, conversation_id: &str)
        -> Result<Option<Message>, ChatError>;
}
