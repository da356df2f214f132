//! In-memory test doubles for the conversation contracts.
//!
//! Used by unit and integration tests to drive sessions without SQLite or a
//! gateway process. Failures, stalls and redeliveries can be scripted.

use super::models::{now_millis, Conversation, Message};
use super::traits::{
    BridgeRelay, ChangeFeed, ConversationStore, FeedEvent, FeedSink, RelayAck,
    SubscriptionHandle,
};
use crate::error::ChatError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// In-memory [`ConversationStore`]
#[derive(Default)]
pub struct MockStore {
    conversations: Mutex<Vec<Conversation>>,
    messages: Mutex<Vec<Message>>,
    failing_appends: AtomicUsize,
    append_gate: Mutex<Option<Arc<Semaphore>>>,
    append_calls: AtomicUsize,
    list_calls: AtomicUsize,
}

impl MockStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a conversation so appends to it succeed
    pub fn add_conversation(&self, conversation: Conversation) {
        lock(&self.conversations).push(conversation);
    }

    /// Put a message in the log without going through `append`
    pub fn seed(&self, message: Message) {
        lock(&self.messages).push(message);
    }

    /// Make the next `n` appends fail with `StoreUnavailable`
    pub fn fail_next_appends(&self, n: usize) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    /// Hold every append until [`MockStore::release_appends`] is called
    pub fn hold_appends(&self) {
        *lock(&self.append_gate) = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `n` held appends complete
    pub fn release_appends(&self, n: usize) {
        if let Some(gate) = lock(&self.append_gate).as_ref() {
            gate.add_permits(n);
        }
    }

    /// Number of `append` calls so far, including failed ones
    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    /// Number of `list` calls so far
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Everything durably stored so far
    pub fn stored(&self) -> Vec<Message> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl ConversationStore for MockStore {
    async fn append(
        &self,
        conversation_id: &str,
        sender_id: Option<&str>,
        body: &str,
    ) -> Result<Message, ChatError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);

        let gate = lock(&self.append_gate).clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| ChatError::StoreUnavailable(e.to_string()))?
                .forget();
        }

        let failing = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ChatError::StoreUnavailable("scripted failure".to_string()));
        }

        let message = Message::new(
            Uuid::new_v4().to_string(),
            conversation_id.to_string(),
            sender_id.map(String::from),
            body.to_string(),
            now_millis(),
        );
        lock(&self.messages).push(message.clone());
        Ok(message)
    }

    async fn list(&self, conversation_id: &str) -> Result<Vec<Message>, ChatError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut messages: Vec<Message> = lock(&self.messages)
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.display_order(b));
        Ok(messages)
    }

    async fn lookup_or_create(
        &self,
        participant_a: &str,
        participant_b: &str,
        subject_ref: Option<&str>,
    ) -> Result<Conversation, ChatError> {
        let subject_ref = subject_ref.filter(|s| !s.is_empty());
        let mut conversations = lock(&self.conversations);
        if let Some(existing) = conversations.iter().find(|c| {
            c.participant_a == participant_a
                && c.participant_b == participant_b
                && c.subject_ref.as_deref() == subject_ref
        }) {
            return Ok(existing.clone());
        }
        let conversation = Conversation::new(
            Uuid::new_v4().to_string(),
            participant_a.to_string(),
            participant_b.to_string(),
            subject_ref.map(String::from),
        );
        conversations.push(conversation.clone());
        Ok(conversation)
    }
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

/// Hand-driven [`ChangeFeed`]; tests decide what gets delivered and when
#[derive(Default)]
pub struct MockFeed {
    subscribers: Mutex<HashMap<u64, (String, FeedSink)>>,
    next_id: AtomicU64,
    failing_subscribes: AtomicUsize,
    subscribe_calls: AtomicUsize,
}

impl MockFeed {
    /// Create a feed with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` subscribe calls fail
    pub fn fail_next_subscribes(&self, n: usize) {
        self.failing_subscribes.store(n, Ordering::SeqCst);
    }

    /// Deliver `event` to every subscriber of `conversation_id`
    pub fn deliver(&self, conversation_id: &str, event: FeedEvent) -> usize {
        let subscribers = lock(&self.subscribers);
        subscribers
            .values()
            .filter(|(conv, _)| conv == conversation_id)
            .filter(|(_, sink)| sink.send(event.clone()).is_ok())
            .count()
    }

    /// Deliver an insert event for `message`
    pub fn deliver_insert(&self, message: &Message) -> usize {
        self.deliver(&message.conversation_id, FeedEvent::Inserted(message.clone()))
    }

    /// Live subscriptions
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Number of `subscribe` calls so far, including failed ones
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeFeed for MockFeed {
    async fn subscribe(
        &self,
        conversation_id: &str,
        sink: FeedSink,
    ) -> Result<SubscriptionHandle, ChatError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ChatError::FeedDisconnected("scripted failure".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.subscribers).insert(id, (conversation_id.to_string(), sink));
        Ok(SubscriptionHandle {
            id,
            conversation_id: conversation_id.to_string(),
        })
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        lock(&self.subscribers).remove(&handle.id);
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Scripted [`BridgeRelay`]
///
/// `fetch_latest_reply` pops scripted answers in order; once the script is
/// exhausted it keeps returning the last reply it handed out.
#[derive(Default)]
pub struct MockRelay {
    replies: Mutex<VecDeque<Option<Message>>>,
    latest: Mutex<Option<Message>>,
    relayed: Mutex<Vec<Message>>,
    fail_relay: Mutex<Option<String>>,
    fetch_calls: AtomicUsize,
}

impl MockRelay {
    /// Create a relay with an empty script
    pub fn new() -> Self {
        Self::default()
    }

    /// Append answers for upcoming `fetch_latest_reply` calls
    pub fn script_replies(&self, replies: impl IntoIterator<Item = Option<Message>>) {
        lock(&self.replies).extend(replies);
    }

    /// Make every `relay` call fail with `reason`
    pub fn fail_relays(&self, reason: &str) {
        *lock(&self.fail_relay) = Some(reason.to_string());
    }

    /// Messages accepted by `relay`
    pub fn relayed(&self) -> Vec<Message> {
        lock(&self.relayed).clone()
    }

    /// Number of `fetch_latest_reply` calls so far
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BridgeRelay for MockRelay {
    async fn create_bridged_conversation(
        &self,
        visitor_label: &str,
    ) -> Result<Conversation, ChatError> {
        Ok(Conversation::bridged(
            Uuid::new_v4().to_string(),
            "operator".to_string(),
            visitor_label.to_string(),
        ))
    }

    async fn relay(
        &self,
        conversation_id: &str,
        visitor_message: &Message,
    ) -> Result<RelayAck, ChatError> {
        if let Some(reason) = lock(&self.fail_relay).clone() {
            return Err(ChatError::BridgeRelayFailed(reason));
        }
        let message = Message::new(
            visitor_message.store_id().to_string(),
            conversation_id.to_string(),
            visitor_message.sender_id.clone(),
            visitor_message.body.clone(),
            visitor_message.created_at,
        );
        lock(&self.relayed).push(message.clone());
        Ok(RelayAck { message })
    }

    async fn fetch_latest_reply(
        &self,
        _conversation_id: &str,
    ) -> Result<Option<Message>, ChatError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.replies).pop_front();
        let mut latest = lock(&self.latest);
        if let Some(Some(reply)) = next {
            *latest = Some(reply);
        }
        Ok(latest.clone())
    }
}
