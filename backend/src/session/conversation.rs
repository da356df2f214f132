//! Conversation session
//!
//! Client-side controller for one open conversation. Seeds itself from the
//! store, follows the change feed in push mode, shows sends optimistically
//! and funnels every mutation through [`ConversationSession::mutate`].

use super::timeline::{MergeOutcome, Timeline};
use crate::chat::models::{validate_body, Conversation, ConversationMode, Message};
use crate::chat::retry::with_retry;
use crate::chat::traits::{ChangeFeed, ConversationStore, FeedEvent, SubscriptionHandle};
use crate::config::SessionConfig;
use crate::error::ChatError;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Services a session talks to
#[derive(Clone)]
pub struct SessionDeps {
    /// Durable message log
    pub store: Arc<dyn ConversationStore>,
    /// Insert notifications (unused for bridged conversations)
    pub feed: Arc<dyn ChangeFeed>,
}

impl SessionDeps {
    /// Bundle a store and a feed
    pub fn new(store: Arc<dyn ConversationStore>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self { store, feed }
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Accepting sends and merges
    Open,
    /// Torn down; state is frozen
    Closed,
}

/// Live feed subscription; released when dropped
struct FeedGuard {
    feed: Arc<dyn ChangeFeed>,
    handle: SubscriptionHandle,
    pump: JoinHandle<()>,
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        self.feed.unsubscribe(&self.handle);
        self.pump.abort();
        debug!(
            conversation_id = %self.handle.conversation_id,
            subscription = self.handle.id,
            "Feed subscription released"
        );
    }
}

struct SessionState {
    timeline: Timeline,
    closed: bool,
    subscription: Option<FeedGuard>,
    recovery: Option<JoinHandle<()>>,
}

impl Drop for SessionState {
    fn drop(&mut self) {
        if let Some(task) = self.recovery.take() {
            task.abort();
        }
    }
}

struct Shared {
    conversation: Conversation,
    participant: String,
    deps: SessionDeps,
    config: SessionConfig,
    state: Mutex<SessionState>,
    changes: watch::Sender<Vec<Message>>,
}

/// Handle to an open conversation; clones share the same session
#[derive(Clone)]
pub struct ConversationSession {
    shared: Arc<Shared>,
}

impl ConversationSession {
    /// Open a session for `participant` on `conversation`
    ///
    /// Loads the history, then (push mode only) subscribes to the change
    /// feed and catches up on anything appended in between. If the feed
    /// cannot be reached the session still opens and falls back to polling
    /// the store until a resubscribe succeeds.
    pub async fn open(
        conversation: Conversation,
        participant: impl Into<String>,
        deps: SessionDeps,
        config: SessionConfig,
    ) -> Result<Self, ChatError> {
        let (changes, _) = watch::channel(Vec::new());
        let session = Self {
            shared: Arc::new(Shared {
                conversation,
                participant: participant.into(),
                deps,
                config,
                state: Mutex::new(SessionState {
                    timeline: Timeline::new(),
                    closed: false,
                    subscription: None,
                    recovery: None,
                }),
                changes,
            }),
        };

        let history = session.list_history().await?;
        session.merge_history(history);

        if session.conversation().mode == ConversationMode::Push {
            match session.subscribe().await {
                Ok(()) => session.resync().await,
                Err(e) => {
                    warn!(
                        conversation_id = %session.conversation().id,
                        error = %e,
                        "Feed unavailable on open, falling back to polling"
                    );
                    session.start_recovery();
                }
            }
        }

        info!(
            conversation_id = %session.conversation().id,
            participant = %session.participant(),
            mode = session.conversation().mode.as_str(),
            messages = session.len(),
            "Conversation session opened"
        );
        Ok(session)
    }

    /// The conversation this session mirrors
    pub fn conversation(&self) -> &Conversation {
        &self.shared.conversation
    }

    /// The local participant; messages it sends carry this sender id
    pub fn participant(&self) -> &str {
        &self.shared.participant
    }

    /// Current lifecycle state
    pub fn status(&self) -> SessionStatus {
        if self.lock_state().closed {
            SessionStatus::Closed
        } else {
            SessionStatus::Open
        }
    }

    /// Whether the session is open
    pub fn is_open(&self) -> bool {
        self.status() == SessionStatus::Open
    }

    /// Whether a feed subscription is currently live
    pub fn is_subscribed(&self) -> bool {
        let state = self.lock_state();
        state.subscription.is_some() && state.recovery.is_none()
    }

    /// Snapshot of the visible messages in display order
    pub fn messages(&self) -> Vec<Message> {
        self.lock_state().timeline.messages().to_vec()
    }

    /// Number of visible messages
    pub fn len(&self) -> usize {
        self.lock_state().timeline.len()
    }

    /// Whether no message is visible
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Observe every change to the visible messages
    pub fn subscribe_changes(&self) -> watch::Receiver<Vec<Message>> {
        self.shared.changes.subscribe()
    }

    /// Send `body` as the local participant
    ///
    /// The message is visible as `pending` before the store is contacted.
    /// On failure it stays visible as `failed` and `SendFailed` carries its
    /// local id for [`ConversationSession::resend`]. Bridged conversations
    /// are sent through a `PollingWatcher` instead.
    pub async fn send(&self, body: &str) -> Result<Message, ChatError> {
        self.ensure_push()?;
        self.send_with(body, |local| self.append_durably(local))
            .await
    }

    /// Resubmit a failed message in place
    pub async fn resend(&self, local_id: &str) -> Result<Message, ChatError> {
        self.ensure_push()?;
        self.resend_with(local_id, |local| self.append_durably(local))
            .await
    }

    /// Merge a confirmed message; `None` if the session is closed
    pub fn merge(&self, incoming: Message) -> Option<MergeOutcome> {
        let message_id = incoming.id.clone();
        let outcome = self.mutate(|timeline| timeline.merge(incoming));
        match outcome {
            Some(MergeOutcome::Inserted) => debug!(
                conversation_id = %self.conversation().id,
                message_id = %message_id,
                "Merged message"
            ),
            Some(MergeOutcome::Duplicate) => debug!(
                conversation_id = %self.conversation().id,
                message_id = %message_id,
                "Ignored duplicate message"
            ),
            None => debug!(
                conversation_id = %self.conversation().id,
                message_id = %message_id,
                "Session closed, message not merged"
            ),
        }
        outcome
    }

    /// Tear down: release the feed subscription and stop any recovery
    ///
    /// Durable state is untouched. Idempotent.
    pub fn close(&self) {
        let (subscription, recovery) = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            (state.subscription.take(), state.recovery.take())
        };
        drop(subscription);
        if let Some(task) = recovery {
            task.abort();
        }
        info!(conversation_id = %self.conversation().id, "Conversation session closed");
    }

    pub(crate) async fn send_with<F, Fut>(
        &self,
        body: &str,
        deliver: F,
    ) -> Result<Message, ChatError>
    where
        F: FnOnce(Message) -> Fut,
        Fut: Future<Output = Result<Message, ChatError>>,
    {
        validate_body(body)?;
        let local = Message::optimistic(
            &self.conversation().id,
            Some(self.participant().to_string()),
            body.to_string(),
        );
        let local_id = local.id.clone();

        self.mutate(|timeline| timeline.insert_optimistic(local.clone()))
            .ok_or_else(|| self.closed_error())?;
        debug!(
            conversation_id = %self.conversation().id,
            local_id = %local_id,
            "Optimistic message added"
        );

        let result = deliver(local).await;
        self.settle(&local_id, result)
    }

    pub(crate) async fn resend_with<F, Fut>(
        &self,
        local_id: &str,
        deliver: F,
    ) -> Result<Message, ChatError>
    where
        F: FnOnce(Message) -> Fut,
        Fut: Future<Output = Result<Message, ChatError>>,
    {
        let entry = self
            .mutate(|timeline| timeline.retry_failed(local_id))
            .ok_or_else(|| self.closed_error())?
            .ok_or_else(|| {
                ChatError::InvalidInput(format!("No failed message with id {}", local_id))
            })?;

        info!(
            conversation_id = %self.conversation().id,
            local_id = %local_id,
            "Resubmitting failed message"
        );
        let result = deliver(entry).await;
        self.settle(local_id, result)
    }

    async fn append_durably(&self, local: Message) -> Result<Message, ChatError> {
        let shared = &self.shared;
        with_retry(&shared.config, "append", || {
            shared
                .deps
                .store
                .append(&local.conversation_id, local.sender_id.as_deref(), &local.body)
        })
        .await
        .map_err(|e| ChatError::SendFailed {
            local_id: local.id.clone(),
            reason: e.to_string(),
        })
    }

    fn settle(
        &self,
        local_id: &str,
        result: Result<Message, ChatError>,
    ) -> Result<Message, ChatError> {
        match result {
            Ok(stored) => {
                if self
                    .mutate(|timeline| timeline.confirm(local_id, stored.clone()))
                    .is_none()
                {
                    debug!(
                        conversation_id = %self.conversation().id,
                        message_id = %stored.id,
                        "Session closed before the store answered; result discarded"
                    );
                }
                Ok(stored)
            }
            Err(e) => {
                self.mutate(|timeline| timeline.mark_failed(local_id));
                error!(
                    conversation_id = %self.conversation().id,
                    local_id = %local_id,
                    error = %e,
                    "Message delivery failed"
                );
                Err(e)
            }
        }
    }

    /// The only place the timeline is changed
    fn mutate<R>(&self, f: impl FnOnce(&mut Timeline) -> R) -> Option<R> {
        let mut state = self.lock_state();
        if state.closed {
            return None;
        }
        let result = f(&mut state.timeline);
        let visible = state.timeline.messages();
        self.shared.changes.send_if_modified(|current| {
            if current.as_slice() == visible {
                false
            } else {
                *current = visible.to_vec();
                true
            }
        });
        Some(result)
    }

    fn on_feed_insert(&self, message: Message) {
        if message.is_from(self.participant()) {
            debug!(
                conversation_id = %self.conversation().id,
                message_id = %message.id,
                "Suppressed self echo"
            );
            return;
        }
        self.merge(message);
    }

    fn merge_history(&self, history: Vec<Message>) -> usize {
        self.mutate(|timeline| {
            history
                .into_iter()
                .filter(|m| timeline.merge(m.clone()) == MergeOutcome::Inserted)
                .count()
        })
        .unwrap_or(0)
    }

    async fn list_history(&self) -> Result<Vec<Message>, ChatError> {
        let shared = &self.shared;
        with_retry(&shared.config, "list", || {
            shared.deps.store.list(&shared.conversation.id)
        })
        .await
    }

    /// Reconcile with the store; failures are logged and left for next time
    async fn resync(&self) {
        match self.list_history().await {
            Ok(history) => {
                let inserted = self.merge_history(history);
                if inserted > 0 {
                    info!(
                        conversation_id = %self.conversation().id,
                        inserted,
                        "Resync picked up missed messages"
                    );
                }
            }
            Err(e) => warn!(
                conversation_id = %self.conversation().id,
                error = %e,
                "Resync failed"
            ),
        }
    }

    async fn subscribe(&self) -> Result<(), ChatError> {
        let shared = &self.shared;
        let (sink, events) = mpsc::unbounded_channel();
        let handle = with_retry(&shared.config, "subscribe", || {
            shared
                .deps
                .feed
                .subscribe(&shared.conversation.id, sink.clone())
        })
        .await?;

        let mut state = self.lock_state();
        if state.closed {
            drop(state);
            shared.deps.feed.unsubscribe(&handle);
            return Err(self.closed_error());
        }
        // Spawned under the lock so its first event cannot race the handover
        let pump = tokio::spawn(pump(Arc::downgrade(shared), events));
        let previous = state.subscription.replace(FeedGuard {
            feed: shared.deps.feed.clone(),
            handle,
            pump,
        });
        let recovery = state.recovery.take();
        drop(state);

        drop(previous);
        drop(recovery);
        Ok(())
    }

    fn start_recovery(&self) {
        let mut state = self.lock_state();
        if state.closed || state.recovery.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        state.recovery = Some(tokio::spawn(recover(Arc::downgrade(&self.shared))));
    }

    fn ensure_push(&self) -> Result<(), ChatError> {
        if self.conversation().mode == ConversationMode::Bridged {
            return Err(ChatError::InvalidInput(format!(
                "Conversation {} is bridged; send through the relay",
                self.conversation().id
            )));
        }
        Ok(())
    }

    fn closed_error(&self) -> ChatError {
        ChatError::SessionClosed(self.conversation().id.clone())
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forward feed events into the session until it goes away
async fn pump(shared: Weak<Shared>, mut events: mpsc::UnboundedReceiver<FeedEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let session = ConversationSession { shared };
        match event {
            FeedEvent::Inserted(message) => session.on_feed_insert(message),
            FeedEvent::Disconnected(reason) => {
                warn!(
                    conversation_id = %session.conversation().id,
                    reason = %reason,
                    "Change feed disconnected"
                );
                session.start_recovery();
                return;
            }
        }
    }

    // Every sender dropped without a disconnect notice
    if let Some(shared) = shared.upgrade() {
        ConversationSession { shared }.start_recovery();
    }
}

/// Resubscribe with polling fallback until the feed is back or the session closes
async fn recover(shared: Weak<Shared>) {
    let mut attempt: u32 = 0;
    loop {
        let Some(strong) = shared.upgrade() else {
            return;
        };
        let session = ConversationSession { shared: strong };
        if !session.is_open() {
            return;
        }

        attempt += 1;
        let subscribed = session.subscribe().await;
        session.resync().await;
        match subscribed {
            Ok(()) => {
                info!(
                    conversation_id = %session.conversation().id,
                    attempt,
                    "Resubscribed to change feed"
                );
                return;
            }
            Err(e) => warn!(
                conversation_id = %session.conversation().id,
                attempt,
                error = %e,
                "Resubscribe failed, polling the store meanwhile"
            ),
        }

        let interval = session.shared.config.resync_interval;
        drop(session);
        tokio::time::sleep(interval).await;
    }
}
