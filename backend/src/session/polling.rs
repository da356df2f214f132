//! Reply polling for bridged conversations
//!
//! Bridged conversations have no change feed. After each accepted visitor
//! message the watcher polls the relay for the operator's latest reply and
//! merges it into the session once.

use super::conversation::{ConversationSession, SessionDeps};
use crate::chat::models::{Conversation, ConversationMode, Message};
use crate::chat::retry::with_timeout;
use crate::chat::traits::BridgeRelay;
use crate::config::{PollingConfig, SessionConfig};
use crate::error::ChatError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Whether the watcher is waiting for an operator reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Nothing outstanding; no timer running
    Idle,
    /// A visitor message was accepted and the timer is polling
    Awaiting,
}

/// How the last wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherOutcome {
    /// A new operator reply was merged
    ReplyMerged {
        /// Id of the merged reply
        reply_id: String,
    },
    /// `max_wait` elapsed without a new reply
    GaveUp,
}

struct WatcherInner {
    state: WatcherState,
    last_merged_reply_id: Option<String>,
    timer: Option<JoinHandle<()>>,
    awaiting_since: Option<Instant>,
    last_outcome: Option<WatcherOutcome>,
    closed: bool,
}

impl Drop for WatcherInner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct WatcherShared {
    session: ConversationSession,
    relay: Arc<dyn BridgeRelay>,
    session_config: SessionConfig,
    polling: PollingConfig,
    inner: Mutex<WatcherInner>,
}

/// Visitor-side controller of a bridged conversation
#[derive(Clone)]
pub struct PollingWatcher {
    shared: Arc<WatcherShared>,
}

impl PollingWatcher {
    /// Create a bridged conversation for `visitor_label` and open a watcher on it
    pub async fn start(
        visitor_label: &str,
        deps: SessionDeps,
        relay: Arc<dyn BridgeRelay>,
        session_config: SessionConfig,
        polling: PollingConfig,
    ) -> Result<Self, ChatError> {
        let conversation = relay.create_bridged_conversation(visitor_label).await?;
        Self::open(conversation, visitor_label, deps, relay, session_config, polling).await
    }

    /// Open a watcher on an existing bridged conversation
    pub async fn open(
        conversation: Conversation,
        visitor_label: &str,
        deps: SessionDeps,
        relay: Arc<dyn BridgeRelay>,
        session_config: SessionConfig,
        polling: PollingConfig,
    ) -> Result<Self, ChatError> {
        if conversation.mode != ConversationMode::Bridged {
            return Err(ChatError::InvalidInput(format!(
                "Conversation {} is not bridged",
                conversation.id
            )));
        }

        let session =
            ConversationSession::open(conversation, visitor_label, deps, session_config.clone())
                .await?;
        // Replies already in the history must not be merged again
        let last_merged_reply_id = session
            .messages()
            .iter()
            .rev()
            .find(|m| m.sender_id.is_none())
            .map(|m| m.id.clone());

        Ok(Self {
            shared: Arc::new(WatcherShared {
                session,
                relay,
                session_config,
                polling,
                inner: Mutex::new(WatcherInner {
                    state: WatcherState::Idle,
                    last_merged_reply_id,
                    timer: None,
                    awaiting_since: None,
                    last_outcome: None,
                    closed: false,
                }),
            }),
        })
    }

    /// The underlying session
    pub fn session(&self) -> &ConversationSession {
        &self.shared.session
    }

    /// Snapshot of the visible messages
    pub fn messages(&self) -> Vec<Message> {
        self.shared.session.messages()
    }

    /// Current watcher state
    pub fn state(&self) -> WatcherState {
        self.lock_inner().state
    }

    /// Id of the most recent reply merged by this watcher
    pub fn last_merged_reply_id(&self) -> Option<String> {
        self.lock_inner().last_merged_reply_id.clone()
    }

    /// How the most recent wait ended, if it has
    pub fn last_outcome(&self) -> Option<WatcherOutcome> {
        self.lock_inner().last_outcome.clone()
    }

    /// Relay a visitor message and start waiting for the reply
    ///
    /// If the relay fails the message stays visible as failed and the
    /// watcher does not start polling.
    pub async fn send(&self, body: &str) -> Result<Message, ChatError> {
        let sent = self
            .shared
            .session
            .send_with(body, |local| self.relay_message(local))
            .await?;
        self.enter_awaiting();
        Ok(sent)
    }

    /// Relay a failed visitor message again
    pub async fn resend(&self, local_id: &str) -> Result<Message, ChatError> {
        let sent = self
            .shared
            .session
            .resend_with(local_id, |local| self.relay_message(local))
            .await?;
        self.enter_awaiting();
        Ok(sent)
    }

    /// Stop polling and close the session. Idempotent.
    pub fn close(&self) {
        let timer = {
            let mut inner = self.lock_inner();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.state = WatcherState::Idle;
            inner.awaiting_since = None;
            inner.timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        self.shared.session.close();
        info!(
            conversation_id = %self.shared.session.conversation().id,
            "Polling watcher closed"
        );
    }

    async fn relay_message(&self, local: Message) -> Result<Message, ChatError> {
        let shared = &self.shared;
        let ack = with_timeout(
            &shared.session_config,
            "relay",
            shared.relay.relay(&local.conversation_id, &local),
        )
        .await
        .map_err(|e| match e {
            ChatError::BridgeRelayFailed(reason) => ChatError::BridgeRelayFailed(reason),
            other => ChatError::BridgeRelayFailed(other.to_string()),
        })?;
        Ok(ack.message)
    }

    fn enter_awaiting(&self) {
        let mut inner = self.lock_inner();
        if inner.closed {
            return;
        }
        if inner.state == WatcherState::Idle {
            info!(
                conversation_id = %self.shared.session.conversation().id,
                "Awaiting operator reply"
            );
        }
        inner.state = WatcherState::Awaiting;
        inner.awaiting_since = Some(Instant::now());
        inner.last_outcome = None;

        if inner.timer.as_ref().map_or(true, JoinHandle::is_finished) {
            inner.timer = Some(tokio::spawn(run_timer(
                Arc::downgrade(&self.shared),
                self.shared.polling.interval,
            )));
        }
    }

    /// One poll; returns whether the timer should keep running
    async fn poll_once(&self) -> bool {
        let shared = &self.shared;
        let conversation_id = &shared.session.conversation().id;

        {
            let mut inner = self.lock_inner();
            if inner.closed || inner.state != WatcherState::Awaiting {
                return false;
            }
            if let (Some(max_wait), Some(since)) = (shared.polling.max_wait, inner.awaiting_since) {
                if since.elapsed() >= max_wait {
                    warn!(
                        conversation_id = %conversation_id,
                        waited_ms = since.elapsed().as_millis() as u64,
                        "No operator reply, giving up"
                    );
                    settle(&mut inner, WatcherOutcome::GaveUp);
                    return false;
                }
            }
        }

        let fetched = with_timeout(
            &shared.session_config,
            "fetch_latest_reply",
            shared.relay.fetch_latest_reply(conversation_id),
        )
        .await;
        let reply = match fetched {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                debug!(conversation_id = %conversation_id, "No reply yet");
                return true;
            }
            Err(e) => {
                warn!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "Reply poll failed, trying again next tick"
                );
                return true;
            }
        };

        {
            let inner = self.lock_inner();
            if inner.closed {
                return false;
            }
            if inner.last_merged_reply_id.as_deref() == Some(reply.id.as_str()) {
                debug!(conversation_id = %conversation_id, "Latest reply already merged");
                return true;
            }
        }

        let reply_id = reply.id.clone();
        if shared.session.merge(reply).is_none() {
            return false;
        }

        let mut inner = self.lock_inner();
        if inner.closed {
            return false;
        }
        inner.last_merged_reply_id = Some(reply_id.clone());
        info!(
            conversation_id = %conversation_id,
            reply_id = %reply_id,
            "Operator reply merged"
        );
        settle(&mut inner, WatcherOutcome::ReplyMerged { reply_id });
        false
    }

    fn lock_inner(&self) -> MutexGuard<'_, WatcherInner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Back to idle; only called from inside the timer task, so its handle is detached
fn settle(inner: &mut WatcherInner, outcome: WatcherOutcome) {
    inner.state = WatcherState::Idle;
    inner.awaiting_since = None;
    inner.last_outcome = Some(outcome);
    drop(inner.timer.take());
}

async fn run_timer(watcher: Weak<WatcherShared>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = watcher.upgrade() else {
            return;
        };
        let watcher = PollingWatcher { shared };
        if !watcher.poll_once().await {
            return;
        }
    }
}
