//! In-process change feed
//!
//! Distributes appended messages via `tokio::sync::broadcast`. Each
//! subscription gets a forwarding task that filters by conversation and
//! pushes into the subscriber's sink.

use super::models::Message;
use super::traits::{ChangeFeed, FeedEvent, FeedSink, SubscriptionHandle};
use crate::error::ChatError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default broadcast channel capacity
const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast hub implementing [`ChangeFeed`]
///
/// Publishing never blocks. With no subscribers, inserts are dropped.
#[derive(Debug, Clone)]
pub struct FeedHub {
    sender: broadcast::Sender<Message>,
    forwarders: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
    next_id: Arc<AtomicU64>,
}

impl FeedHub {
    /// Create a new hub with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            forwarders: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Notify subscribers that `message` was appended
    pub fn publish(&self, message: &Message) {
        if let Ok(n) = self.sender.send(message.clone()) {
            debug!(
                conversation_id = %message.conversation_id,
                message_id = %message.id,
                receivers = n,
                "Message published to feed"
            );
        }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop every subscription (used on shutdown)
    pub fn close_all(&self) {
        let mut forwarders = self.forwarders.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, task) in forwarders.drain() {
            task.abort();
        }
    }
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

async fn forward(
    mut receiver: broadcast::Receiver<Message>,
    conversation_id: String,
    sink: FeedSink,
) {
    loop {
        match receiver.recv().await {
            Ok(message) => {
                if message.conversation_id != conversation_id {
                    continue;
                }
                if sink.send(FeedEvent::Inserted(message)).is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(
                    conversation_id = %conversation_id,
                    missed,
                    "Feed subscriber lagged behind"
                );
                let reason = format!("subscriber lagged, {} inserts dropped", missed);
                if sink.send(FeedEvent::Disconnected(reason)).is_err() {
                    break;
                }
            }
            Err(RecvError::Closed) => {
                let _ = sink.send(FeedEvent::Disconnected("feed closed".to_string()));
                break;
            }
        }
    }
}

#[async_trait]
impl ChangeFeed for FeedHub {
    async fn subscribe(
        &self,
        conversation_id: &str,
        sink: FeedSink,
    ) -> Result<SubscriptionHandle, ChatError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self.sender.subscribe();
        let task = tokio::spawn(forward(receiver, conversation_id.to_string(), sink));

        self.forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, task);

        debug!(conversation_id = %conversation_id, subscription = id, "Feed subscribed");
        Ok(SubscriptionHandle {
            id,
            conversation_id: conversation_id.to_string(),
        })
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let task = self
            .forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.id);
        if let Some(task) = task {
            task.abort();
            debug!(
                conversation_id = %handle.conversation_id,
                subscription = handle.id,
                "Feed unsubscribed"
            );
        }
    }
}
