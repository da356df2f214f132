//! Ordered, deduplicated message collection owned by a session
//!
//! Messages are kept sorted by `(created_at, id)`. An id is never present
//! twice, whether it is a store-assigned id or a local optimistic one.

use crate::chat::models::{DeliveryState, Message};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Result of offering a message to the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The message was new and is now visible
    Inserted,
    /// Already present; nothing changed
    Duplicate,
}

/// The session's single authoritative copy of a conversation
#[derive(Debug, Default)]
pub struct Timeline {
    messages: Vec<Message>,
    ids: HashSet<String>,
    pending: HashSet<String>,
}

impl Timeline {
    /// Create an empty timeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages in display order
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of visible messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether no message is visible
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether a message with this id is visible
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Look up a visible message
    pub fn get(&self, id: &str) -> Option<&Message> {
        self.position(id).map(|i| &self.messages[i])
    }

    /// Local ids of optimistic entries still awaiting the store
    pub fn pending_ids(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    /// Insert `message` at its sorted position unless its id is known
    pub fn merge(&mut self, message: Message) -> MergeOutcome {
        if self.ids.contains(&message.id) || self.pending.contains(&message.id) {
            return MergeOutcome::Duplicate;
        }
        self.insert_sorted(message);
        MergeOutcome::Inserted
    }

    /// Show a locally composed message before the store confirms it
    pub fn insert_optimistic(&mut self, message: Message) -> MergeOutcome {
        let id = message.id.clone();
        let outcome = self.merge(message);
        if outcome == MergeOutcome::Inserted {
            self.pending.insert(id);
        }
        outcome
    }

    /// Replace the optimistic entry `local_id` with its durable copy
    ///
    /// If the durable copy already arrived through another path, the
    /// optimistic entry is simply dropped. Returns `false` if `local_id`
    /// is unknown.
    pub fn confirm(&mut self, local_id: &str, mut stored: Message) -> bool {
        let Some(index) = self.position(local_id) else {
            return false;
        };
        self.messages.remove(index);
        self.ids.remove(local_id);
        self.pending.remove(local_id);

        stored.delivery_state = DeliveryState::Confirmed;
        if !self.ids.contains(&stored.id) {
            self.insert_sorted(stored);
        }
        true
    }

    /// Mark the optimistic entry `local_id` as failed; it stays visible
    pub fn mark_failed(&mut self, local_id: &str) -> bool {
        self.set_state(local_id, DeliveryState::Failed)
    }

    /// Move a failed entry back to pending for resubmission
    ///
    /// Returns a copy of the entry, or `None` if it is unknown or not failed.
    pub fn retry_failed(&mut self, local_id: &str) -> Option<Message> {
        let index = self.position(local_id)?;
        let entry = &mut self.messages[index];
        if entry.delivery_state != DeliveryState::Failed {
            return None;
        }
        entry.delivery_state = DeliveryState::Pending;
        Some(entry.clone())
    }

    fn set_state(&mut self, id: &str, state: DeliveryState) -> bool {
        match self.position(id) {
            Some(index) => {
                self.messages[index].delivery_state = state;
                true
            }
            None => false,
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        if !self.ids.contains(id) {
            return None;
        }
        self.messages.iter().position(|m| m.id == id)
    }

    fn insert_sorted(&mut self, message: Message) {
        let index = self
            .messages
            .partition_point(|m| m.display_order(&message) == Ordering::Less);
        self.ids.insert(message.id.clone());
        self.messages.insert(index, message);
    }
}
