//! Chat data models
//!
//! Defines conversations, messages and the ordering rules shared by every
//! component that holds a copy of a conversation's log.

use crate::error::ChatError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::cmp::Ordering;

/// Prefix of locally assigned message ids that the store has not confirmed yet
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Longest message body accepted, in characters
pub const MAX_BODY_LENGTH: usize = 10_000;

/// Current wall-clock time as Unix milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// How a conversation reaches its counterpart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ConversationMode {
    /// Both participants are registered and receive inserts from the change feed
    Push,
    /// An anonymous visitor talks to an operator through the external gateway
    Bridged,
}

impl ConversationMode {
    /// Convert the mode to its string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationMode::Push => "push",
            ConversationMode::Bridged => "bridged",
        }
    }
}

/// Delivery state of a message as seen by the local session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Sent optimistically, store round-trip still in flight
    Pending,
    /// Durably appended; carries the store-assigned id
    #[default]
    Confirmed,
    /// The append attempt failed; kept visible for resubmission
    Failed,
}

/// A conversation thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Conversation {
    /// Unique identifier for the conversation
    pub id: String,
    /// First participant (the operator side for bridged conversations)
    pub participant_a: String,
    /// Second participant, or the visitor label for bridged conversations
    pub participant_b: String,
    /// Optional subject the conversation is about (e.g. a project reference)
    pub subject_ref: Option<String>,
    /// How the counterpart is reached
    pub mode: ConversationMode,
    /// When the conversation was created (Unix milliseconds)
    pub created_at: i64,
    /// When the conversation last received a message (Unix milliseconds)
    pub updated_at: i64,
}

impl Conversation {
    /// Create a new push-mode conversation between two participants
    pub fn new(
        id: String,
        participant_a: String,
        participant_b: String,
        subject_ref: Option<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            id,
            participant_a,
            participant_b,
            subject_ref,
            mode: ConversationMode::Push,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a new bridged conversation for an anonymous visitor
    pub fn bridged(id: String, operator: String, visitor_label: String) -> Self {
        Self {
            mode: ConversationMode::Bridged,
            ..Self::new(id, operator, visitor_label, None)
        }
    }

    /// Whether `participant` is one of the two parties
    pub fn has_participant(&self, participant: &str) -> bool {
        self.participant_a == participant || self.participant_b == participant
    }
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Message {
    /// Store-assigned id, or a `local-` id while the message is unconfirmed
    pub id: String,
    /// ID of the conversation this message belongs to
    pub conversation_id: String,
    /// Author; `None` marks a system or operator message
    pub sender_id: Option<String>,
    /// Content of the message
    pub body: String,
    /// When the message was created (Unix milliseconds)
    pub created_at: i64,
    /// Local delivery state; every row read from the store is confirmed
    #[sqlx(skip)]
    #[serde(default)]
    pub delivery_state: DeliveryState,
}

impl Message {
    /// Create a confirmed message
    pub fn new(
        id: String,
        conversation_id: String,
        sender_id: Option<String>,
        body: String,
        created_at: i64,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            body,
            created_at,
            delivery_state: DeliveryState::Confirmed,
        }
    }

    /// Create an optimistic local copy with a temporary id, stamped now
    pub fn optimistic(conversation_id: &str, sender_id: Option<String>, body: String) -> Self {
        Self {
            id: format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4()),
            conversation_id: conversation_id.to_string(),
            sender_id,
            body,
            created_at: now_millis(),
            delivery_state: DeliveryState::Pending,
        }
    }

    /// Whether the id was assigned locally rather than by the store
    pub fn is_local(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }

    /// Id a store keeps for this message; a local id loses its prefix
    ///
    /// Stable across resubmissions of the same optimistic entry.
    pub fn store_id(&self) -> &str {
        self.id.strip_prefix(LOCAL_ID_PREFIX).unwrap_or(&self.id)
    }

    /// Whether `participant` wrote this message
    pub fn is_from(&self, participant: &str) -> bool {
        self.sender_id.as_deref() == Some(participant)
    }

    /// Total order within a conversation: created_at, then id
    pub fn display_order(&self, other: &Message) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Reject bodies that are blank or too long to be sent
pub fn validate_body(body: &str) -> Result<(), ChatError> {
    if body.trim().is_empty() {
        return Err(ChatError::InvalidInput(
            "Message body cannot be empty".to_string(),
        ));
    }
    let length = body.chars().count();
    if length > MAX_BODY_LENGTH {
        return Err(ChatError::InvalidInput(format!(
            "Message body too long ({} characters, max {})",
            length, MAX_BODY_LENGTH
        )));
    }
    Ok(())
}
