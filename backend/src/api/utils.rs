//! API utility functions
//!
//! Shared router state and request validation used by the handlers.

use crate::chat::{BridgeRelay, ChatDb, FeedHub};
use crate::error::ChatError;
use std::sync::Arc;

/// State shared by every route: the store, the change feed and the relay
pub type RouterState = (Arc<ChatDb>, FeedHub, Arc<dyn BridgeRelay>);

/// Maximum participant id / label length in characters
pub const MAX_PARTICIPANT_LENGTH: usize = 200;

/// Validate a participant id or visitor label
///
/// # Returns
/// * `Ok(())` - Value is usable
/// * `Err(ChatError)` - Value is empty or too long
pub fn validate_participant(field: &str, value: &str) -> Result<(), ChatError> {
    if value.trim().is_empty() {
        return Err(ChatError::InvalidInput(format!("{} cannot be empty", field)));
    }
    if value.chars().count() > MAX_PARTICIPANT_LENGTH {
        return Err(ChatError::InvalidInput(format!(
            "{} exceeds maximum length of {} characters",
            field, MAX_PARTICIPANT_LENGTH
        )));
    }
    Ok(())
}
