//! Error types and error handling for the application
//!
//! `ChatError` covers every failure a session, store, feed or relay can
//! surface. Transient failures are retried close to where they occur (see
//! [`crate::chat::retry`]); everything else reaches the caller typed.
//! All errors implement `IntoResponse` to provide consistent error formatting.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-level error types
#[derive(Error, Debug)]
pub enum ChatError {
    /// The backing store could not be reached; safe to retry
    #[error("Conversation store unavailable: {0}")]
    StoreUnavailable(String),

    /// A send attempt exhausted its retries; the local entry is marked failed
    #[error("Failed to send message {local_id}: {reason}")]
    SendFailed {
        /// Local id of the failed entry, used for resubmission
        local_id: String,
        /// Last underlying failure
        reason: String,
    },

    /// The change feed dropped the subscription
    #[error("Change feed disconnected: {0}")]
    FeedDisconnected(String),

    /// The external gateway did not accept the visitor's message
    #[error("Bridge relay failed: {0}")]
    BridgeRelayFailed(String),

    /// Conversation with the given ID was not found
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// Caller supplied an invalid value
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation attempted on a session that has been closed
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Internal server error (catch-all for unexpected errors)
    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ChatError {
    /// Whether the failure may resolve on its own and is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::StoreUnavailable(_) | ChatError::Timeout(_))
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => ChatError::StoreUnavailable(e.to_string()),
            // SQLITE_BUSY / SQLITE_LOCKED
            sqlx::Error::Database(ref db)
                if matches!(db.code().as_deref(), Some("5") | Some("6")) =>
            {
                ChatError::StoreUnavailable(e.to_string())
            }
            other => ChatError::Internal(anyhow::anyhow!("Database error: {}", other)),
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match self {
            ChatError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::SendFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ChatError::FeedDisconnected(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::BridgeRelayFailed(_) => StatusCode::BAD_GATEWAY,
            ChatError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
            ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ChatError::SessionClosed(_) => StatusCode::CONFLICT,
            ChatError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ChatError::StoreUnavailable("down".into()).is_transient());
        assert!(ChatError::Timeout("slow".into()).is_transient());
        assert!(!ChatError::BridgeRelayFailed("nope".into()).is_transient());
        assert!(!ChatError::InvalidInput("empty".into()).is_transient());
    }

    #[test]
    fn test_pool_timeout_maps_to_store_unavailable() {
        let err: ChatError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, ChatError::StoreUnavailable(_)));
    }

    #[test]
    fn test_status_codes() {
        let resp = ChatError::ConversationNotFound("c1".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ChatError::BridgeRelayFailed("gateway down".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let resp = ChatError::InvalidInput("empty".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
