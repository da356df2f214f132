//! API module
//!
//! HTTP request handlers exposing the conversation store and the bridge relay

pub mod conversations;
pub mod utils;

use crate::websocket;
use axum::{
    routing::{get, post},
    Router,
};
use utils::RouterState;

/// All HTTP and WebSocket routes, without middleware
pub fn router(state: RouterState) -> Router {
    Router::new()
        .route("/api/health", get(conversations::health))
        .route(
            "/api/conversations",
            post(conversations::create_conversation),
        )
        .route(
            "/api/conversations/bridged",
            post(conversations::create_bridged_conversation),
        )
        .route("/api/conversations/:id", get(conversations::get_conversation))
        .route(
            "/api/conversations/:id/messages",
            get(conversations::list_messages).post(conversations::append_message),
        )
        .route(
            "/api/conversations/:id/relay",
            post(conversations::relay_message),
        )
        .route(
            "/api/conversations/:id/latest-reply",
            get(conversations::latest_reply),
        )
        .route(
            "/api/participants/:id/conversations",
            get(conversations::list_conversations_for),
        )
        .route(
            "/ws/conversations/:id",
            get(websocket::conversation_feed_handler),
        )
        .with_state(state)
}
