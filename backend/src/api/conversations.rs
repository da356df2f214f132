//! Conversation API endpoints
//!
//! Handles HTTP requests for conversations, messages and bridged relaying.

use crate::api::utils::{validate_participant, RouterState};
use crate::chat::models::validate_body;
use crate::chat::{BridgeRelay, Conversation, ConversationMode, ConversationStore, Message};
use crate::error::ChatError;
use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::{Deserialize, Serialize};

/// Request to find or create a push conversation
#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    /// First participant
    pub participant_a: String,
    /// Second participant
    pub participant_b: String,
    /// Optional subject, e.g. a project reference
    pub subject_ref: Option<String>,
}

/// Request to open a bridged conversation for an anonymous visitor
#[derive(Debug, Deserialize)]
pub struct CreateBridgedRequest {
    /// Display label of the visitor
    pub visitor_label: String,
}

/// Request to append or relay a message
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    /// Author; omitted for system/operator messages
    pub sender_id: Option<String>,
    /// Message text
    pub body: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always "ok" when the server answers
    pub status: String,
    /// Crate version
    pub version: String,
    /// Live change feed subscriptions
    pub feed_subscribers: usize,
}

/// GET /api/health
pub async fn health(State((_, feed, _)): State<RouterState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        feed_subscribers: feed.subscriber_count(),
    })
}

/// POST /api/conversations - Find or create the conversation for a key
pub async fn create_conversation(
    State((chat_db, _, _)): State<RouterState>,
    Json(request): Json<CreateConversationRequest>,
) -> Result<Json<Conversation>, ChatError> {
    validate_participant("participant_a", &request.participant_a)?;
    validate_participant("participant_b", &request.participant_b)?;

    let conversation = chat_db
        .lookup_or_create(
            &request.participant_a,
            &request.participant_b,
            request.subject_ref.as_deref(),
        )
        .await?;
    Ok(Json(conversation))
}

/// POST /api/conversations/bridged - Create a bridged conversation
pub async fn create_bridged_conversation(
    State((_, _, relay)): State<RouterState>,
    Json(request): Json<CreateBridgedRequest>,
) -> Result<Json<Conversation>, ChatError> {
    validate_participant("visitor_label", &request.visitor_label)?;
    let conversation = relay
        .create_bridged_conversation(&request.visitor_label)
        .await?;
    Ok(Json(conversation))
}

/// GET /api/conversations/:id
pub async fn get_conversation(
    State((chat_db, _, _)): State<RouterState>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, ChatError> {
    match chat_db.get_conversation(&id).await? {
        Some(conversation) => Ok(Json(conversation)),
        None => Err(ChatError::ConversationNotFound(id)),
    }
}

/// GET /api/participants/:id/conversations - Most recently active first
pub async fn list_conversations_for(
    State((chat_db, _, _)): State<RouterState>,
    Path(participant): Path<String>,
) -> Result<Json<Vec<Conversation>>, ChatError> {
    Ok(Json(chat_db.list_conversations_for(&participant).await?))
}

/// GET /api/conversations/:id/messages - Full history, oldest first
pub async fn list_messages(
    State((chat_db, _, _)): State<RouterState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Message>>, ChatError> {
    if chat_db.get_conversation(&id).await?.is_none() {
        return Err(ChatError::ConversationNotFound(id));
    }
    Ok(Json(chat_db.list(&id).await?))
}

/// POST /api/conversations/:id/messages - Append to a push conversation
pub async fn append_message(
    State((chat_db, _, _)): State<RouterState>,
    Path(id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<Message>, ChatError> {
    validate_body(&request.body)?;
    match chat_db.get_conversation(&id).await? {
        None => return Err(ChatError::ConversationNotFound(id)),
        Some(conversation) if conversation.mode == ConversationMode::Bridged => {
            return Err(ChatError::InvalidInput(format!(
                "Conversation {} is bridged; use the relay endpoint",
                id
            )));
        }
        Some(_) => {}
    }
    let message = chat_db
        .append(&id, request.sender_id.as_deref(), &request.body)
        .await?;
    Ok(Json(message))
}

/// POST /api/conversations/:id/relay - Forward a visitor message
pub async fn relay_message(
    State((_, _, relay)): State<RouterState>,
    Path(id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<Message>, ChatError> {
    validate_body(&request.body)?;
    let visitor_message = Message::optimistic(&id, request.sender_id, request.body);
    let ack = relay.relay(&id, &visitor_message).await?;
    Ok(Json(ack.message))
}

/// GET /api/conversations/:id/latest-reply
pub async fn latest_reply(
    State((_, _, relay)): State<RouterState>,
    Path(id): Path<String>,
) -> Result<Json<Option<Message>>, ChatError> {
    Ok(Json(relay.fetch_latest_reply(&id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::mock::MockRelay;
    use crate::chat::{ChatDb, FeedHub};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn create_test_router_state() -> (RouterState, Arc<MockRelay>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let feed = FeedHub::default();
        let chat_db = ChatDb::new(db_path.to_str().unwrap())
            .await
            .expect("Failed to create test database")
            .with_feed(feed.clone());
        let relay = Arc::new(MockRelay::new());
        let bridge: Arc<dyn BridgeRelay> = relay.clone();
        ((Arc::new(chat_db), feed, bridge), relay, temp_dir)
    }

    fn key(subject_ref: Option<&str>) -> CreateConversationRequest {
        CreateConversationRequest {
            participant_a: "alice".to_string(),
            participant_b: "bob".to_string(),
            subject_ref: subject_ref.map(String::from),
        }
    }

    fn send(sender: Option<&str>, body: &str) -> SendMessageRequest {
        SendMessageRequest {
            sender_id: sender.map(String::from),
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_conversation_is_idempotent() {
        let (state, _, _temp_dir) = create_test_router_state().await;
        let first = create_conversation(State(state.clone()), Json(key(Some("p1"))))
            .await
            .unwrap()
            .0;
        let second = create_conversation(State(state), Json(key(Some("p1"))))
            .await
            .unwrap()
            .0;
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_create_conversation_rejects_blank_participant() {
        let (state, _, _temp_dir) = create_test_router_state().await;
        let mut request = key(None);
        request.participant_b = "  ".to_string();
        let result = create_conversation(State(state), Json(request)).await;
        assert!(matches!(result, Err(ChatError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_append_then_list_messages() {
        let (state, _, _temp_dir) = create_test_router_state().await;
        let conv = create_conversation(State(state.clone()), Json(key(None)))
            .await
            .unwrap()
            .0;

        append_message(State(state.clone()), Path(conv.id.clone()), Json(send(Some("alice"), "Hola")))
            .await
            .unwrap();
        append_message(State(state.clone()), Path(conv.id.clone()), Json(send(Some("bob"), "¿Qué tal?")))
            .await
            .unwrap();

        let messages = list_messages(State(state), Path(conv.id)).await.unwrap().0;
        assert_eq!(messages.len(), 2);
        assert!(messages[0].created_at <= messages[1].created_at);
        assert!(messages.iter().any(|m| m.body == "Hola"));
        assert!(messages.iter().any(|m| m.body == "¿Qué tal?"));
    }

    #[tokio::test]
    async fn test_append_rejects_empty_body() {
        let (state, _, _temp_dir) = create_test_router_state().await;
        let conv = create_conversation(State(state.clone()), Json(key(None)))
            .await
            .unwrap()
            .0;
        let result = append_message(State(state), Path(conv.id), Json(send(Some("alice"), " "))).await;
        assert!(matches!(result, Err(ChatError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_append_rejects_bridged_conversation() {
        let (state, relay, _temp_dir) = create_test_router_state().await;
        let (chat_db, _, _) = state.clone();
        let conv = chat_db
            .create_bridged_conversation("operator", "Visitante")
            .await
            .unwrap();

        let result = append_message(
            State(state.clone()),
            Path(conv.id.clone()),
            Json(send(Some("Visitante"), "Hola")),
        )
        .await;
        assert!(matches!(result, Err(ChatError::InvalidInput(_))));

        let messages = list_messages(State(state), Path(conv.id)).await.unwrap().0;
        assert!(messages.is_empty());
        assert!(relay.relayed().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_conversation() {
        let (state, _, _temp_dir) = create_test_router_state().await;
        let result = get_conversation(State(state.clone()), Path("nonexistent".to_string())).await;
        assert!(matches!(result, Err(ChatError::ConversationNotFound(_))));

        let result = list_messages(State(state.clone()), Path("nonexistent".to_string())).await;
        assert!(matches!(result, Err(ChatError::ConversationNotFound(_))));

        let result = append_message(
            State(state),
            Path("nonexistent".to_string()),
            Json(send(Some("alice"), "hi")),
        )
        .await;
        assert!(matches!(result, Err(ChatError::ConversationNotFound(_))));
    }

    #[tokio::test]
    async fn test_list_conversations_for_participant() {
        let (state, _, _temp_dir) = create_test_router_state().await;
        create_conversation(State(state.clone()), Json(key(Some("p1"))))
            .await
            .unwrap();
        create_conversation(State(state.clone()), Json(key(Some("p2"))))
            .await
            .unwrap();

        let convs = list_conversations_for(State(state.clone()), Path("bob".to_string()))
            .await
            .unwrap()
            .0;
        assert_eq!(convs.len(), 2);

        let convs = list_conversations_for(State(state), Path("carol".to_string()))
            .await
            .unwrap()
            .0;
        assert!(convs.is_empty());
    }

    #[tokio::test]
    async fn test_relay_and_latest_reply_go_through_relay() {
        let (state, relay, _temp_dir) = create_test_router_state().await;
        let conv = create_bridged_conversation(
            State(state.clone()),
            Json(CreateBridgedRequest {
                visitor_label: "Visitante".to_string(),
            }),
        )
        .await
        .unwrap()
        .0;

        let acked = relay_message(State(state.clone()), Path(conv.id.clone()), Json(send(Some("Visitante"), "Hola")))
            .await
            .unwrap()
            .0;
        assert_eq!(acked.body, "Hola");
        assert_eq!(relay.relayed().len(), 1);

        let reply = latest_reply(State(state), Path(conv.id)).await.unwrap().0;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_relay_failure_is_surfaced() {
        let (state, relay, _temp_dir) = create_test_router_state().await;
        relay.fail_relays("gateway unreachable");
        let result = relay_message(State(state), Path("c1".to_string()), Json(send(None, "Hola"))).await;
        assert!(matches!(result, Err(ChatError::BridgeRelayFailed(_))));
    }

    #[tokio::test]
    async fn test_health_reports_feed_subscribers() {
        let (state, _, _temp_dir) = create_test_router_state().await;
        let response = health(State(state)).await.0;
        assert_eq!(response.status, "ok");
        assert_eq!(response.feed_subscribers, 0);
    }
}
