//! Gateway Relay
//!
//! `BridgeRelay` backed by external gateway processes, one per bridged
//! conversation. Visitor messages are stored only once the gateway has
//! accepted them; both they and operator replies are stored idempotently,
//! so a resubmission or a repeated fetch never duplicates a row.

use super::bridge_session::GatewaySession;
use super::db::ChatDb;
use super::models::{now_millis, Conversation, ConversationMode, Message};
use super::traits::{BridgeRelay, RelayAck};
use crate::config::BridgeConfig;
use crate::error::ChatError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Manages gateway processes for bridged conversations
///
/// One GatewaySession per conversation ID, created on demand and replaced
/// if its process dies.
pub struct GatewayRelay {
    db: Arc<ChatDb>,
    /// Map from conversation_id to GatewaySession
    sessions: Arc<RwLock<HashMap<String, Arc<GatewaySession>>>>,
    config: BridgeConfig,
    request_timeout: Duration,
}

impl GatewayRelay {
    /// Create a relay storing into `db` and spawning gateways per `config`
    pub fn new(db: Arc<ChatDb>, config: BridgeConfig, request_timeout: Duration) -> Self {
        Self {
            db,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
            request_timeout,
        }
    }

    /// Get or create the gateway session for a conversation
    pub async fn get_or_create_session(
        &self,
        conversation_id: &str,
    ) -> Result<Arc<GatewaySession>, String> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(conversation_id) {
                if session.is_running().await {
                    debug!(
                        conversation_id = %conversation_id,
                        "Reusing existing gateway session"
                    );
                    return Ok(session.clone());
                }
                warn!(
                    conversation_id = %conversation_id,
                    "Gateway process has died, replacing it"
                );
                drop(sessions);
                self.sessions.write().await.remove(conversation_id);
            }
        }

        let session = Arc::new(
            GatewaySession::new(
                conversation_id.to_string(),
                &self.config,
                self.request_timeout,
            )
            .await
            .map_err(|e| {
                error!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "Failed to create gateway session"
                );
                e
            })?,
        );

        // A concurrent caller may have won the race; keep the first one
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(conversation_id.to_string())
            .or_insert(session)
            .clone();

        info!(conversation_id = %conversation_id, "Gateway session ready");
        Ok(session)
    }

    /// Kill all gateway processes (for graceful shutdown)
    pub async fn kill_all_sessions(&self) {
        info!("Killing all gateway processes");

        let mut sessions = self.sessions.write().await;
        for (conversation_id, session) in sessions.drain() {
            if let Err(e) = session.kill().await {
                error!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "Failed to kill gateway process during shutdown"
                );
            }
        }
    }

    /// Get the number of live gateway sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn bridged_conversation(&self, conversation_id: &str) -> Result<Conversation, ChatError> {
        let conversation = self
            .db
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?;
        if conversation.mode != ConversationMode::Bridged {
            return Err(ChatError::InvalidInput(format!(
                "Conversation {} is not bridged",
                conversation_id
            )));
        }
        Ok(conversation)
    }

    async fn gateway(&self, conversation_id: &str) -> Result<Arc<GatewaySession>, ChatError> {
        self.get_or_create_session(conversation_id)
            .await
            .map_err(ChatError::BridgeRelayFailed)
    }
}

#[async_trait]
impl BridgeRelay for GatewayRelay {
    async fn create_bridged_conversation(
        &self,
        visitor_label: &str,
    ) -> Result<Conversation, ChatError> {
        if visitor_label.trim().is_empty() {
            return Err(ChatError::InvalidInput(
                "Visitor label cannot be empty".to_string(),
            ));
        }
        self.db
            .create_bridged_conversation(&self.config.operator_label, visitor_label)
            .await
    }

    async fn relay(
        &self,
        conversation_id: &str,
        visitor_message: &Message,
    ) -> Result<RelayAck, ChatError> {
        self.bridged_conversation(conversation_id).await?;

        // Same id on every resubmission of one optimistic entry
        let message_id = visitor_message.store_id().to_string();
        let gateway = self.gateway(conversation_id).await?;
        gateway
            .relay(
                &message_id,
                visitor_message.sender_id.as_deref(),
                &visitor_message.body,
            )
            .await
            .map_err(|e| {
                error!(
                    conversation_id = %conversation_id,
                    message_id = %message_id,
                    error = %e,
                    "Gateway did not accept visitor message"
                );
                ChatError::BridgeRelayFailed(e)
            })?;

        let candidate = Message::new(
            message_id.clone(),
            conversation_id.to_string(),
            visitor_message.sender_id.clone(),
            visitor_message.body.clone(),
            visitor_message.created_at,
        );
        self.db.insert_external(&candidate).await?;
        let stored = self.db.get_message(&message_id).await?.ok_or_else(|| {
            ChatError::Internal(anyhow::anyhow!("Relayed message {} not stored", message_id))
        })?;

        info!(
            conversation_id = %conversation_id,
            message_id = %message_id,
            "Visitor message queued on gateway"
        );
        Ok(RelayAck { message: stored })
    }

    async fn fetch_latest_reply(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Message>, ChatError> {
        self.bridged_conversation(conversation_id).await?;

        let gateway = self.gateway(conversation_id).await?;
        let Some(reply) = gateway
            .latest_reply()
            .await
            .map_err(ChatError::BridgeRelayFailed)?
        else {
            return Ok(None);
        };

        let candidate = Message::new(
            reply.id.clone(),
            conversation_id.to_string(),
            None,
            reply.body,
            reply.created_at.unwrap_or_else(now_millis),
        );
        if self.db.insert_external(&candidate).await? {
            info!(
                conversation_id = %conversation_id,
                message_id = %reply.id,
                "Stored operator reply"
            );
        }

        // The first stored copy wins, so created_at stays stable across fetches
        self.db.get_message(&reply.id).await
    }
}
