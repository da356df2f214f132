//! WebSocket handlers for real-time updates
//!
//! Exposes the change feed of one conversation to remote clients. Every
//! durable insert is pushed as a JSON frame; a disconnect frame tells the
//! client to reload the history. Supports ping/pong for connection keepalive.

use crate::api::utils::RouterState;
use crate::chat::{ChangeFeed, FeedEvent};
use crate::error::ChatError;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket message types for real-time communication
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum WebSocketMessage {
    /// A message was durably appended to the conversation
    #[serde(rename = "message_inserted")]
    MessageInserted {
        /// The stored message
        message: crate::chat::Message,
    },
    /// The server-side subscription stopped; reload with a list call
    #[serde(rename = "feed_disconnected")]
    FeedDisconnected {
        /// Why the feed stopped
        reason: String,
    },
    /// Ping message for connection keepalive
    #[serde(rename = "ping")]
    Ping,
    /// Pong message responding to ping
    #[serde(rename = "pong")]
    Pong,
}

impl From<FeedEvent> for WebSocketMessage {
    fn from(event: FeedEvent) -> Self {
        match event {
            FeedEvent::Inserted(message) => WebSocketMessage::MessageInserted { message },
            FeedEvent::Disconnected(reason) => WebSocketMessage::FeedDisconnected { reason },
        }
    }
}

/// GET /ws/conversations/:id - Follow a conversation's inserts
pub async fn conversation_feed_handler(
    ws: WebSocketUpgrade,
    State((chat_db, feed, _)): State<RouterState>,
    Path(conversation_id): Path<String>,
) -> Result<Response, ChatError> {
    if chat_db.get_conversation(&conversation_id).await?.is_none() {
        return Err(ChatError::ConversationNotFound(conversation_id));
    }
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, feed, conversation_id)))
}

async fn handle_socket<F>(socket: WebSocket, feed: F, conversation_id: String)
where
    F: ChangeFeed + 'static,
{
    let (mut sender, mut receiver) = socket.split();

    let (sink, events) = mpsc::unbounded_channel();
    let handle = match feed.subscribe(&conversation_id, sink).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(conversation_id = %conversation_id, error = %e, "Feed subscribe failed");
            let frame = WebSocketMessage::FeedDisconnected {
                reason: e.to_string(),
            };
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = sender.send(WsMessage::Text(text)).await;
            }
            return;
        }
    };

    info!(conversation_id = %conversation_id, "WebSocket client subscribed");

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    // Forward queued frames to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sender.send(msg).await {
                debug!("Failed to send frame: {}", e);
                break;
            }
        }
    });

    // Feed events become JSON frames
    let feed_tx = tx.clone();
    let mut feed_task = tokio::spawn(async move {
        let mut events = UnboundedReceiverStream::new(events);
        while let Some(event) = events.next().await {
            let last = matches!(event, FeedEvent::Disconnected(_));
            match serde_json::to_string(&WebSocketMessage::from(event)) {
                Ok(text) => {
                    if feed_tx.send(WsMessage::Text(text)).is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to serialize feed event: {}", e),
            }
            if last {
                break;
            }
        }
    });

    let ping_tx = tx.clone();
    let mut ping_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(PING_INTERVAL).await;
            if ping_tx.send(WsMessage::Ping(vec![])).is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => {
                    match serde_json::from_str::<WebSocketMessage>(&text) {
                        Ok(WebSocketMessage::Ping) => {
                            if let Ok(pong) = serde_json::to_string(&WebSocketMessage::Pong) {
                                if tx.send(WsMessage::Text(pong)).is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(other) => warn!("Received unhandled WebSocket message: {:?}", other),
                        Err(_) => debug!("Ignoring malformed WebSocket frame"),
                    }
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket error: {}", e);
                    break;
                }
            }
        }
    });

    // Whichever side finishes first tears the others down
    tokio::select! {
        _ = &mut send_task => {}
        _ = &mut feed_task => {
            // Let the disconnect frame reach the client before closing
            let _ = tokio::time::timeout(Duration::from_secs(1), &mut send_task).await;
        }
        _ = &mut ping_task => {}
        _ = &mut recv_task => {}
    }
    send_task.abort();
    feed_task.abort();
    ping_task.abort();
    recv_task.abort();

    feed.unsubscribe(&handle);
    info!(conversation_id = %conversation_id, "WebSocket connection closed");
}
