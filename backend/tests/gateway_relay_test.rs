//! Tests for GatewayRelay against scripted gateway processes
#![cfg(unix)]

use conversation_relay::chat::{
    BridgeRelay, ChatDb, ConversationStore, DeliveryState, FeedHub, GatewayRelay, Message,
};
use conversation_relay::config::{BridgeConfig, PollingConfig, SessionConfig};
use conversation_relay::error::ChatError;
use conversation_relay::session::{PollingWatcher, SessionDeps, WatcherState};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Accepts every relay and always reports the same operator reply
const ANSWERING_GATEWAY: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"type":"relay"'*) echo '{"status":"success","data":null}' ;;
    *'"type":"latest_reply"'*) echo '{"status":"success","data":{"id":"op-reply-1","body":"Hola, soy el operador","created_at":4102444800000}}' ;;
    *) echo '{"status":"error","message":"unknown request"}' ;;
  esac
done
"#;

/// Accepts relays but has no reply yet
const SILENT_GATEWAY: &str = r#"
while IFS= read -r line; do
  echo '{"status":"success","data":null}'
done
"#;

/// Refuses everything
const REFUSING_GATEWAY: &str = r#"
while IFS= read -r line; do
  echo '{"status":"error","message":"channel offline"}'
done
"#;

/// Takes two seconds to answer reply polls and refuses every relay
const SLOW_REFUSING_GATEWAY: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"type":"latest_reply"'*) sleep 2; echo '{"status":"success","data":null}' ;;
    *) echo '{"status":"error","message":"channel offline"}' ;;
  esac
done
"#;

fn gateway(script: &str) -> BridgeConfig {
    BridgeConfig {
        gateway_command: "sh".to_string(),
        gateway_args: vec!["-c".to_string(), script.to_string()],
        operator_label: "operator".to_string(),
    }
}

async fn setup(config: BridgeConfig) -> (Arc<ChatDb>, Arc<GatewayRelay>, TempDir) {
    setup_with_timeout(config, Duration::from_secs(5)).await
}

async fn setup_with_timeout(
    config: BridgeConfig,
    request_timeout: Duration,
) -> (Arc<ChatDb>, Arc<GatewayRelay>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("relay.db");
    let chat_db = Arc::new(
        ChatDb::new(db_path.to_str().unwrap())
            .await
            .expect("Failed to create test database")
            .with_feed(FeedHub::default()),
    );
    let relay = Arc::new(GatewayRelay::new(chat_db.clone(), config, request_timeout));
    (chat_db, relay, temp_dir)
}

fn visitor_message(conversation_id: &str, body: &str) -> Message {
    Message::optimistic(conversation_id, Some("Visitante".to_string()), body.to_string())
}

#[tokio::test]
async fn test_relay_stores_then_forwards() {
    let (chat_db, relay, _temp_dir) = setup(gateway(SILENT_GATEWAY)).await;
    let conv = relay.create_bridged_conversation("Visitante").await.unwrap();
    assert_eq!(conv.participant_a, "operator");

    let ack = relay
        .relay(&conv.id, &visitor_message(&conv.id, "Hola"))
        .await
        .unwrap();
    assert!(!ack.message.is_local());
    assert_eq!(ack.message.sender_id.as_deref(), Some("Visitante"));
    assert_eq!(chat_db.list(&conv.id).await.unwrap(), vec![ack.message]);
    assert_eq!(relay.session_count().await, 1);

    assert_eq!(relay.fetch_latest_reply(&conv.id).await.unwrap(), None);
    relay.kill_all_sessions().await;
    assert_eq!(relay.session_count().await, 0);
}

#[tokio::test]
async fn test_repeated_fetch_stores_reply_once() {
    let (chat_db, relay, _temp_dir) = setup(gateway(ANSWERING_GATEWAY)).await;
    let conv = relay.create_bridged_conversation("Visitante").await.unwrap();

    let first = relay.fetch_latest_reply(&conv.id).await.unwrap().unwrap();
    let second = relay.fetch_latest_reply(&conv.id).await.unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.id, "op-reply-1");
    assert!(first.sender_id.is_none());

    let stored = chat_db.list(&conv.id).await.unwrap();
    assert_eq!(stored.len(), 1);
    relay.kill_all_sessions().await;
}

#[tokio::test]
async fn test_gateway_error_is_bridge_relay_failed() {
    let (_chat_db, relay, _temp_dir) = setup(gateway(REFUSING_GATEWAY)).await;
    let conv = relay.create_bridged_conversation("Visitante").await.unwrap();

    let err = relay
        .relay(&conv.id, &visitor_message(&conv.id, "Hola"))
        .await
        .unwrap_err();
    match err {
        ChatError::BridgeRelayFailed(reason) => assert_eq!(reason, "channel offline"),
        other => panic!("expected BridgeRelayFailed, got {:?}", other),
    }
    relay.kill_all_sessions().await;
}

#[tokio::test]
async fn test_missing_gateway_binary() {
    let config = BridgeConfig {
        gateway_command: "/nonexistent/gateway-binary".to_string(),
        gateway_args: Vec::new(),
        operator_label: "operator".to_string(),
    };
    let (_chat_db, relay, _temp_dir) = setup(config).await;
    let conv = relay.create_bridged_conversation("Visitante").await.unwrap();

    let result = relay.relay(&conv.id, &visitor_message(&conv.id, "Hola")).await;
    assert!(matches!(result, Err(ChatError::BridgeRelayFailed(_))));
}

#[tokio::test]
async fn test_push_conversation_cannot_be_relayed() {
    let (chat_db, relay, _temp_dir) = setup(gateway(SILENT_GATEWAY)).await;
    let conv = chat_db.lookup_or_create("alice", "bob", None).await.unwrap();

    let result = relay.relay(&conv.id, &visitor_message(&conv.id, "Hola")).await;
    assert!(matches!(result, Err(ChatError::InvalidInput(_))));

    let result = relay.fetch_latest_reply("nonexistent").await;
    assert!(matches!(result, Err(ChatError::ConversationNotFound(_))));
}

#[tokio::test]
async fn test_watcher_end_to_end_with_gateway() {
    let (chat_db, relay, _temp_dir) = setup(gateway(ANSWERING_GATEWAY)).await;
    let deps = SessionDeps::new(chat_db.clone(), Arc::new(FeedHub::default()));
    let polling = PollingConfig {
        interval: Duration::from_millis(50),
        max_wait: None,
    };

    let watcher = PollingWatcher::start(
        "Visitante",
        deps,
        relay.clone(),
        SessionConfig::default(),
        polling,
    )
    .await
    .unwrap();

    watcher.send("Hola").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while watcher.state() != WatcherState::Idle {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("watcher should merge the reply");

    let bodies: Vec<_> = watcher.messages().into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, vec!["Hola", "Hola, soy el operador"]);

    let conv_id = watcher.session().conversation().id.clone();
    assert_eq!(chat_db.list(&conv_id).await.unwrap().len(), 2);

    watcher.close();
    relay.kill_all_sessions().await;
}

#[tokio::test]
async fn test_refused_message_is_never_stored() {
    let (chat_db, relay, _temp_dir) = setup(gateway(REFUSING_GATEWAY)).await;
    let deps = SessionDeps::new(chat_db.clone(), Arc::new(FeedHub::default()));
    let watcher = PollingWatcher::start(
        "Visitante",
        deps,
        relay.clone(),
        SessionConfig::default(),
        PollingConfig::default(),
    )
    .await
    .unwrap();
    let conv_id = watcher.session().conversation().id.clone();

    let result = watcher.send("Hola").await;
    assert!(matches!(result, Err(ChatError::BridgeRelayFailed(_))));
    let local_id = watcher.messages()[0].id.clone();
    assert_eq!(watcher.messages()[0].delivery_state, DeliveryState::Failed);

    let result = watcher.resend(&local_id).await;
    assert!(matches!(result, Err(ChatError::BridgeRelayFailed(_))));

    assert!(chat_db.list(&conv_id).await.unwrap().is_empty());
    assert_eq!(watcher.state(), WatcherState::Idle);
    watcher.close();
    relay.kill_all_sessions().await;
}

#[tokio::test]
async fn test_resubmitted_message_is_stored_once() {
    let (chat_db, relay, _temp_dir) = setup(gateway(SILENT_GATEWAY)).await;
    let conv = relay.create_bridged_conversation("Visitante").await.unwrap();
    let message = visitor_message(&conv.id, "Hola");

    let first = relay.relay(&conv.id, &message).await.unwrap();
    let second = relay.relay(&conv.id, &message).await.unwrap();
    assert_eq!(first.message, second.message);
    assert_eq!(chat_db.list(&conv.id).await.unwrap().len(), 1);
    relay.kill_all_sessions().await;
}

#[tokio::test]
async fn test_late_answer_is_not_taken_for_the_next_request() {
    let (chat_db, relay, _temp_dir) =
        setup_with_timeout(gateway(SLOW_REFUSING_GATEWAY), Duration::from_millis(500)).await;
    let conv = relay.create_bridged_conversation("Visitante").await.unwrap();

    let fetched = relay.fetch_latest_reply(&conv.id).await;
    assert!(matches!(fetched, Err(ChatError::BridgeRelayFailed(_))));

    let err = relay
        .relay(&conv.id, &visitor_message(&conv.id, "Hola"))
        .await
        .unwrap_err();
    match err {
        ChatError::BridgeRelayFailed(reason) => assert_eq!(reason, "channel offline"),
        other => panic!("expected BridgeRelayFailed, got {:?}", other),
    }
    assert!(chat_db.list(&conv.id).await.unwrap().is_empty());
    relay.kill_all_sessions().await;
}
