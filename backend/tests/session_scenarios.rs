//! End-to-end behaviour of conversation sessions and the polling watcher

use conversation_relay::chat::mock::{MockFeed, MockRelay, MockStore};
use conversation_relay::chat::{
    ChatDb, Conversation, ConversationStore, DeliveryState, FeedHub, Message,
};
use conversation_relay::config::{PollingConfig, SessionConfig};
use conversation_relay::session::{
    ConversationSession, PollingWatcher, SessionDeps, SessionStatus, WatcherState,
};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn session_config() -> SessionConfig {
    SessionConfig {
        request_timeout: Duration::from_secs(10),
        max_retries: 1,
        retry_backoff: Duration::from_millis(10),
        resync_interval: Duration::from_secs(5),
    }
}

fn push_conversation() -> Conversation {
    Conversation::new(
        "conv-1".to_string(),
        "alice".to_string(),
        "bob".to_string(),
        Some("project-42".to_string()),
    )
}

fn message(id: &str, sender: &str, created_at: i64) -> Message {
    Message::new(
        id.to_string(),
        "conv-1".to_string(),
        Some(sender.to_string()),
        format!("body of {}", id),
        created_at,
    )
}

async fn open_mocked(participant: &str) -> (ConversationSession, Arc<MockStore>, Arc<MockFeed>) {
    let store = Arc::new(MockStore::new());
    let feed = Arc::new(MockFeed::new());
    let conversation = push_conversation();
    store.add_conversation(conversation.clone());
    let session = ConversationSession::open(
        conversation,
        participant,
        SessionDeps::new(store.clone(), feed.clone()),
        session_config(),
    )
    .await
    .unwrap();
    (session, store, feed)
}

fn ids(session: &ConversationSession) -> Vec<String> {
    session.messages().into_iter().map(|m| m.id).collect()
}

#[tokio::test]
async fn repeated_merges_keep_each_id_once() {
    let (session, _, _) = open_mocked("carol").await;
    let pool = [message("m1", "alice", 1), message("m2", "bob", 2), message("m3", "alice", 3)];

    for i in [0, 1, 0, 2, 2, 1, 0, 2] {
        session.merge(pool[i].clone());
    }

    assert_eq!(ids(&session), vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn order_follows_created_at_not_arrival() {
    let (session, _, _) = open_mocked("carol").await;

    session.merge(message("late", "alice", 300));
    session.merge(message("zeta", "bob", 100));
    session.merge(message("early", "bob", 50));
    session.merge(message("alpha", "alice", 100));

    assert_eq!(ids(&session), vec!["early", "alpha", "zeta", "late"]);
}

#[tokio::test]
async fn send_is_visible_before_the_store_answers() {
    let (session, store, _) = open_mocked("alice").await;
    store.hold_appends();
    let mut changes = session.subscribe_changes();

    let sender = session.clone();
    let pending = tokio::spawn(async move { sender.send("Hello").await });

    let visible = changes.wait_for(|m| !m.is_empty()).await.unwrap().clone();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].body, "Hello");
    assert_eq!(visible[0].delivery_state, DeliveryState::Pending);
    assert!(store.stored().is_empty());

    store.release_appends(1);
    let stored = pending.await.unwrap().unwrap();
    assert_eq!(ids(&session), vec![stored.id]);
}

#[tokio::test(start_paused = true)]
async fn closed_session_ignores_feed_and_timer() {
    let (session, _, feed) = open_mocked("bob").await;
    session.close();

    assert_eq!(feed.deliver_insert(&message("m1", "alice", 1)), 0);
    assert!(session.messages().is_empty());
    assert_eq!(session.status(), SessionStatus::Closed);

    let relay = Arc::new(MockRelay::new());
    let watcher = PollingWatcher::start(
        "Visitante",
        SessionDeps::new(Arc::new(MockStore::new()), Arc::new(MockFeed::new())),
        relay.clone(),
        session_config(),
        PollingConfig::default(),
    )
    .await
    .unwrap();
    let conv_id = watcher.session().conversation().id.clone();
    relay.script_replies([Some(Message::new(
        "r1".into(),
        conv_id,
        None,
        "late reply".into(),
        i64::MAX,
    ))]);

    watcher.send("Hola").await.unwrap();
    let before = watcher.messages();
    watcher.close();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(watcher.messages(), before);
    assert_eq!(relay.fetch_calls(), 0);
}

#[tokio::test]
async fn concurrent_lookup_or_create_returns_one_conversation() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("lookup.db");
    let chat_db = Arc::new(ChatDb::new(db_path.to_str().unwrap()).await.unwrap());

    let calls = (0..6).map(|_| {
        let chat_db = chat_db.clone();
        async move {
            chat_db
                .lookup_or_create("alice", "bob", Some("project-42"))
                .await
                .unwrap()
        }
    });
    let conversations = join_all(calls).await;

    let first = &conversations[0].id;
    assert!(conversations.iter().all(|c| &c.id == first));
}

#[tokio::test]
async fn redelivered_insert_renders_once() {
    let (bob, _, feed) = open_mocked("bob").await;
    let mut changes = bob.subscribe_changes();

    let hello = Message::new(
        "store-hello".to_string(),
        "conv-1".to_string(),
        Some("alice".to_string()),
        "Hello".to_string(),
        0,
    );
    feed.deliver_insert(&hello);
    feed.deliver_insert(&hello);
    feed.deliver_insert(&message("marker", "alice", 1));

    changes.wait_for(|m| m.len() == 2).await.unwrap();
    let hellos = bob.messages().into_iter().filter(|m| m.body == "Hello").count();
    assert_eq!(hellos, 1);
}

#[tokio::test(start_paused = true)]
async fn visitor_sees_question_and_reply_after_third_tick() {
    let relay = Arc::new(MockRelay::new());
    let watcher = PollingWatcher::start(
        "Visitante",
        SessionDeps::new(Arc::new(MockStore::new()), Arc::new(MockFeed::new())),
        relay.clone(),
        session_config(),
        PollingConfig {
            interval: Duration::from_secs(2),
            max_wait: None,
        },
    )
    .await
    .unwrap();
    let conv_id = watcher.session().conversation().id.clone();
    let reply = Message::new(
        "operator-reply".into(),
        conv_id,
        None,
        "Hola, ¿en qué puedo ayudarte?".into(),
        i64::MAX,
    );
    relay.script_replies([None, None, Some(reply)]);

    watcher.send("Necesito ayuda").await.unwrap();

    tokio::time::sleep(Duration::from_millis(4_500)).await;
    assert_eq!(relay.fetch_calls(), 2);
    assert_eq!(watcher.state(), WatcherState::Awaiting);
    assert_eq!(watcher.messages().len(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(relay.fetch_calls(), 3);
    assert_eq!(watcher.state(), WatcherState::Idle);
    let bodies: Vec<_> = watcher.messages().into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, vec!["Necesito ayuda", "Hola, ¿en qué puedo ayudarte?"]);
}

#[tokio::test]
async fn own_echo_is_not_rendered_twice() {
    let (alice, _, feed) = open_mocked("alice").await;
    let stored = alice.send("Hello").await.unwrap();

    feed.deliver_insert(&stored);
    feed.deliver_insert(&message("from-bob", "bob", stored.created_at + 1));

    let mut changes = alice.subscribe_changes();
    changes.wait_for(|m| m.len() == 2).await.unwrap();
    let own = alice.messages().into_iter().filter(|m| m.is_from("alice")).count();
    assert_eq!(own, 1);
}

#[tokio::test]
async fn two_live_sessions_converge_over_sqlite_and_feed() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("live.db");
    let feed = FeedHub::default();
    let chat_db = Arc::new(
        ChatDb::new(db_path.to_str().unwrap())
            .await
            .unwrap()
            .with_feed(feed.clone()),
    );
    let conversation = chat_db
        .lookup_or_create("alice", "bob", Some("project-42"))
        .await
        .unwrap();
    let deps = SessionDeps::new(chat_db.clone(), Arc::new(feed.clone()));

    let alice = ConversationSession::open(conversation.clone(), "alice", deps.clone(), session_config())
        .await
        .unwrap();
    let bob = ConversationSession::open(conversation.clone(), "bob", deps, session_config())
        .await
        .unwrap();
    assert_eq!(feed.subscriber_count(), 2);

    let mut bob_changes = bob.subscribe_changes();
    let mut alice_changes = alice.subscribe_changes();
    alice.send("Hello").await.unwrap();
    bob_changes.wait_for(|m| m.len() == 1).await.unwrap();
    bob.send("Hi Alice").await.unwrap();
    alice_changes.wait_for(|m| m.len() == 2).await.unwrap();

    assert_eq!(alice.messages(), bob.messages());
    assert_eq!(alice.messages(), chat_db.list(&conversation.id).await.unwrap());

    alice.close();
    bob.close();
    assert_eq!(feed.subscriber_count(), 0);
}
