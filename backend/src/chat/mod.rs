//! Chat module
//!
//! Conversation and message storage (SQLite), the in-process change feed,
//! the external gateway relay and the contracts sessions consume.

pub mod bridge_manager;
pub mod bridge_session;
pub mod db;
pub mod feed;
pub mod mock;
pub mod models;
pub mod retry;
pub mod traits;

pub use bridge_manager::GatewayRelay;
pub use bridge_session::GatewaySession;
pub use db::ChatDb;
pub use feed::FeedHub;
pub use models::{Conversation, ConversationMode, DeliveryState, Message};
pub use traits::{BridgeRelay, ChangeFeed, ConversationStore, FeedEvent, FeedSink, RelayAck, SubscriptionHandle};
