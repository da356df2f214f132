//! Conversation Relay Library
//!
//! Real-time conversation delivery: a durable message store, an in-process
//! change feed, an external gateway relay for anonymous visitors and the
//! client-side sessions that keep a consistent view of a conversation.
//! The server binary is in `src/main.rs`.

pub mod api;
pub mod chat;
pub mod config;
pub mod error;
pub mod session;
pub mod websocket;
