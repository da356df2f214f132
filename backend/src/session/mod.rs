//! Client-side conversation sessions
//!
//! [`ConversationSession`] keeps one conversation's visible message list
//! consistent with the store. [`PollingWatcher`] drives bridged
//! conversations, where replies are polled instead of pushed.

pub mod conversation;
pub mod polling;
pub mod timeline;

pub use conversation::{ConversationSession, SessionDeps, SessionStatus};
pub use polling::{PollingWatcher, WatcherOutcome, WatcherState};
pub use timeline::{MergeOutcome, Timeline};
