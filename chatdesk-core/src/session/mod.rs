//! Chat session lifecycle.
//!
//! Every inbound message is attached to the conversation's active session.
//! A session idle for longer than the configured timeout is closed and a
//! fresh one is opened in its place.

mod lifecycle;
mod locks;

pub use lifecycle::{SessionAttachment, SessionLifecycle, SessionOutcome};
pub use locks::ConversationLocks;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::db::{ChatSession, Message, NewMessage};
use crate::error::Result;

/// Persistence for sessions and the messages attached to them.
///
/// Implementations scope every query by conversation and keep at most one
/// active session per conversation at the storage level.
pub trait SessionStore: Send + Sync {
    /// Most recently interacted-with active session of a conversation.
    fn latest_active_session(&self, conversation_id: i64) -> Result<Option<ChatSession>>;

    /// A session of the given conversation; `None` if it belongs elsewhere.
    fn get_session(&self, conversation_id: i64, session_id: i64) -> Result<Option<ChatSession>>;

    /// All sessions of a conversation, newest first.
    fn list_sessions(&self, conversation_id: i64) -> Result<Vec<ChatSession>>;

    /// Insert a new active session. Fails with a unique violation if the
    /// conversation already has one.
    fn create_session(
        &self,
        conversation_id: i64,
        metadata: &Map<String, Value>,
        at: DateTime<Utc>,
    ) -> Result<ChatSession>;

    /// Move `last_interaction_at` forward. `Conflict` if the session was
    /// closed in the meantime; closed sessions are never touched.
    fn touch_session(&self, session_id: i64, at: DateTime<Utc>) -> Result<ChatSession>;

    /// Close an active session; `Conflict` if it is already closed.
    fn close_session(&self, session_id: i64, at: DateTime<Utc>) -> Result<ChatSession>;

    /// Merge `patch` into the metadata map atomically; null values remove
    /// keys. Allowed on closed sessions.
    fn merge_session_metadata(
        &self,
        session_id: i64,
        patch: &Map<String, Value>,
        at: DateTime<Utc>,
    ) -> Result<ChatSession>;

    /// Persist a message on an active session; `Conflict` if it was closed.
    fn insert_message(
        &self,
        session: &ChatSession,
        message: &NewMessage,
        at: DateTime<Utc>,
    ) -> Result<Message>;

    /// Messages of a session in insertion order.
    fn session_messages(&self, session_id: i64) -> Result<Vec<Message>>;
}
