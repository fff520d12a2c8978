//! Resolve-or-create logic for chat sessions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use super::{ConversationLocks, SessionStore};
use crate::config::SessionConfig;
use crate::db::{ChatSession, Message, NewMessage};
use crate::error::{Error, Result};

/// Resolve attempts before giving up on a conversation whose sessions keep
/// being closed underneath us.
const MAX_ATTACH_ATTEMPTS: usize = 3;

/// How the session for a message was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The active session was still inside the idle window.
    Reused,
    /// The conversation had no active session.
    Created,
    /// The active session had gone idle and was replaced.
    RolledOver { closed_session_id: i64 },
}

/// A persisted message together with the session it was attached to.
#[derive(Debug, Clone, Serialize)]
pub struct SessionAttachment {
    pub message: Message,
    pub session: ChatSession,
    pub outcome: SessionOutcome,
}

/// Session lifecycle manager.
pub struct SessionLifecycle {
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
    locks: ConversationLocks,
}

impl SessionLifecycle {
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        Self {
            store,
            config,
            locks: ConversationLocks::new(),
        }
    }

    /// Create with the default 12 hour idle window.
    pub fn with_defaults(store: Arc<dyn SessionStore>) -> Self {
        Self::new(store, SessionConfig::default())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Attach an inbound message to the conversation's session, rolling the
    /// session over when it has been idle longer than the timeout.
    pub async fn attach_message_to_session(
        &self,
        message: NewMessage,
        conversation_id: i64,
    ) -> Result<SessionAttachment> {
        self.attach_message_at(message, conversation_id, Utc::now()).await
    }

    /// Same as [`attach_message_to_session`](Self::attach_message_to_session)
    /// with an explicit clock.
    pub async fn attach_message_at(
        &self,
        message: NewMessage,
        conversation_id: i64,
        now: DateTime<Utc>,
    ) -> Result<SessionAttachment> {
        let _guard = self.locks.acquire(conversation_id).await;

        let mut attempt = 1;
        loop {
            let (session, outcome) = self.resolve_session(conversation_id, now)?;
            match self.store.insert_message(&session, &message, now) {
                Ok(message) => {
                    return Ok(SessionAttachment {
                        message,
                        session,
                        outcome,
                    });
                }
                // Closed by another writer between resolve and insert.
                Err(e) if e.is_conflict() && attempt < MAX_ATTACH_ATTEMPTS => {
                    debug!(
                        conversation_id = conversation_id,
                        session_id = session.id,
                        attempt = attempt,
                        "Session closed before message insert, resolving again"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn resolve_session(&self, conversation_id: i64, now: DateTime<Utc>) -> Result<(ChatSession, SessionOutcome)> {
        let mut closed_session_id = None;

        if let Some(current) = self.store.latest_active_session(conversation_id)? {
            let idle = now - current.last_interaction_at;
            if idle <= self.config.idle_timeout() {
                match self.store.touch_session(current.id, now) {
                    Ok(session) => {
                        debug!(
                            conversation_id = conversation_id,
                            session_id = session.id,
                            idle_minutes = idle.num_minutes(),
                            "Reusing active chat session"
                        );
                        return Ok((session, SessionOutcome::Reused));
                    }
                    // Closed by another writer after we read it; open a new one.
                    Err(e) if e.is_conflict() => {
                        debug!(
                            conversation_id = conversation_id,
                            session_id = current.id,
                            "Active session closed concurrently"
                        );
                    }
                    Err(e) => return Err(e),
                }
            } else {
                match self.store.close_session(current.id, now) {
                    Ok(_) => {
                        info!(
                            conversation_id = conversation_id,
                            session_id = current.id,
                            idle_minutes = idle.num_minutes(),
                            "Closed idle chat session"
                        );
                        closed_session_id = Some(current.id);
                    }
                    // Someone else already closed it.
                    Err(e) if e.is_conflict() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let session = match self.store.create_session(conversation_id, &Map::new(), now) {
            Ok(session) => session,
            // Another process opened a session between our read and insert.
            Err(e) if e.is_unique_violation() => {
                let session = self
                    .store
                    .latest_active_session(conversation_id)?
                    .ok_or(e)?;
                debug!(
                    conversation_id = conversation_id,
                    session_id = session.id,
                    "Lost session creation race, reusing winner"
                );
                let session = self.store.touch_session(session.id, now)?;
                return Ok((session, SessionOutcome::Reused));
            }
            Err(e) => return Err(e),
        };

        info!(
            conversation_id = conversation_id,
            session_id = session.id,
            "Opened chat session"
        );

        let outcome = match closed_session_id {
            Some(closed_session_id) => SessionOutcome::RolledOver { closed_session_id },
            None => SessionOutcome::Created,
        };
        Ok((session, outcome))
    }

    /// Current active session of a conversation, if any.
    pub fn active_session(&self, conversation_id: i64) -> Result<Option<ChatSession>> {
        self.store.latest_active_session(conversation_id)
    }

    pub fn list_sessions(&self, conversation_id: i64) -> Result<Vec<ChatSession>> {
        self.store.list_sessions(conversation_id)
    }

    /// Messages of a session of the conversation, in creation order.
    pub fn session_messages(&self, conversation_id: i64, session_id: i64) -> Result<Vec<Message>> {
        self.require_session(conversation_id, session_id)?;
        self.store.session_messages(session_id)
    }

    /// Close a session explicitly, e.g. when an operator resolves the conversation.
    pub async fn close_session(&self, conversation_id: i64, session_id: i64) -> Result<ChatSession> {
        let _guard = self.locks.acquire(conversation_id).await;
        self.require_session(conversation_id, session_id)?;

        let closed = self.store.close_session(session_id, Utc::now())?;
        info!(
            conversation_id = closed.conversation_id,
            session_id = closed.id,
            "Closed chat session on request"
        );
        Ok(closed)
    }

    /// Merge `patch` into the session metadata. Null values remove keys.
    pub async fn update_metadata(
        &self,
        conversation_id: i64,
        session_id: i64,
        patch: Map<String, Value>,
    ) -> Result<ChatSession> {
        let _guard = self.locks.acquire(conversation_id).await;
        self.require_session(conversation_id, session_id)?;
        self.store.merge_session_metadata(session_id, &patch, Utc::now())
    }

    fn require_session(&self, conversation_id: i64, session_id: i64) -> Result<ChatSession> {
        self.store
            .get_session(conversation_id, session_id)?
            .ok_or_else(|| Error::not_found("ChatSession", session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, MessageSender, SessionStatus};
    use chrono::Duration;

    fn setup() -> (Arc<Database>, SessionLifecycle) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let lifecycle = SessionLifecycle::with_defaults(db.clone());
        (db, lifecycle)
    }

    fn msg(text: &str) -> NewMessage {
        NewMessage::new(MessageSender::User, text)
    }

    #[tokio::test]
    async fn test_first_message_creates_session() {
        let (_db, lifecycle) = setup();

        let attached = lifecycle.attach_message_to_session(msg("hola"), 42).await.unwrap();

        assert_eq!(attached.outcome, SessionOutcome::Created);
        assert_eq!(attached.session.conversation_id, 42);
        assert_eq!(attached.session.status, SessionStatus::Active);
        assert!(attached.session.metadata.is_empty());
        assert_eq!(attached.message.chat_session_id, attached.session.id);
        assert_eq!(attached.message.content, "hola");
    }

    #[tokio::test]
    async fn test_message_within_window_reuses_session() {
        let (_db, lifecycle) = setup();
        let start = Utc::now();

        let first = lifecycle.attach_message_at(msg("hola"), 42, start).await.unwrap();
        let later = start + Duration::minutes(30);
        let second = lifecycle.attach_message_at(msg("sigo aquí"), 42, later).await.unwrap();

        assert_eq!(second.outcome, SessionOutcome::Reused);
        assert_eq!(second.session.id, first.session.id);
        assert_eq!(
            second.session.last_interaction_at.timestamp_millis(),
            later.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_idle_exactly_at_timeout_reuses_session() {
        let (_db, lifecycle) = setup();
        let start = Utc::now();

        let first = lifecycle.attach_message_at(msg("a"), 42, start).await.unwrap();
        let boundary = start + Duration::minutes(720);
        let second = lifecycle.attach_message_at(msg("b"), 42, boundary).await.unwrap();

        assert_eq!(second.outcome, SessionOutcome::Reused);
        assert_eq!(second.session.id, first.session.id);
    }

    #[tokio::test]
    async fn test_one_minute_over_timeout_rolls_over() {
        let (db, lifecycle) = setup();
        let start = Utc::now();

        let first = lifecycle.attach_message_at(msg("a"), 42, start).await.unwrap();
        let over = start + Duration::minutes(721);
        let second = lifecycle.attach_message_at(msg("b"), 42, over).await.unwrap();

        assert_eq!(
            second.outcome,
            SessionOutcome::RolledOver {
                closed_session_id: first.session.id
            }
        );
        assert_ne!(second.session.id, first.session.id);

        let old = db.get_session(42, first.session.id).unwrap().unwrap();
        assert_eq!(old.status, SessionStatus::Closed);
        assert_eq!(old.closed_at.unwrap().timestamp_millis(), over.timestamp_millis());
    }

    #[tokio::test]
    async fn test_session_idle_800_minutes_is_replaced() {
        let (db, lifecycle) = setup();
        let now = Utc::now();
        let stale = db
            .create_session(42, &Map::new(), now - Duration::minutes(800))
            .unwrap();

        let attached = lifecycle.attach_message_at(msg("volví"), 42, now).await.unwrap();

        assert!(matches!(attached.outcome, SessionOutcome::RolledOver { closed_session_id } if closed_session_id == stale.id));
        assert!(attached.session.is_active());

        let stale = db.get_session(42, stale.id).unwrap().unwrap();
        assert_eq!(stale.status, SessionStatus::Closed);
        assert!(stale.closed_at.is_some());

        let active: Vec<_> = db
            .list_sessions(42)
            .unwrap()
            .into_iter()
            .filter(|s| s.is_active())
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, attached.session.id);
    }

    #[tokio::test]
    async fn test_custom_timeout_is_respected() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let lifecycle = SessionLifecycle::new(db, SessionConfig::with_idle_timeout(10).unwrap());
        let start = Utc::now();

        let first = lifecycle.attach_message_at(msg("a"), 7, start).await.unwrap();
        let second = lifecycle
            .attach_message_at(msg("b"), 7, start + Duration::minutes(11))
            .await
            .unwrap();
        assert_ne!(first.session.id, second.session.id);
    }

    #[tokio::test]
    async fn test_conversations_are_isolated() {
        let (_db, lifecycle) = setup();
        let a = lifecycle.attach_message_to_session(msg("a"), 1).await.unwrap();
        let b = lifecycle.attach_message_to_session(msg("b"), 2).await.unwrap();
        assert_ne!(a.session.id, b.session.id);
        assert_eq!(a.outcome, SessionOutcome::Created);
        assert_eq!(b.outcome, SessionOutcome::Created);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_attaches_keep_one_active_session() {
        let (db, lifecycle) = setup();
        let lifecycle = Arc::new(lifecycle);

        let mut handles = Vec::new();
        for i in 0..16 {
            let lifecycle = Arc::clone(&lifecycle);
            handles.push(tokio::spawn(async move {
                lifecycle
                    .attach_message_to_session(msg(&format!("m{}", i)), 42)
                    .await
                    .unwrap()
            }));
        }

        let mut session_ids = Vec::new();
        for handle in handles {
            session_ids.push(handle.await.unwrap().session.id);
        }
        session_ids.dedup();
        assert_eq!(session_ids.len(), 1);

        let sessions = db.list_sessions(42).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(db.session_messages(sessions[0].id).unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_separate_managers_share_active_session() {
        let (db, lifecycle) = setup();
        let other = SessionLifecycle::with_defaults(db.clone());
        let now = Utc::now();

        let mine = lifecycle.attach_message_at(msg("a"), 42, now).await.unwrap();
        let theirs = other.attach_message_at(msg("b"), 42, now).await.unwrap();
        assert_eq!(mine.session.id, theirs.session.id);
        assert_eq!(theirs.outcome, SessionOutcome::Reused);
    }

    /// Interleaves another writer's action with the store calls made while
    /// resolving a session.
    #[derive(Clone, Copy)]
    enum Race {
        /// Hide the active session from the first lookup, as if another
        /// process inserted it right after we read.
        HideActiveOnce,
        /// Close the active session right after the first lookup returns it.
        CloseAfterRead,
        /// Write `channel` into the metadata right before our merge runs.
        WriteBeforeMerge,
    }

    struct RacingStore {
        inner: Arc<Database>,
        race: Race,
        fired: std::sync::atomic::AtomicBool,
    }

    impl RacingStore {
        fn new(inner: Arc<Database>, race: Race) -> Arc<Self> {
            Arc::new(Self {
                inner,
                race,
                fired: std::sync::atomic::AtomicBool::new(false),
            })
        }

        fn fire_once(&self) -> bool {
            !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl SessionStore for RacingStore {
        fn latest_active_session(&self, conversation_id: i64) -> Result<Option<ChatSession>> {
            match self.race {
                Race::HideActiveOnce if self.fire_once() => Ok(None),
                Race::CloseAfterRead => {
                    let current = self.inner.latest_active_session(conversation_id)?;
                    if let Some(session) = &current {
                        if self.fire_once() {
                            self.inner.close_session(session.id, Utc::now())?;
                        }
                    }
                    Ok(current)
                }
                _ => self.inner.latest_active_session(conversation_id),
            }
        }
        fn get_session(&self, conversation_id: i64, session_id: i64) -> Result<Option<ChatSession>> {
            self.inner.get_session(conversation_id, session_id)
        }
        fn list_sessions(&self, conversation_id: i64) -> Result<Vec<ChatSession>> {
            self.inner.list_sessions(conversation_id)
        }
        fn create_session(&self, conversation_id: i64, metadata: &Map<String, Value>, at: DateTime<Utc>) -> Result<ChatSession> {
            self.inner.create_session(conversation_id, metadata, at)
        }
        fn touch_session(&self, session_id: i64, at: DateTime<Utc>) -> Result<ChatSession> {
            self.inner.touch_session(session_id, at)
        }
        fn close_session(&self, session_id: i64, at: DateTime<Utc>) -> Result<ChatSession> {
            self.inner.close_session(session_id, at)
        }
        fn merge_session_metadata(&self, session_id: i64, patch: &Map<String, Value>, at: DateTime<Utc>) -> Result<ChatSession> {
            if matches!(self.race, Race::WriteBeforeMerge) && self.fire_once() {
                let mut other = Map::new();
                other.insert("channel".into(), Value::from("whatsapp"));
                self.inner.merge_session_metadata(session_id, &other, at)?;
            }
            self.inner.merge_session_metadata(session_id, patch, at)
        }
        fn insert_message(&self, session: &ChatSession, message: &NewMessage, at: DateTime<Utc>) -> Result<Message> {
            self.inner.insert_message(session, message, at)
        }
        fn session_messages(&self, session_id: i64) -> Result<Vec<Message>> {
            self.inner.session_messages(session_id)
        }
    }

    #[tokio::test]
    async fn test_lost_creation_race_reuses_winner() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let winner = db.create_session(42, &Map::new(), Utc::now()).unwrap();

        let lifecycle = SessionLifecycle::with_defaults(RacingStore::new(db.clone(), Race::HideActiveOnce));

        let attached = lifecycle.attach_message_to_session(msg("a"), 42).await.unwrap();
        assert_eq!(attached.outcome, SessionOutcome::Reused);
        assert_eq!(attached.session.id, winner.id);
        assert_eq!(db.list_sessions(42).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_session_closed_after_read_is_not_reused() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let original = db.create_session(42, &Map::new(), Utc::now()).unwrap();

        let lifecycle = SessionLifecycle::with_defaults(RacingStore::new(db.clone(), Race::CloseAfterRead));

        let attached = lifecycle.attach_message_to_session(msg("hola"), 42).await.unwrap();
        assert_eq!(attached.outcome, SessionOutcome::Created);
        assert_ne!(attached.session.id, original.id);
        assert_eq!(attached.session.status, SessionStatus::Active);
        assert_eq!(attached.message.chat_session_id, attached.session.id);

        // The closed session stayed untouched
        assert!(db.session_messages(original.id).unwrap().is_empty());
        let original = db.get_session(42, original.id).unwrap().unwrap();
        assert_eq!(original.status, SessionStatus::Closed);
    }

    #[tokio::test]
    async fn test_metadata_merge_keeps_concurrent_write() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let session = db.create_session(42, &Map::new(), Utc::now()).unwrap();

        let lifecycle = SessionLifecycle::with_defaults(RacingStore::new(db.clone(), Race::WriteBeforeMerge));

        let mut patch = Map::new();
        patch.insert("tag".into(), Value::from("vip"));
        let updated = lifecycle.update_metadata(42, session.id, patch).await.unwrap();

        assert_eq!(updated.metadata.get("tag"), Some(&Value::from("vip")));
        assert_eq!(updated.metadata.get("channel"), Some(&Value::from("whatsapp")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_metadata_updates_keep_every_key() {
        let (_db, lifecycle) = setup();
        let lifecycle = Arc::new(lifecycle);
        let session_id = lifecycle.attach_message_to_session(msg("a"), 42).await.unwrap().session.id;

        let mut handles = Vec::new();
        for i in 0..16 {
            let lifecycle = Arc::clone(&lifecycle);
            handles.push(tokio::spawn(async move {
                let mut patch = Map::new();
                patch.insert(format!("key{}", i), Value::from(i));
                lifecycle.update_metadata(42, session_id, patch).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let session = lifecycle.active_session(42).unwrap().unwrap();
        assert_eq!(session.metadata.len(), 16);
    }

    #[tokio::test]
    async fn test_close_session_explicitly() {
        let (_db, lifecycle) = setup();
        let attached = lifecycle.attach_message_to_session(msg("a"), 42).await.unwrap();

        // Another conversation cannot reach the session
        let err = lifecycle.close_session(43, attached.session.id).await.unwrap_err();
        assert!(err.is_not_found());

        let closed = lifecycle.close_session(42, attached.session.id).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(lifecycle.active_session(42).unwrap().is_none());

        let err = lifecycle.close_session(42, attached.session.id).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(lifecycle.close_session(42, 999).await.unwrap_err().is_not_found());

        let next = lifecycle.attach_message_to_session(msg("b"), 42).await.unwrap();
        assert_eq!(next.outcome, SessionOutcome::Created);
    }

    #[tokio::test]
    async fn test_update_metadata_merges_and_removes() {
        let (_db, lifecycle) = setup();
        let attached = lifecycle.attach_message_to_session(msg("a"), 42).await.unwrap();

        let mut patch = Map::new();
        patch.insert("channel".into(), Value::from("whatsapp"));
        patch.insert("tag".into(), Value::from("vip"));
        lifecycle.update_metadata(42, attached.session.id, patch).await.unwrap();

        let mut patch = Map::new();
        patch.insert("tag".into(), Value::Null);
        let updated = lifecycle.update_metadata(42, attached.session.id, patch).await.unwrap();

        assert_eq!(updated.metadata.get("channel"), Some(&Value::from("whatsapp")));
        assert!(!updated.metadata.contains_key("tag"));
        assert!(lifecycle.update_metadata(42, 999, Map::new()).await.unwrap_err().is_not_found());
        assert!(
            lifecycle
                .update_metadata(7, attached.session.id, Map::new())
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_session_messages_requires_existing_session() {
        let (_db, lifecycle) = setup();
        let attached = lifecycle.attach_message_to_session(msg("a"), 42).await.unwrap();
        assert_eq!(lifecycle.session_messages(42, attached.session.id).unwrap().len(), 1);
        assert!(lifecycle.session_messages(42, 999).unwrap_err().is_not_found());
        assert!(lifecycle.session_messages(43, attached.session.id).unwrap_err().is_not_found());
    }
}
