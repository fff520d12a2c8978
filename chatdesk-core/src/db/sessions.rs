//! Chat session and message persistence.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde_json::{Map, Value};

use super::{ChatSession, Database, Message, NewMessage, optional_timestamp, parsed, timestamp, to_millis};
use crate::error::{Error, Result};
use crate::session::SessionStore;

const SESSION_COLUMNS: &str = "id, conversation_id, status, last_interaction_at, closed_at,
                               metadata_json, created_at, updated_at";

impl Database {
    fn map_session(row: &rusqlite::Row) -> rusqlite::Result<ChatSession> {
        let metadata_json: String = row.get(5)?;
        let metadata: Map<String, Value> = serde_json::from_str(&metadata_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(ChatSession {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            status: parsed(row, 2)?,
            last_interaction_at: timestamp(row, 3)?,
            closed_at: optional_timestamp(row, 4)?,
            metadata,
            created_at: timestamp(row, 6)?,
            updated_at: timestamp(row, 7)?,
        })
    }

    fn map_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
        Ok(Message {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            chat_session_id: row.get(2)?,
            sender: parsed(row, 3)?,
            content: row.get(4)?,
            created_at: timestamp(row, 5)?,
        })
    }

    fn fetch_session(conn: &Connection, session_id: i64) -> Result<ChatSession> {
        conn.query_row(
            &format!("SELECT {} FROM chat_session WHERE id = ?1", SESSION_COLUMNS),
            params![session_id],
            Self::map_session,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("ChatSession", session_id))
    }
}

impl SessionStore for Database {
    fn latest_active_session(&self, conversation_id: i64) -> Result<Option<ChatSession>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM chat_session
                     WHERE conversation_id = ?1 AND status = 'active'
                     ORDER BY last_interaction_at DESC, id DESC
                     LIMIT 1",
                    SESSION_COLUMNS
                ),
                params![conversation_id],
                Self::map_session,
            )
            .optional()?)
    }

    fn get_session(&self, conversation_id: i64, session_id: i64) -> Result<Option<ChatSession>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM chat_session WHERE id = ?1 AND conversation_id = ?2",
                    SESSION_COLUMNS
                ),
                params![session_id, conversation_id],
                Self::map_session,
            )
            .optional()?)
    }

    fn list_sessions(&self, conversation_id: i64) -> Result<Vec<ChatSession>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM chat_session
             WHERE conversation_id = ?1
             ORDER BY created_at DESC, id DESC",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map(params![conversation_id], Self::map_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    fn create_session(
        &self,
        conversation_id: i64,
        metadata: &Map<String, Value>,
        at: DateTime<Utc>,
    ) -> Result<ChatSession> {
        let conn = self.lock()?;
        let now = to_millis(at);
        conn.execute(
            "INSERT INTO chat_session
             (conversation_id, status, last_interaction_at, metadata_json, created_at, updated_at)
             VALUES (?1, 'active', ?2, ?3, ?2, ?2)",
            params![conversation_id, now, serde_json::to_string(metadata)?],
        )?;
        Self::fetch_session(&conn, conn.last_insert_rowid())
    }

    fn touch_session(&self, session_id: i64, at: DateTime<Utc>) -> Result<ChatSession> {
        let conn = self.lock()?;
        let now = to_millis(at);
        let changed = conn.execute(
            "UPDATE chat_session SET last_interaction_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status = 'active'",
            params![now, session_id],
        )?;
        let session = Self::fetch_session(&conn, session_id)?;
        if changed == 0 {
            return Err(Error::conflict(format!("chat session {} is closed", session_id)));
        }
        Ok(session)
    }

    fn close_session(&self, session_id: i64, at: DateTime<Utc>) -> Result<ChatSession> {
        let conn = self.lock()?;
        let now = to_millis(at);
        let changed = conn.execute(
            "UPDATE chat_session SET status = 'closed', closed_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status = 'active'",
            params![now, session_id],
        )?;
        let session = Self::fetch_session(&conn, session_id)?;
        if changed == 0 {
            return Err(Error::conflict(format!("chat session {} is already closed", session_id)));
        }
        Ok(session)
    }

    fn merge_session_metadata(
        &self,
        session_id: i64,
        patch: &Map<String, Value>,
        at: DateTime<Utc>,
    ) -> Result<ChatSession> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut metadata = Self::fetch_session(&tx, session_id)?.metadata;
        for (key, value) in patch {
            if value.is_null() {
                metadata.remove(key);
            } else {
                metadata.insert(key.clone(), value.clone());
            }
        }

        tx.execute(
            "UPDATE chat_session SET metadata_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(&metadata)?, to_millis(at), session_id],
        )?;
        let session = Self::fetch_session(&tx, session_id)?;
        tx.commit()?;
        Ok(session)
    }

    fn insert_message(
        &self,
        session: &ChatSession,
        message: &NewMessage,
        at: DateTime<Utc>,
    ) -> Result<Message> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO message (conversation_id, chat_session_id, sender, content, created_at)
             SELECT conversation_id, id, ?2, ?3, ?4 FROM chat_session
             WHERE id = ?1 AND status = 'active'",
            params![session.id, message.sender.as_str(), message.content, to_millis(at)],
        )?;
        if inserted == 0 {
            Self::fetch_session(&conn, session.id)?;
            return Err(Error::conflict(format!("chat session {} is closed", session.id)));
        }
        let id = conn.last_insert_rowid();
        Ok(conn.query_row(
            "SELECT id, conversation_id, chat_session_id, sender, content, created_at
             FROM message WHERE id = ?1",
            params![id],
            Self::map_message,
        )?)
    }

    fn session_messages(&self, session_id: i64) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, chat_session_id, sender, content, created_at
             FROM message WHERE chat_session_id = ?1 ORDER BY id",
        )?;
        let messages = stmt
            .query_map(params![session_id], Self::map_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }
}
