//! SQLite database for conversations, messages and suspended turns.
//!
//! Uses `rusqlite` in synchronous mode; callers hold it behind a mutex and
//! never across an await point. WAL mode is enabled for concurrent readers.

use rusqlite::{params, Connection, OptionalExtension};

use super::errors::AgentError;
use super::types::{ConversationMessage, ConversationSummary, MessageStatus, NewMessage};
use crate::inference::types::Role;

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite database handle for the agent core.
pub struct AgentDatabase {
    conn: Connection,
}

const MESSAGE_COLUMNS: &str =
    "seq, conversation_id, timestamp, role, content, status, data, token_count";

impl AgentDatabase {
    /// Open (or create) the agent database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, AgentError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    /// Create all required tables if they don't exist.
    fn create_tables(&self) -> Result<(), AgentError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_activity TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                conversation_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                status TEXT,
                data TEXT,
                token_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (conversation_id, seq),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
                    ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS pending_turns (
                conversation_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
                    ON DELETE CASCADE
            );
            ",
        )?;
        Ok(())
    }

    // ─── Conversations ──────────────────────────────────────────────────

    /// Create a new conversation with the given ID and title.
    pub fn create_conversation(&self, conversation_id: &str, title: &str) -> Result<(), AgentError> {
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO conversations (id, title, created_at, last_activity)
             VALUES (?1, ?2, ?3, ?3)",
            params![conversation_id, title, now],
        )?;
        Ok(())
    }

    /// Get a conversation's metadata by ID.
    pub fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationSummary>, AgentError> {
        let result = self
            .conn
            .query_row(
                "SELECT c.id, c.title, c.created_at, c.last_activity,
                        (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id)
                 FROM conversations c WHERE c.id = ?1",
                params![conversation_id],
                row_to_summary,
            )
            .optional()?;
        Ok(result)
    }

    /// Update the conversation's last activity timestamp.
    pub fn touch_conversation(&self, conversation_id: &str) -> Result<(), AgentError> {
        self.conn.execute(
            "UPDATE conversations SET last_activity = ?2 WHERE id = ?1",
            params![conversation_id, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Set a conversation's title. Returns the number of rows updated.
    pub fn rename_conversation(&self, conversation_id: &str, title: &str) -> Result<usize, AgentError> {
        let updated = self.conn.execute(
            "UPDATE conversations SET title = ?2 WHERE id = ?1",
            params![conversation_id, title],
        )?;
        Ok(updated)
    }

    /// List all conversations, most recent activity first.
    pub fn list_conversations(&self) -> Result<Vec<ConversationSummary>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id, c.title, c.created_at, c.last_activity,
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id)
             FROM conversations c
             ORDER BY c.last_activity DESC, c.rowid DESC",
        )?;

        let rows = stmt.query_map([], row_to_summary)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    /// Delete a conversation with its messages and any suspended turn.
    ///
    /// Returns the number of conversations removed (0 or 1).
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<usize, AgentError> {
        self.conn.execute(
            "DELETE FROM pending_turns WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        self.conn.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        let removed = self.conn.execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![conversation_id],
        )?;
        Ok(removed)
    }

    // ─── Messages ───────────────────────────────────────────────────────

    /// Append a message, assigning the next per-conversation sequence id.
    ///
    /// The insert and the activity bump commit together.
    pub fn insert_message(
        &self,
        conversation_id: &str,
        msg: &NewMessage,
        token_count: u32,
    ) -> Result<ConversationMessage, AgentError> {
        let data_json = msg.data.as_ref().map(serde_json::to_string).transpose()?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO messages
             (conversation_id, seq, timestamp, role, content, status, data, token_count)
             SELECT ?1, COALESCE(MAX(seq), 0) + 1, ?2, ?3, ?4, ?5, ?6, ?7
             FROM messages WHERE conversation_id = ?1",
            params![
                conversation_id,
                now_rfc3339(),
                msg.role.as_str(),
                msg.content,
                msg.status.map(|s| s.as_str()),
                data_json,
                token_count,
            ],
        )?;
        let rowid = tx.last_insert_rowid();

        self.touch_conversation(conversation_id)?;

        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE rowid = ?1");
        let stored = tx.query_row(&sql, params![rowid], row_to_message)?;
        tx.commit()?;
        Ok(stored)
    }

    /// Get all messages for a conversation, in id order.
    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>, AgentError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY seq ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![conversation_id], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Get the N most recent messages for a conversation, oldest first.
    pub fn get_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, AgentError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY seq DESC
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![conversation_id, limit as i64], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        // Reverse so oldest is first
        messages.reverse();
        Ok(messages)
    }

    /// Get the messages with the given ids, in id order. Unknown ids are skipped.
    pub fn get_messages_by_ids(
        &self,
        conversation_id: &str,
        ids: &[i64],
    ) -> Result<Vec<ConversationMessage>, AgentError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders: Vec<String> = (0..ids.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 AND seq IN ({})
             ORDER BY seq ASC",
            placeholders.join(",")
        );

        let mut values: Vec<&dyn rusqlite::types::ToSql> = vec![&conversation_id];
        values.extend(ids.iter().map(|id| id as &dyn rusqlite::types::ToSql));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(values.as_slice(), row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    // ─── Pending Turns ──────────────────────────────────────────────────

    /// Store (or replace) the serialized state of a suspended request.
    pub fn upsert_pending_turn(&self, conversation_id: &str, state_json: &str) -> Result<(), AgentError> {
        self.conn.execute(
            "INSERT INTO pending_turns (conversation_id, state, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(conversation_id) DO UPDATE
             SET state = excluded.state, updated_at = excluded.updated_at",
            params![conversation_id, state_json, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Get the serialized state of a suspended request, if any.
    pub fn get_pending_turn(&self, conversation_id: &str) -> Result<Option<String>, AgentError> {
        let state = self
            .conn
            .query_row(
                "SELECT state FROM pending_turns WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    /// Remove a suspended request's state.
    pub fn delete_pending_turn(&self, conversation_id: &str) -> Result<(), AgentError> {
        self.conn.execute(
            "DELETE FROM pending_turns WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Convert a rusqlite row to a ConversationMessage.
///
/// An unknown role fails the read. Unreadable status or data columns are
/// dropped with a warning so one bad row does not hide a whole conversation.
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationMessage> {
    let id: i64 = row.get(0)?;
    let conversation_id: String = row.get(1)?;

    let raw_role: String = row.get(3)?;
    let role = Role::parse(&raw_role).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown role '{raw_role}' on message {id}").into(),
        )
    })?;

    let status = row.get::<_, Option<String>>(5)?.and_then(|raw| {
        let parsed = MessageStatus::parse(&raw);
        if parsed.is_none() {
            tracing::warn!(
                conversation_id = %conversation_id,
                message_id = id,
                status = %raw,
                "dropping unknown message status"
            );
        }
        parsed
    });

    let data = row
        .get::<_, Option<String>>(6)?
        .and_then(|raw| match serde_json::from_str(&raw) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    message_id = id,
                    error = %e,
                    "dropping unreadable result data"
                );
                None
            }
        });

    Ok(ConversationMessage {
        id,
        conversation_id,
        timestamp: row.get(2)?,
        role,
        content: row.get(4)?,
        status,
        data,
        token_count: row.get::<_, i64>(7)? as u32,
    })
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationSummary> {
    Ok(ConversationSummary {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
        last_activity: row.get(3)?,
        message_count: row.get::<_, i64>(4)? as usize,
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::types::StructuredResult;

    fn test_db() -> AgentDatabase {
        AgentDatabase::open(":memory:").unwrap()
    }

    #[test]
    fn test_create_and_get_conversation() {
        let db = test_db();
        db.create_conversation("c1", "Weekday breakdown").unwrap();

        let conv = db.get_conversation("c1").unwrap().unwrap();
        assert_eq!(conv.title, "Weekday breakdown");
        assert_eq!(conv.message_count, 0);
        assert!(db.get_conversation("nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_sequence_ids_are_per_conversation() {
        let db = test_db();
        db.create_conversation("c1", "a").unwrap();
        db.create_conversation("c2", "b").unwrap();

        let m1 = db
            .insert_message("c1", &NewMessage::user("hello", MessageStatus::UserMsg), 3)
            .unwrap();
        let m2 = db
            .insert_message("c2", &NewMessage::user("other", MessageStatus::UserMsg), 3)
            .unwrap();
        let m3 = db
            .insert_message("c1", &NewMessage::assistant("hi", MessageStatus::Success, None), 2)
            .unwrap();

        assert_eq!((m1.id, m2.id, m3.id), (1, 1, 2));
        assert_eq!(m3.role, Role::Assistant);
        assert_eq!(m3.status, Some(MessageStatus::Success));
    }

    #[test]
    fn test_data_payload_survives_storage() {
        let db = test_db();
        db.create_conversation("c1", "a").unwrap();

        let mut result = StructuredResult {
            visualizable: true,
            available_visualizations: vec!["bar".into(), "line".into()],
            ..Default::default()
        };
        result.data.insert("monday".into(), serde_json::json!(0.8));
        let msg = NewMessage::assistant("done", MessageStatus::Success, Some(result.clone()));
        db.insert_message("c1", &msg, 1).unwrap();

        let messages = db.get_messages("c1").unwrap();
        assert_eq!(messages[0].data.as_ref(), Some(&result));
    }

    #[test]
    fn test_failed_activity_bump_rolls_back_the_insert() {
        let db = test_db();
        db.create_conversation("c1", "a").unwrap();
        db.conn
            .execute_batch(
                "CREATE TRIGGER refuse_touch BEFORE UPDATE ON conversations
                 BEGIN SELECT RAISE(ABORT, 'touch refused'); END;",
            )
            .unwrap();

        let msg = NewMessage::user("hello", MessageStatus::UserMsg);
        assert!(db.insert_message("c1", &msg, 1).is_err());
        assert!(db.get_messages("c1").unwrap().is_empty());

        db.conn.execute_batch("DROP TRIGGER refuse_touch;").unwrap();
        assert_eq!(db.insert_message("c1", &msg, 1).unwrap().id, 1);
    }

    #[test]
    fn test_corrupt_rows() {
        let db = test_db();
        db.create_conversation("c1", "a").unwrap();
        let msg = NewMessage::assistant("done", MessageStatus::Success, Some(Default::default()));
        db.insert_message("c1", &msg, 1).unwrap();

        db.conn
            .execute("UPDATE messages SET data = '{not json', status = 'shrug'", [])
            .unwrap();
        let messages = db.get_messages("c1").unwrap();
        assert_eq!(messages[0].content, "done");
        assert!(messages[0].data.is_none());
        assert!(messages[0].status.is_none());

        db.conn.execute("UPDATE messages SET role = 'tool'", []).unwrap();
        assert!(db.get_messages("c1").is_err());
    }

    #[test]
    fn test_get_recent_messages() {
        let db = test_db();
        db.create_conversation("c1", "a").unwrap();

        for i in 0..10 {
            let msg = NewMessage::user(format!("message {i}"), MessageStatus::UserMsg);
            db.insert_message("c1", &msg, 5).unwrap();
        }

        let recent = db.get_recent_messages("c1", 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content, "message 7");
        assert_eq!(recent[2].content, "message 9");
        assert_eq!(recent[2].id, 10);
    }

    #[test]
    fn test_get_messages_by_ids() {
        let db = test_db();
        db.create_conversation("c1", "a").unwrap();
        for i in 0..5 {
            let msg = NewMessage::user(format!("m{i}"), MessageStatus::UserMsg);
            db.insert_message("c1", &msg, 1).unwrap();
        }

        let picked = db.get_messages_by_ids("c1", &[4, 2, 99]).unwrap();
        let ids: Vec<i64> = picked.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert!(db.get_messages_by_ids("c1", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_delete_conversation_removes_everything() {
        let db = test_db();
        db.create_conversation("c1", "a").unwrap();
        db.insert_message("c1", &NewMessage::user("x", MessageStatus::UserMsg), 1)
            .unwrap();
        db.upsert_pending_turn("c1", "{}").unwrap();

        assert_eq!(db.delete_conversation("c1").unwrap(), 1);
        assert!(db.get_messages("c1").unwrap().is_empty());
        assert!(db.get_pending_turn("c1").unwrap().is_none());
        assert_eq!(db.delete_conversation("c1").unwrap(), 0);
    }

    #[test]
    fn test_pending_turn_upsert() {
        let db = test_db();
        db.create_conversation("c1", "a").unwrap();

        db.upsert_pending_turn("c1", r#"{"v":1}"#).unwrap();
        db.upsert_pending_turn("c1", r#"{"v":2}"#).unwrap();
        assert_eq!(db.get_pending_turn("c1").unwrap().as_deref(), Some(r#"{"v":2}"#));

        db.delete_pending_turn("c1").unwrap();
        assert!(db.get_pending_turn("c1").unwrap().is_none());
    }

    #[test]
    fn test_on_disk_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deskquery.db");
        let path = path.to_str().unwrap();
        {
            let db = AgentDatabase::open(path).unwrap();
            db.create_conversation("c1", "Floor 3").unwrap();
            db.insert_message("c1", &NewMessage::user("busy?", MessageStatus::UserMsg), 2)
                .unwrap();
            db.upsert_pending_turn("c1", r#"{"utterance":"busy?"}"#).unwrap();
        }

        let db = AgentDatabase::open(path).unwrap();
        assert_eq!(db.get_conversation("c1").unwrap().unwrap().message_count, 1);
        let next = db
            .insert_message("c1", &NewMessage::assistant("Quite.", MessageStatus::Success, None), 1)
            .unwrap();
        assert_eq!(next.id, 2);
        assert!(db.get_pending_turn("c1").unwrap().is_some());
    }

    #[test]
    fn test_list_and_rename() {
        let db = test_db();
        db.create_conversation("c1", "first").unwrap();
        db.create_conversation("c2", "second").unwrap();
        db.insert_message("c1", &NewMessage::user("bump", MessageStatus::UserMsg), 1)
            .unwrap();

        let list = db.list_conversations().unwrap();
        assert_eq!(list[0].id, "c1");
        assert_eq!(list[0].message_count, 1);

        assert_eq!(db.rename_conversation("c2", "renamed").unwrap(), 1);
        assert_eq!(db.rename_conversation("missing", "x").unwrap(), 0);
        assert_eq!(db.get_conversation("c2").unwrap().unwrap().title, "renamed");
    }
}
