//! ConversationManager — persistent, append-only conversation history.
//!
//! Responsibilities:
//! - Store and retrieve id-stamped conversation messages (SQLite)
//! - Track token estimates per message
//! - Build the stripped and full views the pipeline stages consume
//! - Persist the state of a request suspended on `ask_user`

use super::database::AgentDatabase;
use super::errors::AgentError;
use super::tokens;
use super::turn_state::TurnState;
use super::types::{
    Conversation, ConversationMessage, ConversationSummary, MessageStatus, MessageView,
    NewMessage,
};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Characters of the first utterance used as a conversation's title.
pub const TITLE_CHARS: usize = 30;

/// Title used when the first utterance is blank.
const DEFAULT_TITLE: &str = "New conversation";

// ─── ConversationStore ──────────────────────────────────────────────────────

/// Storage seam consumed by the orchestrator.
///
/// `load` returns messages in id order and `append` assigns strictly
/// increasing ids within a conversation. Messages are never modified.
pub trait ConversationStore: Send {
    fn create(&self, conversation_id: &str, title: &str) -> Result<(), AgentError>;

    fn exists(&self, conversation_id: &str) -> Result<bool, AgentError>;

    fn load(&self, conversation_id: &str) -> Result<Conversation, AgentError>;

    fn append(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<ConversationMessage, AgentError>;

    fn rename(&self, conversation_id: &str, title: &str) -> Result<(), AgentError>;

    fn delete(&self, conversation_id: &str) -> Result<(), AgentError>;

    fn list(&self) -> Result<Vec<ConversationSummary>, AgentError>;

    /// Stripped view of the last `window` messages, trimmed from the oldest
    /// end until it fits `token_budget`.
    fn recent_history(
        &self,
        conversation_id: &str,
        window: usize,
        token_budget: u32,
    ) -> Result<Vec<MessageView>, AgentError>;

    /// Status of the newest message, regardless of any prompt window.
    fn last_status(&self, conversation_id: &str) -> Result<Option<MessageStatus>, AgentError>;

    /// Full messages (payloads included) for the given ids, in id order.
    fn messages_by_ids(
        &self,
        conversation_id: &str,
        ids: &[i64],
    ) -> Result<Vec<ConversationMessage>, AgentError>;

    fn save_pending_turn(&self, conversation_id: &str, state: &TurnState) -> Result<(), AgentError>;

    fn load_pending_turn(&self, conversation_id: &str) -> Result<Option<TurnState>, AgentError>;

    fn clear_pending_turn(&self, conversation_id: &str) -> Result<(), AgentError>;
}

/// Title derived from a conversation's first utterance.
pub fn title_from_utterance(utterance: &str) -> String {
    let title: String = utterance.trim().chars().take(TITLE_CHARS).collect();
    if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title
    }
}

// ─── ConversationManager ────────────────────────────────────────────────────

/// SQLite-backed [`ConversationStore`].
pub struct ConversationManager {
    db: AgentDatabase,
}

impl ConversationManager {
    /// Create a new ConversationManager backed by the given database.
    pub fn new(db: AgentDatabase) -> Self {
        Self { db }
    }

    /// Open an in-memory store.
    pub fn in_memory() -> Result<Self, AgentError> {
        Ok(Self::new(AgentDatabase::open(":memory:")?))
    }

    fn require(&self, conversation_id: &str) -> Result<ConversationSummary, AgentError> {
        self.db
            .get_conversation(conversation_id)?
            .ok_or_else(|| AgentError::ConversationNotFound {
                conversation_id: conversation_id.to_string(),
            })
    }
}

impl ConversationStore for ConversationManager {
    fn create(&self, conversation_id: &str, title: &str) -> Result<(), AgentError> {
        self.db.create_conversation(conversation_id, title)?;
        tracing::info!(conversation_id = %conversation_id, title = %title, "conversation created");
        Ok(())
    }

    fn exists(&self, conversation_id: &str) -> Result<bool, AgentError> {
        Ok(self.db.get_conversation(conversation_id)?.is_some())
    }

    fn load(&self, conversation_id: &str) -> Result<Conversation, AgentError> {
        let meta = self.require(conversation_id)?;
        let messages = self.db.get_messages(conversation_id)?;
        Ok(Conversation {
            id: meta.id,
            title: meta.title,
            created_at: meta.created_at,
            last_activity: meta.last_activity,
            messages,
        })
    }

    fn append(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<ConversationMessage, AgentError> {
        self.require(conversation_id)?;
        let token_count = tokens::estimate_tokens(&message.content);
        let stored = self.db.insert_message(conversation_id, &message, token_count)?;

        tracing::debug!(
            conversation_id = %conversation_id,
            message_id = stored.id,
            role = stored.role.as_str(),
            status = ?stored.status.map(|s| s.as_str()),
            "message appended"
        );
        Ok(stored)
    }

    fn rename(&self, conversation_id: &str, title: &str) -> Result<(), AgentError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(AgentError::InvalidMessage {
                reason: "conversation title must not be empty".into(),
            });
        }
        if self.db.rename_conversation(conversation_id, title)? == 0 {
            return Err(AgentError::ConversationNotFound {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(())
    }

    fn delete(&self, conversation_id: &str) -> Result<(), AgentError> {
        if self.db.delete_conversation(conversation_id)? == 0 {
            return Err(AgentError::ConversationNotFound {
                conversation_id: conversation_id.to_string(),
            });
        }
        tracing::info!(conversation_id = %conversation_id, "conversation deleted");
        Ok(())
    }

    fn list(&self) -> Result<Vec<ConversationSummary>, AgentError> {
        self.db.list_conversations()
    }

    fn recent_history(
        &self,
        conversation_id: &str,
        window: usize,
        token_budget: u32,
    ) -> Result<Vec<MessageView>, AgentError> {
        let messages = self.db.get_recent_messages(conversation_id, window)?;
        let views = messages.iter().map(ConversationMessage::stripped).collect();
        Ok(tokens::trim_to_budget(views, token_budget))
    }

    fn last_status(&self, conversation_id: &str) -> Result<Option<MessageStatus>, AgentError> {
        let newest = self.db.get_recent_messages(conversation_id, 1)?;
        Ok(newest.last().and_then(|m| m.status))
    }

    fn messages_by_ids(
        &self,
        conversation_id: &str,
        ids: &[i64],
    ) -> Result<Vec<ConversationMessage>, AgentError> {
        self.db.get_messages_by_ids(conversation_id, ids)
    }

    fn save_pending_turn(&self, conversation_id: &str, state: &TurnState) -> Result<(), AgentError> {
        let json = serde_json::to_string(state)?;
        self.db.upsert_pending_turn(conversation_id, &json)
    }

    fn load_pending_turn(&self, conversation_id: &str) -> Result<Option<TurnState>, AgentError> {
        match self.db.get_pending_turn(conversation_id)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn clear_pending_turn(&self, conversation_id: &str) -> Result<(), AgentError> {
        self.db.delete_pending_turn(conversation_id)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::types::{MessageStatus, StructuredResult, TaskKind};

    fn store_with(id: &str) -> ConversationManager {
        let store = ConversationManager::in_memory().unwrap();
        store.create(id, "test").unwrap();
        store
    }

    #[test]
    fn title_is_first_thirty_chars() {
        let title = title_from_utterance("What is the weekday breakdown of all bookings in 2024?");
        assert_eq!(title.chars().count(), TITLE_CHARS);
        assert_eq!(title, "What is the weekday breakdown ");
        assert_eq!(title_from_utterance("   "), DEFAULT_TITLE);
    }

    #[test]
    fn append_requires_existing_conversation() {
        let store = ConversationManager::in_memory().unwrap();
        let err = store
            .append("ghost", NewMessage::user("hi", MessageStatus::UserMsg))
            .unwrap_err();
        assert!(matches!(err, AgentError::ConversationNotFound { .. }));
    }

    #[test]
    fn load_returns_messages_in_id_order() {
        let store = store_with("c1");
        for i in 0..4 {
            store
                .append("c1", NewMessage::user(format!("m{i}"), MessageStatus::UserMsg))
                .unwrap();
        }
        let conv = store.load("c1").unwrap();
        let ids: Vec<i64> = conv.messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(conv.last_message().unwrap().content, "m3");
    }

    #[test]
    fn recent_history_is_stripped() {
        let store = store_with("c1");
        let mut result = StructuredResult {
            visualizable: true,
            ..Default::default()
        };
        result.data.insert("secret_payload".into(), serde_json::json!([1, 2, 3]));
        store
            .append("c1", NewMessage::assistant("here", MessageStatus::Success, Some(result)))
            .unwrap();

        let history = store.recent_history("c1", 20, 4_000).unwrap();
        assert_eq!(history.len(), 1);
        let json = serde_json::to_string(&history).unwrap();
        assert!(!json.contains("secret_payload"));
        assert!(history[0].data.as_ref().unwrap().visualizable);

        let full = store.messages_by_ids("c1", &[1]).unwrap();
        assert!(full[0].data.as_ref().unwrap().data.contains_key("secret_payload"));
    }

    #[test]
    fn last_status_ignores_the_prompt_window() {
        let store = store_with("c1");
        assert_eq!(store.last_status("c1").unwrap(), None);

        store
            .append("c1", NewMessage::user("mean utilization?", MessageStatus::UserMsg))
            .unwrap();
        store
            .append("c1", NewMessage::assistant("Since when?", MessageStatus::AskUser, None))
            .unwrap();

        assert!(store.recent_history("c1", 0, 4_000).unwrap().is_empty());
        assert_eq!(store.last_status("c1").unwrap(), Some(MessageStatus::AskUser));
    }

    #[test]
    fn rename_rejects_blank_title() {
        let store = store_with("c1");
        assert!(matches!(
            store.rename("c1", "  "),
            Err(AgentError::InvalidMessage { .. })
        ));
        store.rename("c1", "Occupancy questions").unwrap();
        assert_eq!(store.load("c1").unwrap().title, "Occupancy questions");
        assert!(store.rename("ghost", "x").is_err());
    }

    #[test]
    fn delete_then_load_fails() {
        let store = store_with("c1");
        store.delete("c1").unwrap();
        assert!(!store.exists("c1").unwrap());
        assert!(store.load("c1").is_err());
        assert!(store.delete("c1").is_err());
    }

    #[test]
    fn pending_turn_round_trip() {
        let store = store_with("c1");
        let mut state = TurnState::new("how busy was floor 3?");
        state.task = Some(TaskKind::ExecuteFunction);
        state.selected_operation = Some("mean_utilization".into());
        state.discarded_operations.push("forecast_employees".into());

        store.save_pending_turn("c1", &state).unwrap();
        let loaded = store.load_pending_turn("c1").unwrap().unwrap();
        assert_eq!(loaded, state);

        store.clear_pending_turn("c1").unwrap();
        assert!(store.load_pending_turn("c1").unwrap().is_none());
    }
}
