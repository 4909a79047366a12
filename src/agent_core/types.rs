//! Shared types for the agent core.
//!
//! Conversation messages, result envelopes, task kinds and the entry-point
//! response used across the ConversationManager and the Orchestrator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::turn_state::Stage;
use crate::inference::types::Role;

// ─── Message Status ─────────────────────────────────────────────────────────

/// The orchestrator's disposition recorded on each message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// A fresh user request.
    UserMsg,
    /// A user message answering an `AskUser` question.
    UserResponse,
    Success,
    /// The request is suspended waiting for more information.
    AskUser,
    /// No registered operation fits the request.
    NoMatch,
    Error,
}

impl MessageStatus {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::UserMsg => "user_msg",
            MessageStatus::UserResponse => "user_response",
            MessageStatus::Success => "success",
            MessageStatus::AskUser => "ask_user",
            MessageStatus::NoMatch => "no_match",
            MessageStatus::Error => "error",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_msg" => Some(MessageStatus::UserMsg),
            "user_response" => Some(MessageStatus::UserResponse),
            "success" => Some(MessageStatus::Success),
            "ask_user" => Some(MessageStatus::AskUser),
            "no_match" => Some(MessageStatus::NoMatch),
            "error" => Some(MessageStatus::Error),
            _ => None,
        }
    }
}

// ─── Structured Results ─────────────────────────────────────────────────────

/// The data + visualization-metadata envelope returned by an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuredResult {
    /// Operation output, keyed by whatever the operation chooses.
    pub data: Map<String, Value>,
    /// Whether the result can be rendered as a chart.
    pub visualizable: bool,
    /// Whether a chart has already been rendered for this result.
    pub already_visualized: bool,
    /// Names of the visualizations the renderer can produce.
    pub available_visualizations: Vec<String>,
    /// Renderer output, set once a visualization exists.
    pub visualization: Option<Value>,
}

impl StructuredResult {
    /// Reduced view used in prompts: never includes the raw payload.
    pub fn summary(&self) -> ResultSummary {
        ResultSummary {
            has_data: !self.data.is_empty(),
            visualizable: self.visualizable,
            already_visualized: self.already_visualized,
            available_visualizations: self.available_visualizations.clone(),
        }
    }

    /// Whether the describer must invite the user to request a chart.
    pub fn needs_visualization_invite(&self) -> bool {
        self.visualizable && !self.already_visualized
    }
}

/// Metadata-only view of a [`StructuredResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub has_data: bool,
    pub visualizable: bool,
    pub already_visualized: bool,
    pub available_visualizations: Vec<String>,
}

// ─── Conversation Messages ──────────────────────────────────────────────────

/// A single message stored in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Per-conversation sequence number, strictly increasing from 1.
    pub id: i64,
    pub conversation_id: String,
    /// ISO 8601 timestamp.
    pub timestamp: String,
    pub role: Role,
    pub content: String,
    pub status: Option<MessageStatus>,
    pub data: Option<StructuredResult>,
    /// Estimated token count of `content`.
    pub token_count: u32,
}

impl ConversationMessage {
    /// Prompt-safe view with the payload reduced to its summary.
    pub fn stripped(&self) -> MessageView {
        MessageView {
            id: self.id,
            role: self.role,
            content: self.content.clone(),
            status: self.status,
            data: self.data.as_ref().map(StructuredResult::summary),
        }
    }
}

/// Builder for creating conversation messages without specifying DB fields.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub status: Option<MessageStatus>,
    pub data: Option<StructuredResult>,
}

impl NewMessage {
    /// A user message with the given status.
    pub fn user(content: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            status: Some(status),
            data: None,
        }
    }

    /// An assistant message, optionally carrying a result.
    pub fn assistant(
        content: impl Into<String>,
        status: MessageStatus,
        data: Option<StructuredResult>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            status: Some(status),
            data,
        }
    }
}

/// Stripped message view: role, content, status and a result summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: i64,
    pub role: Role,
    pub content: String,
    pub status: Option<MessageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResultSummary>,
}

// ─── Conversations ──────────────────────────────────────────────────────────

/// A conversation with all its messages in id order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub last_activity: String,
    pub messages: Vec<ConversationMessage>,
}

impl Conversation {
    /// The most recent message, if any.
    pub fn last_message(&self) -> Option<&ConversationMessage> {
        self.messages.last()
    }
}

/// Listing entry for a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub last_activity: String,
    pub message_count: usize,
}

// ─── Tasks ──────────────────────────────────────────────────────────────────

/// High-level intent of a request, decided by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Chat,
    ExecuteFunction,
    ExplainFormerResult,
    ExecuteFunctionOnFormerResult,
    PlotFormerResult,
    ExecuteFunctionPlan,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::Chat,
        TaskKind::ExecuteFunction,
        TaskKind::ExplainFormerResult,
        TaskKind::ExecuteFunctionOnFormerResult,
        TaskKind::PlotFormerResult,
        TaskKind::ExecuteFunctionPlan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Chat => "chat",
            TaskKind::ExecuteFunction => "execute_function",
            TaskKind::ExplainFormerResult => "explain_former_result",
            TaskKind::ExecuteFunctionOnFormerResult => "execute_function_on_former_result",
            TaskKind::PlotFormerResult => "plot_former_result",
            TaskKind::ExecuteFunctionPlan => "execute_function_plan",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Tasks that need the reference resolver before anything else.
    pub fn depends_on_former_result(&self) -> bool {
        matches!(
            self,
            TaskKind::ExplainFormerResult
                | TaskKind::ExecuteFunctionOnFormerResult
                | TaskKind::PlotFormerResult
        )
    }
}

// ─── Entry Point Response ───────────────────────────────────────────────────

/// What `handle_turn` returns to the hosting service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnResponse {
    pub status: MessageStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<StructuredResult>,
    /// Stage to resume at on the next turn, set only for `AskUser`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_stage: Option<Stage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_db_strings() {
        for status in [
            MessageStatus::UserMsg,
            MessageStatus::UserResponse,
            MessageStatus::Success,
            MessageStatus::AskUser,
            MessageStatus::NoMatch,
            MessageStatus::Error,
        ] {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MessageStatus::parse("pending"), None);
    }

    #[test]
    fn task_kind_serde_matches_as_str() {
        for task in TaskKind::ALL {
            let json = serde_json::to_string(&task).unwrap();
            assert_eq!(json, format!("\"{}\"", task.as_str()));
        }
        assert_eq!(TaskKind::parse("plot_former_result"), Some(TaskKind::PlotFormerResult));
        assert!(TaskKind::PlotFormerResult.depends_on_former_result());
        assert!(!TaskKind::ExecuteFunctionPlan.depends_on_former_result());
    }

    #[test]
    fn stripped_view_drops_payload() {
        let mut data = Map::new();
        data.insert("monday".into(), serde_json::json!(0.71));
        let msg = ConversationMessage {
            id: 2,
            conversation_id: "c".into(),
            timestamp: "2025-01-01T00:00:00Z".into(),
            role: Role::Assistant,
            content: "Mondays are busiest.".into(),
            status: Some(MessageStatus::Success),
            data: Some(StructuredResult {
                data,
                visualizable: true,
                available_visualizations: vec!["bar".into()],
                ..Default::default()
            }),
            token_count: 7,
        };

        let view = msg.stripped();
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("monday"));
        let summary = view.data.unwrap();
        assert!(summary.has_data);
        assert!(summary.visualizable);
        assert!(!summary.already_visualized);
    }

    #[test]
    fn structured_result_tolerates_missing_fields() {
        let result: StructuredResult = serde_json::from_str(r#"{"visualizable": true}"#).unwrap();
        assert!(result.data.is_empty());
        assert!(result.needs_visualization_invite());
    }
}
