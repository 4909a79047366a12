//! Agent Core error types.

use thiserror::Error;

use super::turn_state::Stage;
use crate::inference::errors::InferenceError;

/// Errors from the conversation store and other agent-level plumbing.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Database operation failed.
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    /// Conversation not found.
    #[error("conversation not found: '{conversation_id}'")]
    ConversationNotFound { conversation_id: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },

    /// A message or title failed validation before being stored.
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// A shared lock was poisoned by a panicking holder.
    #[error("lock poisoned: {reason}")]
    LockError { reason: String },
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}

/// Why a single oracle attempt inside a stage was rejected.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// The oracle call itself failed.
    #[error(transparent)]
    Transport(#[from] InferenceError),

    /// No JSON object could be extracted from the completion.
    #[error("no JSON object in response")]
    Unparseable,

    /// The object parsed but failed the stage's validation.
    #[error("invalid response: {reason}")]
    Invalid { reason: String },
}

impl AttemptError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        AttemptError::Invalid {
            reason: reason.into(),
        }
    }
}

/// A stage failed to obtain a usable oracle response.
#[derive(Debug, Error)]
pub enum StageError {
    /// Every attempt in the retry budget was rejected.
    #[error("{stage} gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        stage: Stage,
        attempts: u32,
        last_error: String,
    },
}

/// Failure raised by an analytic operation or the visualizer.
#[derive(Debug, Error)]
pub enum OperationError {
    /// A parameter value was missing or of the wrong shape.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// The operation ran and reported a failure.
    #[error("{reason}")]
    Failed { reason: String },

    /// The operation panicked.
    #[error("operation panicked: {reason}")]
    Panicked { reason: String },
}

impl OperationError {
    /// Convenience constructor for [`OperationError::Failed`].
    pub fn failed(reason: impl Into<String>) -> Self {
        OperationError::Failed {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_names_the_stage() {
        let err = StageError::Exhausted {
            stage: Stage::SelectOperation,
            attempts: 5,
            last_error: "no JSON object in response".into(),
        };
        assert_eq!(
            err.to_string(),
            "select_operation gave up after 5 attempts: no JSON object in response"
        );
    }

    #[test]
    fn sqlite_errors_convert() {
        let err: AgentError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, AgentError::DatabaseError { .. }));
    }

    #[test]
    fn transport_errors_stay_transparent() {
        let err: AttemptError = InferenceError::Timeout { duration_secs: 60 }.into();
        assert_eq!(err.to_string(), "inference timeout after 60s");
    }
}
