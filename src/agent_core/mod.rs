//! Agent Core — request-resolution pipeline for DeskQuery.
//!
//! Submodules:
//! - `orchestrator`: Entry point; drives the stage pipeline per turn
//! - `turn_state`: Stages, the transition table and per-request state
//! - `classifier`, `references`, `selector`, `extractor`, `executor`,
//!   `describer`: The pipeline stages
//! - `retrier`: Parse-validate-retry wrapper around oracle calls
//! - `prompts`: Prompt builders for every stage
//! - `registry`: Operation registry and per-request filtered views
//! - `conversation`: Conversation store trait and its SQLite implementation
//! - `database`: SQLite persistence for conversations, messages, pending turns
//! - `tokens`: Token estimation for history budgets
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod classifier;
pub mod conversation;
pub mod database;
pub mod describer;
pub mod errors;
pub mod executor;
pub mod extractor;
pub mod orchestrator;
pub mod prompts;
pub mod references;
pub mod registry;
pub mod retrier;
pub mod selector;
pub mod tokens;
pub mod turn_state;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use conversation::{ConversationManager, ConversationStore};
pub use database::AgentDatabase;
pub use errors::{AgentError, OperationError, StageError};
pub use orchestrator::{Orchestrator, OrchestratorContext};
pub use registry::{DataHandle, Operation, OperationDescriptor, OperationRegistry, Visualizer};
pub use retrier::RetryBudget;
pub use turn_state::{Stage, TurnState};
pub use types::{
    Conversation, ConversationMessage, ConversationSummary, MessageStatus, NewMessage,
    StructuredResult, TaskKind, TurnResponse,
};
