//! Pipeline stages, the transition table and per-request state.
//!
//! The orchestrator's control flow is the pure function [`next_transition`]:
//! given the stage that just ran, the request's task and the stage outcome, it
//! returns where to go next. Everything with side effects lives in the
//! orchestrator; this module only decides.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::{MessageStatus, TaskKind};
use crate::inference::types::Role;

// ─── Stages ─────────────────────────────────────────────────────────────────

/// A step of the request-resolution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classify,
    Chat,
    ResolveReferences,
    ExplainFormerResult,
    Visualize,
    SelectOperation,
    AssessUsability,
    ExtractParameters,
    Execute,
    Describe,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Classify => "classify",
            Stage::Chat => "chat",
            Stage::ResolveReferences => "resolve_references",
            Stage::ExplainFormerResult => "explain_former_result",
            Stage::Visualize => "visualize",
            Stage::SelectOperation => "select_operation",
            Stage::AssessUsability => "assess_usability",
            Stage::ExtractParameters => "extract_parameters",
            Stage::Execute => "execute",
            Stage::Describe => "describe",
        }
    }

    /// Stages a suspended request can be resumed at.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Stage::ExtractParameters)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a stage reported back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Classified(TaskKind),
    ReferencesResolved,
    OperationSelected,
    /// The selector found nothing suitable, or the registry is empty.
    NoOperation,
    Usable,
    /// The candidate was rejected and removed from the turn registry.
    Discarded { budget_exhausted: bool },
    ParametersReady,
    ParametersPending,
    Executed,
    Visualized,
    Completed,
    Failed,
}

/// The dispatcher's next move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Continue(Stage),
    /// Persist the turn state and wait for the user's next message.
    Suspend,
    Finish(MessageStatus),
}

/// Transition table: current stage × outcome → next step.
///
/// Combinations that cannot happen in a correct pipeline finish with an error.
pub fn next_transition(stage: Stage, task: Option<TaskKind>, outcome: StageOutcome) -> Transition {
    use Stage as S;
    use StageOutcome as O;
    use Transition::{Continue, Finish, Suspend};

    match (stage, outcome) {
        (S::Classify, O::Classified(TaskKind::Chat)) => Continue(S::Chat),
        (S::Classify, O::Classified(kind)) if kind.depends_on_former_result() => {
            Continue(S::ResolveReferences)
        }
        (S::Classify, O::Classified(_)) => Continue(S::SelectOperation),

        (S::ResolveReferences, O::ReferencesResolved) => match task {
            Some(TaskKind::ExplainFormerResult) => Continue(S::ExplainFormerResult),
            Some(TaskKind::PlotFormerResult) => Continue(S::Visualize),
            Some(TaskKind::ExecuteFunctionOnFormerResult) => Continue(S::SelectOperation),
            _ => Finish(MessageStatus::Error),
        },

        (S::Visualize, O::Visualized) => Continue(S::Describe),

        (S::SelectOperation, O::OperationSelected) => Continue(S::AssessUsability),
        (S::SelectOperation, O::NoOperation) => Finish(MessageStatus::NoMatch),

        (S::AssessUsability, O::Usable) => Continue(S::ExtractParameters),
        (S::AssessUsability | S::ExtractParameters, O::Discarded { budget_exhausted }) => {
            if budget_exhausted {
                Finish(MessageStatus::Error)
            } else {
                Continue(S::SelectOperation)
            }
        }

        (S::ExtractParameters, O::ParametersReady) => Continue(S::Execute),
        (S::ExtractParameters, O::ParametersPending) => Suspend,

        (S::Execute, O::Executed) => Continue(S::Describe),

        (S::Chat | S::ExplainFormerResult | S::Describe, O::Completed) => {
            Finish(MessageStatus::Success)
        }

        _ => Finish(MessageStatus::Error),
    }
}

// ─── Turn State ─────────────────────────────────────────────────────────────

/// One entry of the parameter extractor's private sub-history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionEntry {
    pub role: Role,
    pub content: String,
}

/// State of one logical request. Survives a pause on `ask_user`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnState {
    /// The utterance that started the request.
    pub utterance: String,
    pub task: Option<TaskKind>,
    pub referenced_message_ids: Vec<i64>,
    pub selected_operation: Option<String>,
    pub extracted_parameters: Map<String, Value>,
    /// Human-readable note on defaulted parameter values.
    pub parameter_assumptions: Option<String>,
    /// Operations rejected during this request, in rejection order.
    pub discarded_operations: Vec<String>,
    pub extraction_history: Vec<ExtractionEntry>,
}

impl TurnState {
    /// Fresh state for a new request.
    pub fn new(utterance: impl Into<String>) -> Self {
        Self {
            utterance: utterance.into(),
            ..Default::default()
        }
    }

    /// Append a user clarification to the extraction sub-history.
    pub fn push_clarification(&mut self, content: impl Into<String>) {
        self.extraction_history.push(ExtractionEntry {
            role: Role::User,
            content: content.into(),
        });
    }

    /// Record the assistant's question so the next extraction sees it.
    pub fn push_question(&mut self, content: impl Into<String>) {
        self.extraction_history.push(ExtractionEntry {
            role: Role::Assistant,
            content: content.into(),
        });
    }

    /// Drop the current candidate and remember it as discarded.
    pub fn discard_selected(&mut self) -> Option<String> {
        let name = self.selected_operation.take()?;
        self.discarded_operations.push(name.clone());
        self.extracted_parameters.clear();
        self.parameter_assumptions = None;
        Some(name)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use MessageStatus as M;
    use StageOutcome as O;
    use Transition::{Continue, Finish, Suspend};

    #[test]
    fn chat_goes_straight_to_the_chat_stage() {
        assert_eq!(
            next_transition(Stage::Classify, None, O::Classified(TaskKind::Chat)),
            Continue(Stage::Chat)
        );
        assert_eq!(
            next_transition(Stage::Chat, Some(TaskKind::Chat), O::Completed),
            Finish(M::Success)
        );
    }

    #[test]
    fn execute_tasks_go_to_selection() {
        for task in [TaskKind::ExecuteFunction, TaskKind::ExecuteFunctionPlan] {
            assert_eq!(
                next_transition(Stage::Classify, None, O::Classified(task)),
                Continue(Stage::SelectOperation)
            );
        }
    }

    #[test]
    fn former_result_tasks_resolve_references_first() {
        let routes = [
            (TaskKind::ExplainFormerResult, Stage::ExplainFormerResult),
            (TaskKind::PlotFormerResult, Stage::Visualize),
            (TaskKind::ExecuteFunctionOnFormerResult, Stage::SelectOperation),
        ];
        for (task, target) in routes {
            assert_eq!(
                next_transition(Stage::Classify, None, O::Classified(task)),
                Continue(Stage::ResolveReferences)
            );
            assert_eq!(
                next_transition(Stage::ResolveReferences, Some(task), O::ReferencesResolved),
                Continue(target)
            );
        }
    }

    #[test]
    fn discard_loops_back_until_budget_exhausted() {
        for stage in [Stage::AssessUsability, Stage::ExtractParameters] {
            assert_eq!(
                next_transition(stage, None, O::Discarded { budget_exhausted: false }),
                Continue(Stage::SelectOperation)
            );
            assert_eq!(
                next_transition(stage, None, O::Discarded { budget_exhausted: true }),
                Finish(M::Error)
            );
        }
    }

    #[test]
    fn pending_parameters_suspend() {
        assert_eq!(
            next_transition(Stage::ExtractParameters, None, O::ParametersPending),
            Suspend
        );
        assert!(Stage::ExtractParameters.is_resumable());
        assert!(!Stage::Classify.is_resumable());
    }

    #[test]
    fn happy_path_ends_in_describe() {
        let task = Some(TaskKind::ExecuteFunction);
        assert_eq!(
            next_transition(Stage::SelectOperation, task, O::OperationSelected),
            Continue(Stage::AssessUsability)
        );
        assert_eq!(
            next_transition(Stage::AssessUsability, task, O::Usable),
            Continue(Stage::ExtractParameters)
        );
        assert_eq!(
            next_transition(Stage::ExtractParameters, task, O::ParametersReady),
            Continue(Stage::Execute)
        );
        assert_eq!(
            next_transition(Stage::Execute, task, O::Executed),
            Continue(Stage::Describe)
        );
        assert_eq!(
            next_transition(Stage::Describe, task, O::Completed),
            Finish(M::Success)
        );
    }

    #[test]
    fn no_operation_is_no_match() {
        assert_eq!(
            next_transition(Stage::SelectOperation, None, O::NoOperation),
            Finish(M::NoMatch)
        );
    }

    #[test]
    fn failures_and_impossible_pairs_finish_with_error() {
        for stage in [
            Stage::Classify,
            Stage::ResolveReferences,
            Stage::SelectOperation,
            Stage::ExtractParameters,
            Stage::Execute,
            Stage::Visualize,
        ] {
            assert_eq!(next_transition(stage, None, O::Failed), Finish(M::Error));
        }
        assert_eq!(
            next_transition(Stage::Execute, None, O::Usable),
            Finish(M::Error)
        );
        assert_eq!(
            next_transition(Stage::ResolveReferences, None, O::ReferencesResolved),
            Finish(M::Error)
        );
    }

    #[test]
    fn discard_selected_moves_candidate() {
        let mut state = TurnState::new("q");
        state.selected_operation = Some("a".into());
        state.extracted_parameters.insert("x".into(), Value::from(1));
        assert_eq!(state.discard_selected().as_deref(), Some("a"));
        assert_eq!(state.discarded_operations, vec!["a"]);
        assert!(state.selected_operation.is_none());
        assert!(state.extracted_parameters.is_empty());
        assert!(state.discard_selected().is_none());
    }

    #[test]
    fn stage_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Stage::ExtractParameters).unwrap(),
            "\"extract_parameters\""
        );
        assert_eq!(Stage::ResolveReferences.to_string(), "resolve_references");
    }
}
