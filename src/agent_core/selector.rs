//! Operation selector and usability assessor.
//!
//! The selector proposes one operation from the turn registry; the assessor
//! double-checks it against the query. A rejected candidate is discarded by
//! the orchestrator and the selector runs again on what is left.

use serde_json::Value;

use super::errors::{AttemptError, StageError};
use super::prompts;
use super::registry::{OperationDescriptor, TurnRegistry};
use super::retrier::{json_object, optional_str, StageCall};
use super::turn_state::Stage;
use super::types::MessageView;

/// Message used when the oracle declines without giving a reason.
pub const DEFAULT_NO_MATCH_REASON: &str = "I couldn't find a suitable function for this request.";

/// Outcome of the selection stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionResult {
    Selected { name: String, reason: Option<String> },
    /// Nothing in the registry fits; `reason` is shown to the user.
    NoneSuitable { reason: String },
}

/// Verdict of the usability assessment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsabilityVerdict {
    Usable,
    Abort { reason: String },
}

/// Pick a candidate operation among those still in `registry`.
pub async fn select_operation(
    call: &StageCall<'_>,
    utterance: &str,
    referenced: &[MessageView],
    registry: &TurnRegistry<'_>,
) -> Result<SelectionResult, StageError> {
    let available: Vec<&OperationDescriptor> = registry.available().collect();
    let prompt = prompts::selection_prompt(utterance, referenced, &available);
    call.invoke(Stage::SelectOperation, &prompt, |raw| {
        parse_selection(raw, registry)
    })
    .await
}

fn parse_selection(raw: &str, registry: &TurnRegistry<'_>) -> Result<SelectionResult, AttemptError> {
    let map = json_object(raw)?;
    let reason = optional_str(&map, "reason");

    match map.get("function") {
        Some(Value::Null) => Ok(SelectionResult::NoneSuitable {
            reason: reason.unwrap_or_else(|| DEFAULT_NO_MATCH_REASON.to_string()),
        }),
        Some(Value::String(name)) if registry.contains(name.trim()) => Ok(SelectionResult::Selected {
            name: name.trim().to_string(),
            reason,
        }),
        Some(Value::String(name)) => Err(AttemptError::invalid(format!(
            "'{name}' is not an available function"
        ))),
        Some(_) => Err(AttemptError::invalid("'function' must be a string or null")),
        None => Err(AttemptError::invalid("missing 'function'")),
    }
}

/// Confirm that `descriptor` can plausibly answer the query.
pub async fn assess_usability(
    call: &StageCall<'_>,
    utterance: &str,
    referenced: &[MessageView],
    descriptor: &OperationDescriptor,
) -> Result<UsabilityVerdict, StageError> {
    let prompt = prompts::assessment_prompt(utterance, referenced, descriptor);
    call.invoke(Stage::AssessUsability, &prompt, parse_verdict).await
}

fn parse_verdict(raw: &str) -> Result<UsabilityVerdict, AttemptError> {
    let map = json_object(raw)?;
    match map.get("status").and_then(Value::as_str).map(str::trim) {
        Some("success") => Ok(UsabilityVerdict::Usable),
        Some("abort") => Ok(UsabilityVerdict::Abort {
            reason: optional_str(&map, "reason").unwrap_or_else(|| "not usable".to_string()),
        }),
        Some(other) => Err(AttemptError::invalid(format!("unknown status '{other}'"))),
        None => Err(AttemptError::invalid("missing 'status'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::errors::OperationError;
    use crate::agent_core::prompts::SELECT_HEADING;
    use crate::agent_core::registry::{DataHandle, OperationRegistry};
    use crate::agent_core::testing::ScriptedOracle;
    use crate::agent_core::types::StructuredResult;
    use serde_json::Map;

    fn noop(_: &DataHandle, _: &Map<String, Value>) -> Result<StructuredResult, OperationError> {
        Ok(StructuredResult::default())
    }

    fn registry() -> OperationRegistry {
        let mut reg = OperationRegistry::new();
        reg.register("mean_utilization", "Mean utilization.", &[], noop)
            .register("weekday_breakdown", "Bookings per weekday.", &[], noop);
        reg
    }

    #[test]
    fn selection_validates_against_turn_registry() {
        let reg = registry();
        let view = reg.turn_view(&[]);
        assert_eq!(
            parse_selection(r#"{"function": "weekday_breakdown", "reason": "fits"}"#, &view).unwrap(),
            SelectionResult::Selected {
                name: "weekday_breakdown".into(),
                reason: Some("fits".into())
            }
        );

        let view = reg.turn_view(&["weekday_breakdown".to_string()]);
        assert!(parse_selection(r#"{"function": "weekday_breakdown"}"#, &view).is_err());
        assert!(parse_selection(r#"{"function": "make_coffee"}"#, &view).is_err());
        assert!(parse_selection(r#"{"function": 3}"#, &view).is_err());
    }

    #[test]
    fn null_selection_carries_reason() {
        let reg = registry();
        let view = reg.turn_view(&[]);
        assert_eq!(
            parse_selection(r#"{"function": null, "reason": "No weather data."}"#, &view).unwrap(),
            SelectionResult::NoneSuitable {
                reason: "No weather data.".into()
            }
        );
        assert_eq!(
            parse_selection(r#"{"function": null}"#, &view).unwrap(),
            SelectionResult::NoneSuitable {
                reason: DEFAULT_NO_MATCH_REASON.into()
            }
        );
    }

    #[test]
    fn verdict_parsing() {
        assert_eq!(parse_verdict(r#"{"status": "success"}"#).unwrap(), UsabilityVerdict::Usable);
        assert_eq!(
            parse_verdict(r#"{"status": "abort", "reason": "wrong metric"}"#).unwrap(),
            UsabilityVerdict::Abort {
                reason: "wrong metric".into()
            }
        );
        assert!(parse_verdict(r#"{"status": "maybe"}"#).is_err());
    }

    #[tokio::test]
    async fn discarded_names_are_not_offered() {
        let reg = registry();
        let view = reg.turn_view(&["mean_utilization".to_string()]);

        let oracle = ScriptedOracle::new();
        oracle.push(SELECT_HEADING, r#"{"function": "weekday_breakdown"}"#);
        let call = StageCall::new(&oracle, 5);
        select_operation(&call, "weekday?", &[], &view).await.unwrap();

        let prompt = &oracle.prompts_for(SELECT_HEADING)[0];
        assert!(prompt.contains("weekday_breakdown"));
        assert!(!prompt.contains("mean_utilization"));
    }
}
