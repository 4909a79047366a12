//! Parameter extractor.
//!
//! Works on its own append-only dialogue, seeded once per request and grown
//! only by the assistant's questions and the user's answers. A `pending`
//! outcome suspends the request until the user replies.

use serde_json::{Map, Value};

use super::errors::{AttemptError, StageError};
use super::prompts;
use super::registry::OperationDescriptor;
use super::retrier::{json_object, optional_str, required_str, StageCall};
use super::turn_state::{ExtractionEntry, Stage, TurnState};
use super::types::MessageView;

/// Outcome of one extraction round.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionResult {
    Success {
        parameters: Map<String, Value>,
        /// Note on defaulted values, shown to the describer.
        assumptions: Option<String>,
    },
    Pending {
        missing_fields: Vec<String>,
        explanation: Option<String>,
    },
    Abort {
        reason: String,
    },
}

impl ExtractionResult {
    /// The question put to the user for a `Pending` result.
    pub fn question(&self) -> Option<String> {
        match self {
            ExtractionResult::Pending {
                explanation: Some(text),
                ..
            } => Some(text.clone()),
            ExtractionResult::Pending { missing_fields, .. } => {
                Some(format!("Please provide: {}", missing_fields.join(", ")))
            }
            _ => None,
        }
    }
}

/// Seed the extraction dialogue for a fresh request.
///
/// Reference-dependent requests also see the referenced messages.
pub fn seed_history(state: &mut TurnState, referenced: &[MessageView]) {
    if !state.extraction_history.is_empty() {
        return;
    }
    let mut opening = state.utterance.clone();
    if !referenced.is_empty() {
        opening.push_str("\n\nReferenced messages:\n");
        opening.push_str(&prompts::render_history(referenced));
    }
    state.push_clarification(opening);
}

/// Ask the oracle for concrete parameter values.
pub async fn extract_parameters(
    call: &StageCall<'_>,
    descriptor: &OperationDescriptor,
    history: &[ExtractionEntry],
) -> Result<ExtractionResult, StageError> {
    let prompt = prompts::extraction_prompt(descriptor, history);
    call.invoke(Stage::ExtractParameters, &prompt, |raw| {
        parse_extraction(raw, descriptor)
    })
    .await
}

fn parse_extraction(raw: &str, descriptor: &OperationDescriptor) -> Result<ExtractionResult, AttemptError> {
    let map = json_object(raw)?;

    match required_str(&map, "status")? {
        "success" => {
            let parameters = match map.get("parameters") {
                Some(Value::Object(params)) => params.clone(),
                None | Some(Value::Null) => Map::new(),
                Some(_) => return Err(AttemptError::invalid("'parameters' must be an object")),
            };
            if let Some(unknown) = parameters
                .keys()
                .find(|k| !descriptor.parameter_names.contains(k))
            {
                return Err(AttemptError::invalid(format!(
                    "'{unknown}' is not a parameter of {}",
                    descriptor.name
                )));
            }
            Ok(ExtractionResult::Success {
                parameters,
                assumptions: optional_str(&map, "assumptions"),
            })
        }
        "pending" => {
            let missing_fields: Vec<String> = match map.get("missing_fields") {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
                _ => Vec::new(),
            };
            let explanation = optional_str(&map, "explanation");
            if missing_fields.is_empty() && explanation.is_none() {
                return Err(AttemptError::invalid(
                    "pending needs missing_fields or an explanation",
                ));
            }
            Ok(ExtractionResult::Pending {
                missing_fields,
                explanation,
            })
        }
        "abort" => Ok(ExtractionResult::Abort {
            reason: optional_str(&map, "reason").unwrap_or_else(|| "cannot be parameterized".into()),
        }),
        other => Err(AttemptError::invalid(format!("unknown status '{other}'"))),
    }
}
