//! Reference resolver: which earlier messages does the utterance mean?

use serde_json::Value;

use super::errors::{AttemptError, StageError};
use super::prompts;
use super::retrier::{json_object, StageCall};
use super::turn_state::Stage;
use super::types::MessageView;

/// Resolve the ids of the messages `utterance` refers to.
///
/// `last_id` is the highest id that may be referenced; the current user
/// message is excluded by the caller. The result is non-empty, deduplicated
/// and in the oracle's order of relevance.
pub async fn resolve_references(
    call: &StageCall<'_>,
    utterance: &str,
    history: &[MessageView],
    last_id: i64,
) -> Result<Vec<i64>, StageError> {
    let prompt = prompts::references_prompt(utterance, history);
    call.invoke(Stage::ResolveReferences, &prompt, |raw| {
        parse_references(raw, last_id)
    })
    .await
}

fn parse_references(raw: &str, last_id: i64) -> Result<Vec<i64>, AttemptError> {
    let map = json_object(raw)?;
    let ids = map
        .get("message_ids")
        .and_then(Value::as_array)
        .ok_or_else(|| AttemptError::invalid("missing 'message_ids' array"))?;

    let mut resolved = Vec::with_capacity(ids.len());
    for id in ids {
        let id = id
            .as_i64()
            .ok_or_else(|| AttemptError::invalid(format!("message id {id} is not an integer")))?;
        if id < 1 || id > last_id {
            return Err(AttemptError::invalid(format!("message id {id} does not exist")));
        }
        if !resolved.contains(&id) {
            resolved.push(id);
        }
    }

    if resolved.is_empty() {
        return Err(AttemptError::invalid("no message referenced"));
    }
    Ok(resolved)
}
