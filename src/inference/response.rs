//! Decoding of non-streaming chat completion bodies.

use super::errors::InferenceError;
use super::types::ChatCompletionResponse;

/// Pull the assistant text out of a `/chat/completions` response body.
///
/// Only `content` is used. Reasoning models put chain-of-thought in a separate
/// `reasoning` field; when they exhaust `max_tokens` while thinking, `content`
/// is empty and this returns `EmptyResponse` so the caller can retry.
pub fn parse_completion_body(body: &str, model: &str) -> Result<String, InferenceError> {
    let resp: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::ResponseParseError {
            reason: format!("failed to parse completion response: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| InferenceError::ResponseParseError {
            reason: "empty choices array".into(),
        })?;

    match choice.message.content {
        Some(content) if !content.trim().is_empty() => Ok(content),
        _ => {
            tracing::warn!(
                model = %model,
                finish_reason = ?choice.finish_reason,
                "completion carried no content"
            );
            Err(InferenceError::EmptyResponse {
                model: model.to_string(),
            })
        }
    }
}
