//! Task classifier and the standalone chat answer.

use super::errors::{AttemptError, StageError};
use super::prompts;
use super::retrier::{json_object, optional_str, required_str, StageCall};
use super::turn_state::Stage;
use super::types::{MessageView, TaskKind};
use crate::inference::payload::clean_text;

/// Decide the high-level intent of `utterance`.
pub async fn classify(
    call: &StageCall<'_>,
    utterance: &str,
    history: &[MessageView],
) -> Result<TaskKind, StageError> {
    let prompt = prompts::classify_prompt(utterance, history);
    call.invoke(Stage::Classify, &prompt, parse_classification).await
}

fn parse_classification(raw: &str) -> Result<TaskKind, AttemptError> {
    let map = json_object(raw)?;
    let task = required_str(&map, "task")?;
    TaskKind::parse(task).ok_or_else(|| AttemptError::invalid(format!("unknown task '{task}'")))
}

/// Answer a `chat` request directly. Never touches the registry.
///
/// Accepts `{"response": …}` or, failing that, any non-empty plain text.
pub async fn answer_chat(
    call: &StageCall<'_>,
    utterance: &str,
    history: &[MessageView],
) -> Result<String, StageError> {
    let prompt = prompts::chat_prompt(utterance, history);
    call.invoke(Stage::Chat, &prompt, parse_chat_answer).await
}

fn parse_chat_answer(raw: &str) -> Result<String, AttemptError> {
    if let Ok(map) = json_object(raw) {
        return optional_str(&map, "response")
            .ok_or_else(|| AttemptError::invalid("missing 'response'"));
    }
    let text = clean_text(raw);
    if text.is_empty() {
        return Err(AttemptError::invalid("empty answer"));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::prompts::{CHAT_HEADING, CLASSIFY_HEADING};
    use crate::agent_core::testing::ScriptedOracle;

    #[test]
    fn classification_rejects_unknown_tasks() {
        assert_eq!(
            parse_classification(r#"{"task": "plot_former_result"}"#).unwrap(),
            TaskKind::PlotFormerResult
        );
        assert!(parse_classification(r#"{"task": "dance"}"#).is_err());
        assert!(parse_classification("chat").is_err());
    }

    #[test]
    fn chat_answer_accepts_plain_text() {
        assert_eq!(parse_chat_answer("Hello! How can I help?").unwrap(), "Hello! How can I help?");
        assert_eq!(parse_chat_answer(r#"{"response": "Hi"}"#).unwrap(), "Hi");
        assert!(parse_chat_answer(r#"{"answer": "Hi"}"#).is_err());
        assert!(parse_chat_answer("<think>...</think>").is_err());
    }

    #[tokio::test]
    async fn classify_retries_past_bad_task() {
        let oracle = ScriptedOracle::new();
        oracle
            .push(CLASSIFY_HEADING, r#"{"task": "analysis"}"#)
            .push(CLASSIFY_HEADING, r#"```json
{"task": "execute_function"}
```"#);
        let call = StageCall::new(&oracle, 5);
        let task = classify(&call, "weekday breakdown?", &[]).await.unwrap();
        assert_eq!(task, TaskKind::ExecuteFunction);
        assert_eq!(oracle.calls_for(CLASSIFY_HEADING), 2);
    }

    #[tokio::test]
    async fn chat_uses_its_own_prompt() {
        let oracle = ScriptedOracle::new();
        oracle.push(CHAT_HEADING, r#"{"response": "I analyse desk bookings."}"#);
        let call = StageCall::new(&oracle, 5);
        let answer = answer_chat(&call, "what can you do?", &[]).await.unwrap();
        assert_eq!(answer, "I analyse desk bookings.");
        assert!(oracle.prompts_for(CHAT_HEADING)[0].contains("what can you do?"));
    }
}
