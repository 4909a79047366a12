//! Result describer, former-result explainer and visualization chooser.
//!
//! The describer never fails: when the oracle cannot produce an acceptable
//! explanation, a templated one is used instead.

use serde_json::{Map, Value};

use super::errors::{AttemptError, StageError};
use super::prompts;
use super::retrier::{json_object, required_str, StageCall};
use super::turn_state::Stage;
use super::types::{ConversationMessage, StructuredResult};

/// Sentence appended when a visualizable result lacks an invitation.
pub const VISUALIZATION_INVITE: &str =
    "If you like, I can visualize this result for you. Just ask for a plot.";

/// Phrases that offer the user a chart. Mentioning a chart is not enough.
const INVITE_PHRASES: &[&str] = &[
    "can visualize",
    "can visualise",
    "can plot",
    "can chart",
    "can draw",
    "ask for a plot",
    "ask for a chart",
    "ask for a visualization",
    "ask for a graph",
    "request a plot",
    "request a chart",
    "request a visualization",
    "want me to plot",
    "want me to visualize",
    "want me to chart",
    "like me to plot",
    "like me to visualize",
    "like me to chart",
    "like a chart",
    "like a plot",
];

/// Nouns naming a rendered figure.
const FIGURE_NOUNS: &[&str] = &[
    "chart",
    "plot",
    "graph",
    "figure",
    "diagram",
    "visualization",
    "visualisation",
];

/// Words that, right after a figure noun, describe it as already present.
const FIGURE_PRESENT_WORDS: &[&str] = &[
    "shows",
    "showed",
    "illustrates",
    "displays",
    "depicts",
    "highlights",
    "reveals",
    "indicates",
    "above",
    "below",
];

/// Phrases claiming a chart already exists.
const PRODUCED_MARKERS: &[&str] = &[
    "here is the chart",
    "here is the plot",
    "here's the chart",
    "here's the plot",
    "i have plotted",
    "i've plotted",
    "i have created a chart",
    "i've created a chart",
    "i have visualized",
    "i've visualized",
    "the chart above",
    "the chart below",
    "the plot above",
    "the plot below",
    "see the chart",
    "see the plot",
];

/// Explain a freshly computed result to the user.
pub async fn describe_result(
    call: &StageCall<'_>,
    utterance: &str,
    subject: &str,
    parameters: &Map<String, Value>,
    assumptions: Option<&str>,
    result: &StructuredResult,
) -> String {
    let summary = result.summary();
    let prompt = prompts::describe_prompt(utterance, subject, parameters, assumptions, &summary);

    let described = call
        .invoke(Stage::Describe, &prompt, |raw| parse_description(raw, result))
        .await;

    let text = match described {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "describer exhausted, using template");
            template_description(subject, parameters, assumptions)
        }
    };
    ensure_invitation(text, result)
}

fn parse_description(raw: &str, result: &StructuredResult) -> Result<String, AttemptError> {
    let map = json_object(raw)?;
    let text = required_str(&map, "explanation")?;
    if !result.already_visualized && claims_visualization(text) {
        return Err(AttemptError::invalid("claims a visualization that does not exist"));
    }
    Ok(text.to_string())
}

fn claims_visualization(text: &str) -> bool {
    let lower = text.to_lowercase();
    if PRODUCED_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    // Whole words only: "paragraph" is not a graph.
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    words.windows(2).any(|pair| {
        FIGURE_NOUNS.contains(&pair[0]) && FIGURE_PRESENT_WORDS.contains(&pair[1])
    })
}

fn offers_visualization(text: &str) -> bool {
    let lower = text.to_lowercase();
    INVITE_PHRASES.iter().any(|p| lower.contains(p))
}

/// Append [`VISUALIZATION_INVITE`] when the result needs one and lacks it.
pub fn ensure_invitation(text: String, result: &StructuredResult) -> String {
    if !result.needs_visualization_invite() {
        return text;
    }
    if offers_visualization(&text) {
        return text;
    }
    format!("{} {VISUALIZATION_INVITE}", text.trim_end())
}

fn template_description(
    subject: &str,
    parameters: &Map<String, Value>,
    assumptions: Option<&str>,
) -> String {
    let mut text = if parameters.is_empty() {
        format!("I ran {subject}.")
    } else {
        format!("I ran {subject} with {}.", Value::Object(parameters.clone()))
    };
    if let Some(note) = assumptions {
        text.push_str(&format!(" Assumptions: {note}"));
    }
    text
}

/// Explain earlier results, using their full payloads.
pub async fn explain_former_result(
    call: &StageCall<'_>,
    utterance: &str,
    referenced: &[ConversationMessage],
    payload_limit: usize,
) -> Result<String, StageError> {
    let prompt = prompts::explain_prompt(utterance, referenced, payload_limit);
    call.invoke(Stage::ExplainFormerResult, &prompt, |raw| {
        let map = json_object(raw)?;
        Ok(required_str(&map, "explanation")?.to_string())
    })
    .await
}

/// Choose one of `options`. A single option is returned without asking.
pub async fn choose_visualization(
    call: &StageCall<'_>,
    utterance: &str,
    options: &[String],
) -> Result<String, StageError> {
    if let [only] = options {
        return Ok(only.clone());
    }
    let prompt = prompts::visualization_prompt(utterance, options);
    call.invoke(Stage::Visualize, &prompt, |raw| {
        let map = json_object(raw)?;
        let choice = required_str(&map, "visualization")?;
        options
            .iter()
            .find(|o| o.as_str() == choice)
            .cloned()
            .ok_or_else(|| AttemptError::invalid(format!("'{choice}' is not an option")))
    })
    .await
}
