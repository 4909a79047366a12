//! Prompt builders for every pipeline stage.
//!
//! Each prompt opens with a fixed `### …` heading naming the stage. The oracle
//! is stateless, so every prompt carries the full context it needs, and a
//! prompt is a pure function of its inputs: resending it is always safe.

use serde_json::{Map, Value};

use super::registry::OperationDescriptor;
use super::tokens::truncate_payload;
use super::turn_state::ExtractionEntry;
use super::types::{ConversationMessage, MessageView, ResultSummary, TaskKind};

// ─── Stage Headings ─────────────────────────────────────────────────────────

pub const CLASSIFY_HEADING: &str = "### Task classification";
pub const CHAT_HEADING: &str = "### Conversational answer";
pub const REFERENCES_HEADING: &str = "### Reference resolution";
pub const SELECT_HEADING: &str = "### Function selection";
pub const ASSESS_HEADING: &str = "### Usability assessment";
pub const EXTRACT_HEADING: &str = "### Parameter extraction";
pub const DESCRIBE_HEADING: &str = "### Result description";
pub const EXPLAIN_HEADING: &str = "### Former result explanation";
pub const VISUALIZE_HEADING: &str = "### Visualization selection";

/// All headings, for tooling that needs to tell prompts apart.
pub const ALL_HEADINGS: [&str; 9] = [
    CLASSIFY_HEADING,
    CHAT_HEADING,
    REFERENCES_HEADING,
    SELECT_HEADING,
    ASSESS_HEADING,
    EXTRACT_HEADING,
    DESCRIBE_HEADING,
    EXPLAIN_HEADING,
    VISUALIZE_HEADING,
];

const ASSISTANT_ROLE: &str = "You are a smart assistant for a desk booking analytics system. \
Users ask about desk bookings, utilization, attendance forecasts and workplace policies.";

// ─── Rendering Helpers ──────────────────────────────────────────────────────

/// Render stripped messages as pretty JSON, or a placeholder when empty.
pub fn render_history(history: &[MessageView]) -> String {
    if history.is_empty() {
        return "(no previous messages)".to_string();
    }
    serde_json::to_string_pretty(history).unwrap_or_default()
}

fn render_descriptor(descriptor: &OperationDescriptor) -> String {
    let params = if descriptor.parameter_names.is_empty() {
        "none".to_string()
    } else {
        descriptor.parameter_names.join(", ")
    };
    format!(
        "- {}: {}\n  parameters: {}",
        descriptor.name,
        descriptor.documentation.trim(),
        params
    )
}

fn render_extraction_history(entries: &[ExtractionEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{}: {}", e.role.as_str(), e.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn task_list() -> String {
    TaskKind::ALL
        .iter()
        .map(|t| {
            let what = match t {
                TaskKind::Chat => "small talk or questions that need no data analysis",
                TaskKind::ExecuteFunction => "compute a new result from the booking data",
                TaskKind::ExplainFormerResult => "explain or discuss a result shown earlier",
                TaskKind::ExecuteFunctionOnFormerResult => {
                    "compute something new based on an earlier result"
                }
                TaskKind::PlotFormerResult => "visualize a result shown earlier",
                TaskKind::ExecuteFunctionPlan => "a request that needs several analysis steps",
            };
            format!("- {}: {}", t.as_str(), what)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Prompts ────────────────────────────────────────────────────────────────

pub fn classify_prompt(utterance: &str, history: &[MessageView]) -> String {
    format!(
        "{CLASSIFY_HEADING}\n{ASSISTANT_ROLE}\n\n\
         Decide what the user wants with their latest message. Pick exactly one task:\n{tasks}\n\n\
         ### Conversation history\n{history}\n\n\
         ### User message\n{utterance}\n\n\
         ### Response format\n\
         Respond with one JSON object and nothing else: {{\"task\": \"<task>\"}}",
        tasks = task_list(),
        history = render_history(history),
    )
}

pub fn chat_prompt(utterance: &str, history: &[MessageView]) -> String {
    format!(
        "{CHAT_HEADING}\n{ASSISTANT_ROLE}\n\n\
         Answer the user's message conversationally. Do not invent numbers about the \
         booking data; if they ask for an analysis, tell them you can run one.\n\n\
         ### Conversation history\n{history}\n\n\
         ### User message\n{utterance}\n\n\
         ### Response format\n\
         Respond with one JSON object: {{\"response\": \"<your answer>\"}}",
        history = render_history(history),
    )
}

pub fn references_prompt(utterance: &str, history: &[MessageView]) -> String {
    format!(
        "{REFERENCES_HEADING}\n{ASSISTANT_ROLE}\n\n\
         The user's message refers to one or more earlier messages. Identify them by id, \
         most relevant first.\n\n\
         ### Conversation history\n{history}\n\n\
         ### User message\n{utterance}\n\n\
         ### Response format\n\
         Respond with one JSON object: {{\"message_ids\": [<id>, ...]}}",
        history = render_history(history),
    )
}

pub fn selection_prompt(
    utterance: &str,
    referenced: &[MessageView],
    available: &[&OperationDescriptor],
) -> String {
    let functions = available
        .iter()
        .map(|d| render_descriptor(d))
        .collect::<Vec<_>>()
        .join("\n");
    let context = if referenced.is_empty() {
        String::new()
    } else {
        format!("### Referenced messages\n{}\n\n", render_history(referenced))
    };

    format!(
        "{SELECT_HEADING}\n{ASSISTANT_ROLE}\n\n\
         Select the single most appropriate function from the list below. Never invent \
         a function. If none fits, return null and explain why.\n\n\
         ### Available functions\n{functions}\n\n\
         {context}\
         ### User query\n{utterance}\n\n\
         ### Response format\n\
         Respond with one JSON object: {{\"function\": \"<name or null>\", \"reason\": \"<why>\"}}"
    )
}

pub fn assessment_prompt(
    utterance: &str,
    referenced: &[MessageView],
    descriptor: &OperationDescriptor,
) -> String {
    let context = if referenced.is_empty() {
        String::new()
    } else {
        format!("### Referenced messages\n{}\n\n", render_history(referenced))
    };

    format!(
        "{ASSESS_HEADING}\n{ASSISTANT_ROLE}\n\n\
         Judge whether the function below can answer the user's query. Answer abort if \
         it computes something different from what was asked.\n\n\
         ### Function\n{function}\n\n\
         {context}\
         ### User query\n{utterance}\n\n\
         ### Response format\n\
         Respond with one JSON object: {{\"status\": \"success\" | \"abort\", \"reason\": \"<why>\"}}",
        function = render_descriptor(descriptor),
    )
}

pub fn extraction_prompt(descriptor: &OperationDescriptor, history: &[ExtractionEntry]) -> String {
    format!(
        "{EXTRACT_HEADING}\n{ASSISTANT_ROLE}\n\n\
         Fill in the parameters of the function below from what the user said. Use \
         sensible defaults where a value can reasonably be assumed and list those \
         assumptions. If a value is required and cannot be assumed, ask for it. If the \
         function cannot be used for this request at all, abort.\n\n\
         ### Function\n{function}\n\n\
         ### Dialogue\n{dialogue}\n\n\
         ### Response format\n\
         Respond with exactly one JSON object of one of these forms:\n\
         {{\"status\": \"success\", \"parameters\": {{\"<name>\": <value>}}, \"assumptions\": \"<defaults used>\"}}\n\
         {{\"status\": \"pending\", \"missing_fields\": [\"<name>\"], \"explanation\": \"<question for the user>\"}}\n\
         {{\"status\": \"abort\", \"reason\": \"<why>\"}}",
        function = render_descriptor(descriptor),
        dialogue = render_extraction_history(history),
    )
}

pub fn describe_prompt(
    utterance: &str,
    subject: &str,
    parameters: &Map<String, Value>,
    assumptions: Option<&str>,
    summary: &ResultSummary,
) -> String {
    let visualization_rule = if summary.visualizable && !summary.already_visualized {
        "The result can be visualized but no chart exists yet. Invite the user to ask for \
         a visualization and never claim that one was produced."
    } else if summary.already_visualized {
        "A chart of the result has been produced and is shown to the user."
    } else {
        "The result cannot be visualized. Do not mention charts."
    };

    format!(
        "{DESCRIBE_HEADING}\n{ASSISTANT_ROLE}\n\n\
         Explain to the user what was computed for their query, in two or three sentences.\n\
         {visualization_rule}\n\n\
         ### User query\n{utterance}\n\n\
         ### Computation\n{subject}\n\n\
         ### Parameters\n{parameters}\n\n\
         ### Assumptions\n{assumptions}\n\n\
         ### Result\n{summary}\n\n\
         ### Response format\n\
         Respond with one JSON object: {{\"explanation\": \"<text>\"}}",
        parameters = Value::Object(parameters.clone()),
        assumptions = assumptions.unwrap_or("none"),
        summary = serde_json::to_string(summary).unwrap_or_default(),
    )
}

pub fn explain_prompt(utterance: &str, referenced: &[ConversationMessage], payload_limit: usize) -> String {
    let messages = referenced
        .iter()
        .map(|m| {
            let data = m
                .data
                .as_ref()
                .map(|d| truncate_payload(&Value::Object(d.data.clone()), payload_limit))
                .unwrap_or_else(|| "none".to_string());
            format!("[{}] {}: {}\n  data: {}", m.id, m.role.as_str(), m.content, data)
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "{EXPLAIN_HEADING}\n{ASSISTANT_ROLE}\n\n\
         The user asks about earlier results. Answer using only the messages and data \
         below.\n\n\
         ### Referenced messages\n{messages}\n\n\
         ### User message\n{utterance}\n\n\
         ### Response format\n\
         Respond with one JSON object: {{\"explanation\": \"<text>\"}}"
    )
}

pub fn visualization_prompt(utterance: &str, options: &[String]) -> String {
    format!(
        "{VISUALIZE_HEADING}\n{ASSISTANT_ROLE}\n\n\
         Choose the visualization that best fits the user's request.\n\n\
         ### Options\n{options}\n\n\
         ### User message\n{utterance}\n\n\
         ### Response format\n\
         Respond with one JSON object: {{\"visualization\": \"<option>\"}}",
        options = options.join(", "),
    )
}
