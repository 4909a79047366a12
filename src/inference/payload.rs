//! Extraction of the JSON payload from a raw oracle completion.
//!
//! Models wrap their answer in all sorts of noise: `<think>` blocks, markdown
//! code fences, a sentence of preamble, trailing commas. Every stage expects a
//! single JSON object, so this module digs it out and applies light repairs
//! before handing it to `serde_json`.

use serde_json::{Map, Value};

/// Tags whose content is model reasoning and never part of the answer.
const REASONING_TAGS: &[&str] = &["think", "thinking", "reasoning"];

/// Extract the first JSON object from a completion.
///
/// Returns `None` when no parseable object can be found, which the stage
/// treats as a malformed response and retries.
pub fn extract_json_object(raw: &str) -> Option<Map<String, Value>> {
    let cleaned = strip_code_fences(&strip_reasoning_blocks(raw));
    let candidate = outermost_object(&cleaned)?;

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
        return Some(map);
    }

    let repaired = repair_trailing_commas(&repair_control_characters(candidate));
    match serde_json::from_str::<Value>(&repaired) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Plain-text answer with reasoning and fences removed.
///
/// Used by stages that accept free text as a fallback.
pub fn clean_text(raw: &str) -> String {
    strip_code_fences(&strip_reasoning_blocks(raw)).trim().to_string()
}

/// Remove `<think>…</think>` style blocks, including an unterminated one.
fn strip_reasoning_blocks(input: &str) -> String {
    let mut text = input.to_string();
    for tag in REASONING_TAGS {
        let open = format!("<{tag}>");
        let close = format!("</{tag}>");
        while let Some(start) = text.find(&open) {
            match text[start..].find(&close) {
                Some(rel_end) => {
                    let end = start + rel_end + close.len();
                    text.replace_range(start..end, "");
                }
                None => {
                    text.truncate(start);
                    break;
                }
            }
        }
    }
    text
}

/// Drop markdown fence lines (```json, ```), keeping their contents.
fn strip_code_fences(input: &str) -> String {
    input
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Slice of `input` spanning the first balanced `{ … }`, string-aware.
///
/// When the braces never balance (truncated completion) the slice runs to the
/// end of the input so the repair pass can still try.
fn outermost_object(input: &str) -> Option<&str> {
    let start = input.find('{')?;
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (offset, ch) in input[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&input[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Remove trailing commas before `}` or `]`.
fn repair_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut result = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &ch) in chars.iter().enumerate() {
        if escape_next {
            escape_next = false;
            result.push(ch);
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
        } else if ch == '"' {
            in_string = !in_string;
        } else if ch == ',' && !in_string {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        result.push(ch);
    }

    result
}

/// Remove non-printable control characters. Keeps `\n`, `\r`, `\t`.
fn repair_control_characters(input: &str) -> String {
    input
        .chars()
        .filter(|&c| !c.is_control() || c == '\n' || c == '\r' || c == '\t')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_object() {
        let map = extract_json_object(r#"{"task": "chat"}"#).unwrap();
        assert_eq!(map["task"], "chat");
    }

    #[test]
    fn test_fenced_object_with_preamble() {
        let raw = "Sure, here is the answer:\n```json\n{\"function\": \"mean_utilization\", \"reason\": \"fits\"}\n```\nHope it helps.";
        let map = extract_json_object(raw).unwrap();
        assert_eq!(map["function"], "mean_utilization");
    }

    #[test]
    fn test_think_block_is_ignored() {
        let raw = "<think>maybe {\"task\": \"wrong\"}</think>{\"task\": \"execute_function\"}";
        let map = extract_json_object(raw).unwrap();
        assert_eq!(map["task"], "execute_function");
    }

    #[test]
    fn test_unterminated_think_block_yields_nothing() {
        assert!(extract_json_object("<think>still going {\"task\": \"chat\"}").is_none());
    }

    #[test]
    fn test_trailing_comma_repaired() {
        let raw = r#"{"message_ids": [2, 4,], "note": "a, b",}"#;
        let map = extract_json_object(raw).unwrap();
        assert_eq!(map["message_ids"], serde_json::json!([2, 4]));
        assert_eq!(map["note"], "a, b");
    }

    #[test]
    fn test_braces_inside_strings() {
        let raw = r#"{"explanation": "use {weekday} grouping", "x": 1} trailing"#;
        let map = extract_json_object(raw).unwrap();
        assert_eq!(map["explanation"], "use {weekday} grouping");
    }

    #[test]
    fn test_no_object() {
        assert!(extract_json_object("I cannot help with that").is_none());
        assert!(extract_json_object("[1, 2, 3]").is_none());
    }

    #[test]
    fn test_clean_text() {
        let raw = "<think>hmm</think>\n```\nHello there\n```";
        assert_eq!(clean_text(raw), "Hello there");
    }
}
