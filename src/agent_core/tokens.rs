//! History budgeting: rough token estimates and payload truncation.
//!
//! Estimates are byte-length based: 3.2 bytes per token for prose, 2.8 for
//! serialized JSON.

use super::types::MessageView;

// ─── Constants ──────────────────────────────────────────────────────────────

const PROSE_BYTES_PER_TOKEN: f64 = 3.2;
const JSON_BYTES_PER_TOKEN: f64 = 2.8;

/// Per-message overhead (id, role label, status, formatting).
const MESSAGE_OVERHEAD_TOKENS: u32 = 6;

// ─── Truncation ─────────────────────────────────────────────────────────────

/// Longest prefix of `text` that fits in `max_bytes` without splitting a char.
fn prefix_within(text: &str, max_bytes: usize) -> &str {
    let end = text
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|&end| end <= max_bytes)
        .last()
        .unwrap_or(0);
    &text[..end]
}

/// Serialize a JSON value for a prompt, cutting it at `limit` bytes.
pub fn truncate_payload(value: &serde_json::Value, limit: usize) -> String {
    let text = serde_json::to_string(value).unwrap_or_default();
    if text.len() <= limit {
        return text;
    }
    format!("{}... [truncated]", prefix_within(&text, limit))
}

// ─── Estimates ──────────────────────────────────────────────────────────────

fn estimate(bytes: usize, per_token: f64) -> u32 {
    (bytes as f64 / per_token).ceil() as u32
}

/// Estimated tokens of message text.
pub fn estimate_tokens(text: &str) -> u32 {
    estimate(text.len(), PROSE_BYTES_PER_TOKEN)
}

/// Estimated tokens of a stripped view as rendered into a prompt.
pub fn estimate_view_tokens(view: &MessageView) -> u32 {
    let summary = view
        .data
        .as_ref()
        .and_then(|d| serde_json::to_string(d).ok())
        .map_or(0, |json| estimate(json.len(), JSON_BYTES_PER_TOKEN));
    MESSAGE_OVERHEAD_TOKENS + estimate_tokens(&view.content) + summary
}

/// Keep the newest views whose combined estimate fits in `budget`.
///
/// The most recent view is always kept, even when it alone exceeds the budget.
pub fn trim_to_budget(views: Vec<MessageView>, budget: u32) -> Vec<MessageView> {
    let mut used = 0u32;
    let mut keep_from = views.len();

    for (idx, view) in views.iter().enumerate().rev() {
        let cost = estimate_view_tokens(view);
        if used + cost > budget && keep_from < views.len() {
            break;
        }
        used += cost;
        keep_from = idx;
    }

    views.into_iter().skip(keep_from).collect()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
