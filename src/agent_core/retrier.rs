//! Response validator and retrier shared by every stage.
//!
//! A stage hands over a prompt and a parser. The parser sees the raw
//! completion and either produces the stage's typed result or rejects the
//! attempt. Rejected attempts are retried with the same prompt until the
//! [`RetryBudget`] runs out.

use serde_json::{Map, Value};

use super::errors::{AttemptError, StageError};
use super::turn_state::Stage;
use crate::inference::payload::extract_json_object;
use crate::inference::Oracle;

/// Request-local count of oracle attempts left for one stage call.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    total: u32,
    used: u32,
}

impl RetryBudget {
    /// A budget of `total` attempts. Zero is bumped to one.
    pub fn new(total: u32) -> Self {
        Self {
            total: total.max(1),
            used: 0,
        }
    }

    /// Take one attempt. Returns false when the budget is exhausted.
    pub fn consume(&mut self) -> bool {
        if self.used >= self.total {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        self.total - self.used
    }
}

/// Oracle binding plus the per-stage attempt limit.
#[derive(Clone, Copy)]
pub struct StageCall<'a> {
    pub oracle: &'a dyn Oracle,
    pub retry_budget: u32,
}

impl<'a> StageCall<'a> {
    pub fn new(oracle: &'a dyn Oracle, retry_budget: u32) -> Self {
        Self {
            oracle,
            retry_budget,
        }
    }

    /// Send `prompt` until `parse` accepts a response or the budget runs out.
    pub async fn invoke<T, P>(&self, stage: Stage, prompt: &str, mut parse: P) -> Result<T, StageError>
    where
        P: FnMut(&str) -> Result<T, AttemptError>,
    {
        let mut budget = RetryBudget::new(self.retry_budget);
        let mut last_error = String::from("no attempt made");

        tracing::debug!(
            stage = %stage,
            prompt_chars = prompt.len(),
            oracle = self.oracle.name(),
            "stage prompt built"
        );

        while budget.consume() {
            let attempt = match self.oracle.infer(prompt).await {
                Ok(raw) => parse(&raw),
                Err(e) => Err(AttemptError::from(e)),
            };

            match attempt {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(
                        stage = %stage,
                        attempt = budget.used(),
                        remaining = budget.remaining(),
                        error = %e,
                        "oracle response rejected"
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(StageError::Exhausted {
            stage,
            attempts: budget.used(),
            last_error,
        })
    }
}

// ─── Parsing Helpers ────────────────────────────────────────────────────────

/// The completion's JSON object, or an `Unparseable` rejection.
pub fn json_object(raw: &str) -> Result<Map<String, Value>, AttemptError> {
    extract_json_object(raw).ok_or(AttemptError::Unparseable)
}

/// A required non-empty string field.
pub fn required_str<'m>(map: &'m Map<String, Value>, key: &str) -> Result<&'m str, AttemptError> {
    match map.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim()),
        Some(_) => Err(AttemptError::invalid(format!("'{key}' must be a non-empty string"))),
        None => Err(AttemptError::invalid(format!("missing '{key}'"))),
    }
}

/// An optional string field; blank strings count as absent.
pub fn optional_str(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
