//! Scripted oracle for deterministic pipeline tests.
//!
//! Responses are queued per stage heading. When a queue is empty the
//! heading's `always` response is used, and failing that the call errors like
//! an unreachable endpoint. Every call is recorded in order.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::prompts::ALL_HEADINGS;
use crate::inference::{InferenceError, Oracle};

#[derive(Default)]
pub struct ScriptedOracle {
    queues: Mutex<HashMap<&'static str, VecDeque<String>>>,
    fallbacks: Mutex<HashMap<&'static str, String>>,
    calls: Mutex<Vec<(&'static str, String)>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response for prompts starting with `heading`.
    pub fn push(&self, heading: &'static str, response: impl Into<String>) -> &Self {
        self.queues
            .lock()
            .unwrap()
            .entry(heading)
            .or_default()
            .push_back(response.into());
        self
    }

    /// Response used whenever the queue for `heading` is empty.
    pub fn always(&self, heading: &'static str, response: impl Into<String>) -> &Self {
        self.fallbacks.lock().unwrap().insert(heading, response.into());
        self
    }

    /// Number of calls made with prompts for `heading`.
    pub fn calls_for(&self, heading: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| *h == heading)
            .count()
    }

    /// Headings of all calls, in call order.
    pub fn call_sequence(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().iter().map(|(h, _)| *h).collect()
    }

    /// Prompts sent for `heading`, in call order.
    pub fn prompts_for(&self, heading: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| *h == heading)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn infer(&self, prompt: &str) -> Result<String, InferenceError> {
        let heading = ALL_HEADINGS
            .iter()
            .copied()
            .find(|h| prompt.starts_with(h))
            .unwrap_or("unknown");
        self.calls.lock().unwrap().push((heading, prompt.to_string()));

        if let Some(next) = self
            .queues
            .lock()
            .unwrap()
            .get_mut(heading)
            .and_then(VecDeque::pop_front)
        {
            return Ok(next);
        }
        if let Some(fallback) = self.fallbacks.lock().unwrap().get(heading) {
            return Ok(fallback.clone());
        }
        Err(InferenceError::AllModelsUnavailable {
            attempted: vec!["scripted".into()],
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
