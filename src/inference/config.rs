//! Model and orchestrator configuration loading.
//!
//! Reads `_models/config.yaml` and resolves environment variables.
//! Config is the single source of truth for the oracle endpoint, the fallback
//! chain and the orchestrator's budgets.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::InferenceError;

// ─── Public Types ────────────────────────────────────────────────────────────

/// A single model endpoint's configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub display_name: String,
    pub base_url: String,
    #[serde(default)]
    pub model_name: Option<String>,
    /// Name of the env var holding the bearer token, if the endpoint needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// When `true`, sends `response_format: {"type":"json_object"}`.
    #[serde(default)]
    pub force_json_response: bool,
}

fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> u32 {
    1024
}

/// Budgets and history limits for the request-resolution pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Oracle attempts per stage call before the stage is declared failed.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Rejected operations tolerated per request before giving up.
    #[serde(default = "default_discard_budget")]
    pub discard_budget: u32,
    /// Number of most recent messages shown to history-aware stages.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Estimated-token ceiling for the rendered history.
    #[serde(default = "default_history_token_budget")]
    pub history_token_budget: u32,
    /// Maximum characters of a result payload included in a prompt.
    #[serde(default = "default_payload_char_limit")]
    pub payload_char_limit: usize,
}

fn default_retry_budget() -> u32 {
    5
}
fn default_discard_budget() -> u32 {
    5
}
fn default_history_window() -> usize {
    20
}
fn default_history_token_budget() -> u32 {
    4_000
}
fn default_payload_char_limit() -> usize {
    2_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            discard_budget: default_discard_budget(),
            history_window: default_history_window(),
            history_token_budget: default_history_token_budget(),
            payload_char_limit: default_payload_char_limit(),
        }
    }
}

impl OrchestratorConfig {
    /// Reject configurations that would make a stage unable to ever succeed.
    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.retry_budget == 0 {
            return Err(InferenceError::ConfigError {
                reason: "orchestrator.retry_budget must be at least 1".into(),
            });
        }
        if self.discard_budget == 0 {
            return Err(InferenceError::ConfigError {
                reason: "orchestrator.discard_budget must be at least 1".into(),
            });
        }
        if self.history_window == 0 {
            return Err(InferenceError::ConfigError {
                reason: "orchestrator.history_window must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Top-level configuration (mirrors `_models/config.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    pub active_model: String,
    pub models: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve the config path.
///
/// Checks `DESKQUERY_PROJECT_ROOT` first, then searches upward from `start`
/// for `_models/config.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, InferenceError> {
    if let Ok(root) = std::env::var("DESKQUERY_PROJECT_ROOT") {
        let candidate = PathBuf::from(&root).join("_models/config.yaml");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join("_models/config.yaml");
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(InferenceError::ConfigError {
        reason: "could not find _models/config.yaml".into(),
    })
}

/// Load, interpolate and validate the configuration file.
pub fn load_models_config(path: &Path) -> Result<ModelsConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    parse_models_config(&raw)
}

/// Parse configuration text (after env-var interpolation).
pub fn parse_models_config(raw: &str) -> Result<ModelsConfig, InferenceError> {
    let interpolated = interpolate_env_vars(raw);

    let config: ModelsConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    config.orchestrator.validate()?;
    Ok(config)
}

/// Resolve the active model configuration, respecting the fallback chain.
///
/// Returns `(model_key, ModelConfig)` for the first model present in config.
pub fn resolve_active_model(config: &ModelsConfig) -> Result<(String, ModelConfig), InferenceError> {
    if let Some(model) = config.models.get(&config.active_model) {
        return Ok((config.active_model.clone(), model.clone()));
    }

    for key in &config.fallback_chain {
        if let Some(model) = config.models.get(key) {
            return Ok((key.clone(), model.clone()));
        }
    }

    Err(InferenceError::ConfigError {
        reason: format!(
            "active model '{}' not found in config and no fallback available",
            config.active_model
        ),
    })
}

/// Ordered list of model keys to try for a single call: active first, then
/// the fallback chain, skipping duplicates and unknown keys.
pub fn model_try_order(config: &ModelsConfig) -> Vec<String> {
    let mut order = Vec::new();
    let candidates = std::iter::once(&config.active_model).chain(config.fallback_chain.iter());
    for key in candidates {
        if config.models.contains_key(key) && !order.contains(key) {
            order.push(key.clone());
        }
    }
    order
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
