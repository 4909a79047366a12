//! OpenAI-compatible inference client.
//!
//! Sends single-turn chat completion requests to the configured endpoint and
//! returns the raw completion text. Walks the fallback chain when the active
//! model is unavailable.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::config::{model_try_order, ModelConfig, ModelsConfig};
use super::errors::InferenceError;
use super::oracle::Oracle;
use super::response::parse_completion_body;
use super::types::{ChatCompletionRequest, ChatMessage, ResponseFormat};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout.
///
/// Hosted models answer in a few seconds, but a local model processing a long
/// history prompt can take much longer before the first token.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for the oracle endpoint.
///
/// Holds no per-call state: every `infer` call starts from the active model
/// and walks the fallback chain independently, so one client can be shared
/// across concurrent conversations.
pub struct InferenceClient {
    http: HttpClient,
    config: ModelsConfig,
    /// Model keys in the order they are tried.
    try_order: Vec<String>,
}

impl InferenceClient {
    /// Create a new inference client from the models configuration.
    ///
    /// Does NOT check connectivity. That happens on the first request.
    pub fn from_config(config: ModelsConfig) -> Result<Self, InferenceError> {
        let (_, active) = super::config::resolve_active_model(&config)?;
        let try_order = model_try_order(&config);

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: active.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            config,
            try_order,
        })
    }

    /// Display name of the first model that will be tried.
    pub fn current_model_name(&self) -> &str {
        self.try_order
            .first()
            .and_then(|key| self.config.models.get(key))
            .map(|m| m.display_name.as_str())
            .unwrap_or("unknown")
    }

    // ─── Chat Completion ─────────────────────────────────────────────────

    /// Send a non-streaming chat completion request, falling back through the
    /// chain on retriable errors.
    pub async fn chat_completion(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<String, InferenceError> {
        let mut attempted = Vec::new();

        for key in &self.try_order {
            let Some(model) = self.config.models.get(key) else {
                continue;
            };

            match self.try_request(key, model, &messages).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retriable() => {
                    tracing::warn!(model = %key, error = %e, "model unavailable, trying next in chain");
                    attempted.push(key.clone());
                }
                Err(e) => return Err(e),
            }
        }

        Err(InferenceError::AllModelsUnavailable { attempted })
    }

    /// Attempt a single request against one model.
    async fn try_request(
        &self,
        key: &str,
        model: &ModelConfig,
        messages: &[ChatMessage],
    ) -> Result<String, InferenceError> {
        let url = format!("{}/chat/completions", model.base_url.trim_end_matches('/'));
        let body = build_request(key, model, messages);

        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            max_tokens = body.max_tokens,
            "=== LLM REQUEST ==="
        );

        let mut request = self.http.post(&url).json(&body);
        if let Some(token) = model
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
        {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: REQUEST_TIMEOUT.as_secs(),
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| InferenceError::ResponseParseError {
                reason: format!("failed to read response body: {e}"),
            })?;

        parse_completion_body(&body_text, &body.model)
    }
}

#[async_trait]
impl Oracle for InferenceClient {
    async fn infer(&self, prompt: &str) -> Result<String, InferenceError> {
        self.chat_completion(vec![ChatMessage::user(prompt)]).await
    }

    fn name(&self) -> &str {
        self.current_model_name()
    }
}

/// Build the request body for one model.
fn build_request(
    key: &str,
    model: &ModelConfig,
    messages: &[ChatMessage],
) -> ChatCompletionRequest {
    let response_format = model.force_json_response.then(|| ResponseFormat {
        r#type: "json_object".to_string(),
    });

    ChatCompletionRequest {
        model: model.model_name.clone().unwrap_or_else(|| key.to_string()),
        messages: messages.to_vec(),
        temperature: model.temperature,
        max_tokens: model.max_tokens,
        stream: false,
        response_format,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
