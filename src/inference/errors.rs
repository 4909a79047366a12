//! Oracle transport errors.
//!
//! The retrier treats every variant as a failed attempt; `is_retriable` only
//! decides whether the client tries the next model in the fallback chain.

use thiserror::Error;

/// Errors that can occur while talking to the oracle endpoint.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed {
        endpoint: String,
        reason: String,
    },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout {
        duration_secs: u64,
    },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError {
        status: u16,
        body: String,
    },

    /// The endpoint answered but the completion carried no text.
    #[error("empty completion from {model}")]
    EmptyResponse {
        model: String,
    },

    /// The completion body could not be decoded.
    #[error("response parse error: {reason}")]
    ResponseParseError {
        reason: String,
    },

    /// Every model in the fallback chain was unavailable.
    #[error("all models unavailable (tried: {})", attempted.join(", "))]
    AllModelsUnavailable {
        attempted: Vec<String>,
    },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl InferenceError {
    /// Whether the client should move on to the next model in the fallback chain.
    ///
    /// HTTP 404 is included because local runtimes return 404 when a model is
    /// not installed. 429 and 5xx are transient on hosted endpoints.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            InferenceError::ConnectionFailed { .. }
                | InferenceError::Timeout { .. }
                | InferenceError::HttpError { status: 404, .. }
                | InferenceError::HttpError { status: 429, .. }
                | InferenceError::HttpError { status: 500..=504, .. }
        )
    }
}
