//! The oracle seam: a single-turn text-in, text-out completion service.
//!
//! Every pipeline stage talks to the model through this trait, which keeps the
//! HTTP client swappable and lets tests script responses deterministically.

use async_trait::async_trait;

use super::errors::InferenceError;

/// A text completion service.
///
/// Implementations must be stateless across calls: no conversation memory is
/// assumed, each prompt carries everything the model needs.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Send `prompt` and return the raw completion text.
    async fn infer(&self, prompt: &str) -> Result<String, InferenceError>;

    /// Human-readable name for logs.
    fn name(&self) -> &str {
        "oracle"
    }
}
