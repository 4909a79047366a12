//! Inference Client — OpenAI-compatible API client for the oracle.
//!
//! This module handles all communication with the model endpoint:
//! - Non-streaming single-turn chat completions
//! - Fallback chain management
//! - JSON payload extraction from noisy completions
//! - Model and orchestrator configuration loading from `_models/config.yaml`
//!
//! The pipeline only sees the [`Oracle`] trait, so the model is
//! interchangeable via config and scriptable in tests.

pub mod client;
pub mod config;
pub mod errors;
pub mod oracle;
pub mod payload;
pub mod response;
pub mod types;

// Re-exports for convenience
pub use client::InferenceClient;
pub use config::{ModelConfig, ModelsConfig, OrchestratorConfig};
pub use errors::InferenceError;
pub use oracle::Oracle;
pub use types::{ChatMessage, Role};
