//! LLM integration
//!
//! Features:
//! - OpenAI-compatible chat completions with SSE streaming
//! - Native tool calling (fragmented tool deltas reassembled per index)
//! - Cooperative cancellation by dropping the chunk receiver
//!
//! Credentials enter through [`OpenAiConfig`] as zeroizing strings and die
//! with the backend instance.

pub mod backend;
pub mod prompt;

pub use backend::{
    ChatBackend, ChatOutcome, ChatRequest, FinishReason, OpenAiBackend, OpenAiConfig,
};
pub use prompt::{Message, Role, ToolCall, ToolDefinition};

use thiserror::Error;

/// LLM errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout")]
    Timeout,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

impl From<LlmError> for parley_core::Error {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout => parley_core::Error::Timeout,
            LlmError::Configuration(what) => parley_core::Error::Config(what),
            other => parley_core::Error::Upstream(other.to_string()),
        }
    }
}
