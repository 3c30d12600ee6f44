//! Persona runtime and turn scheduling
//!
//! Features:
//! - Streamed persona replies with prompt composition and a bounded
//!   knowledge-search tool loop
//! - Per-invocation tool binding with a trusted tenant context
//! - The pure, seedable turn scheduler

pub mod runtime;
pub mod scheduler;
pub mod tools;

pub use runtime::{Invocation, PersonaRuntime, RuntimeMode};
pub use scheduler::{extract_mentions, next_turn, SchedulerState, TurnInput};
pub use tools::{AgentTool, KnowledgeSearchTool, ToolContext};

use thiserror::Error;

use parley_llm::LlmError;
use parley_rag::RagError;

/// Agent errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Rag(#[from] RagError),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Cancelled")]
    Cancelled,
}

impl From<AgentError> for parley_core::Error {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Llm(inner) => inner.into(),
            AgentError::Rag(inner) => inner.into(),
            AgentError::Cancelled => parley_core::Error::Cancelled,
            AgentError::Tool(what) | AgentError::UnknownTool(what) => {
                parley_core::Error::Upstream(what)
            }
        }
    }
}
