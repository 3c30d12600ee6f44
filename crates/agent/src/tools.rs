//! Per-invocation tool binding
//!
//! Tools are small `(name, input schema, handler)` bundles bound to one
//! persona invocation at a time; there is no global registry. The handler
//! reads owner and persona id from an explicit [`ToolContext`], never from
//! the model-visible arguments, so a model cannot address another tenant's
//! knowledge.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use parley_config::constants::rag;
use parley_core::collection_name;
use parley_llm::ToolDefinition;
use parley_rag::{EmbedderConfig, KnowledgeBinding, RetrievalEngine};

use crate::AgentError;

/// Trusted per-call identity, supplied by the orchestrator.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub owner: String,
    pub persona_id: String,
}

/// A tool the runtime can advertise to the model.
#[async_trait]
pub trait AgentTool: Send + Sync {
    /// Name, description and input schema shown to the model.
    fn definition(&self) -> ToolDefinition;

    /// Execute with validated-enough arguments; returns text for the model.
    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String, AgentError>;
}

/// The single built-in tool: search this persona's private knowledge.
pub struct KnowledgeSearchTool {
    engine: Arc<RetrievalEngine>,
    embedder: EmbedderConfig,
}

impl KnowledgeSearchTool {
    pub const NAME: &'static str = "search_knowledge";

    /// Bind the tool to one persona invocation's resolved embedder.
    pub fn new(engine: Arc<RetrievalEngine>, embedder: EmbedderConfig) -> Self {
        Self { engine, embedder }
    }
}

#[async_trait]
impl AgentTool for KnowledgeSearchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Search this assistant's private knowledge base for passages \
                          relevant to a natural-language query."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "What to look up"
                    },
                    "top_k": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": rag::MAX_TOP_K,
                        "description": "How many passages to return"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String, AgentError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::Tool("search_knowledge requires a query".into()))?;
        let top_k = args
            .get("top_k")
            .and_then(Value::as_u64)
            .map(|k| k as usize)
            .unwrap_or(rag::DEFAULT_TOP_K)
            .clamp(1, rag::MAX_TOP_K);

        // Collection identity comes from the trusted context, not the model.
        let binding = KnowledgeBinding {
            collection: collection_name(&ctx.owner, &ctx.persona_id),
            embedder: self.embedder.clone(),
        };

        let passages = self.engine.search(&binding, query, top_k).await?;
        if passages.is_empty() {
            return Ok("No relevant passages found.".to_string());
        }

        let rendered: Vec<String> = passages
            .iter()
            .enumerate()
            .map(|(i, p)| format!("[{}] ({}) {}", i + 1, p.source, p.text))
            .collect();
        Ok(rendered.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_rag::VectorStore;
    use zeroize::Zeroizing;

    fn tool() -> KnowledgeSearchTool {
        // Client construction is lazy; nothing connects until a call is made.
        let store = Arc::new(VectorStore::connect("http://127.0.0.1:6334").unwrap());
        KnowledgeSearchTool::new(
            Arc::new(RetrievalEngine::new(store)),
            EmbedderConfig {
                base_url: "http://127.0.0.1:1".into(),
                model: "emb".into(),
                api_key: Zeroizing::new("k".into()),
                dim: 4,
            },
        )
    }

    #[test]
    fn test_definition_exposes_no_tenant_identity() {
        let definition = tool().definition();
        assert_eq!(definition.name, "search_knowledge");
        let properties = definition.input_schema["properties"].as_object().unwrap();
        assert!(properties.contains_key("query"));
        assert!(properties.contains_key("top_k"));
        assert!(!properties.contains_key("owner"));
        assert!(!properties.contains_key("persona_id"));
    }

    #[tokio::test]
    async fn test_execute_requires_query() {
        let ctx = ToolContext {
            owner: "alice".into(),
            persona_id: "p1".into(),
        };
        let err = tool().execute(&ctx, json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::Tool(_)));
    }
}
