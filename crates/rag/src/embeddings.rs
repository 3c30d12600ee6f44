//! Embedding client
//!
//! Calls an OpenAI-compatible `/embeddings` endpoint. A client is built per
//! request from the persona's resolved embedding profile and dropped when the
//! request finishes, taking the decrypted key with it.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::RagError;

/// Resolved embedding endpoint for one persona.
#[derive(Clone)]
pub struct EmbedderConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Zeroizing<String>,
    /// Vector dimension; also the dimension of the persona's collection.
    pub dim: u32,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Debug, Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

/// Short-lived embedder bound to one persona's profile.
pub struct Embedder {
    client: Client,
    config: EmbedderConfig,
}

impl Embedder {
    pub fn new(config: EmbedderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Embed a batch of texts, preserving order.
    pub async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!(
            "{}/embeddings",
            self.config.base_url.trim_end_matches('/')
        );
        let request = EmbedRequest {
            model: &self.config.model,
            input: texts,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key.as_str())
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::Embedding(format!("embedding request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            // Body is upstream-controlled; do not echo it into error chains
            // that might carry credentials.
            return Err(RagError::Embedding(format!(
                "embedding endpoint returned {}",
                status
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| RagError::Embedding(format!("bad embedding response: {}", e)))?;

        if parsed.data.len() != texts.len() {
            return Err(RagError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        let dim = self.config.dim as usize;
        for item in &parsed.data {
            if item.embedding.len() != dim {
                return Err(RagError::Embedding(format!(
                    "embedding dimension {} does not match profile dimension {}",
                    item.embedding.len(),
                    dim
                )));
            }
        }

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    /// Embed a single text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
        let mut batch = self.embed_batch(&[text]).await?;
        batch
            .pop()
            .ok_or_else(|| RagError::Embedding("no embedding returned".into()))
    }

    /// Vector dimension for this embedder.
    pub fn dim(&self) -> u32 {
        self.config.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = EmbedRequest {
            model: "text-embedding-3-small",
            input: &["hello", "world"],
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("text-embedding-3-small"));
        assert!(json.contains(r#""input":["hello","world"]"#));
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{"data":[{"embedding":[0.1,0.2]},{"embedding":[0.3,0.4]}],"model":"m"}"#;
        let parsed: EmbedResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.data.len(), 2);
        assert_eq!(parsed.data[0].embedding, vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn test_empty_batch_short_circuits() {
        let embedder = Embedder::new(EmbedderConfig {
            base_url: "http://127.0.0.1:1".into(),
            model: "m".into(),
            api_key: Zeroizing::new("k".into()),
            dim: 2,
        });
        // No network call is made for an empty batch.
        assert!(embedder.embed_batch(&[]).await.unwrap().is_empty());
    }
}
