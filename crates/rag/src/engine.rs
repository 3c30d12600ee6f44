//! Retrieval engine
//!
//! Ties chunking, embedding, and the vector store together for one persona at
//! a time. Callers resolve the persona's embedding profile first and hand the
//! engine a short-lived [`KnowledgeBinding`]; nothing tenant-scoped survives
//! the call.

use std::sync::Arc;
use std::time::Duration;

use parley_config::constants::{rag, timeouts};

use crate::chunker::TextChunker;
use crate::embeddings::{Embedder, EmbedderConfig};
use crate::vector_store::{PassagePoint, ScoredPassage, VectorStore};
use crate::RagError;

/// One persona's collection plus the embedder that must be used with it.
/// Ingest and search go through the same binding so model and dimension
/// always agree.
pub struct KnowledgeBinding {
    pub collection: String,
    pub embedder: EmbedderConfig,
}

/// Result of an ingestion call.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub collection: String,
    pub chunks_added: usize,
}

/// Shared retrieval engine.
pub struct RetrievalEngine {
    store: Arc<VectorStore>,
    chunker: TextChunker,
    http: reqwest::Client,
}

impl RetrievalEngine {
    pub fn new(store: Arc<VectorStore>) -> Self {
        Self {
            store,
            chunker: TextChunker::default(),
            http: reqwest::Client::new(),
        }
    }

    /// Chunk, embed, and upsert a document. Re-ingesting the same source
    /// replaces that source's chunks.
    pub async fn ingest_text(
        &self,
        binding: &KnowledgeBinding,
        text: &str,
        source: &str,
    ) -> Result<IngestReport, RagError> {
        let chunks = self.chunker.chunk(text);
        if chunks.is_empty() {
            return Ok(IngestReport {
                collection: binding.collection.clone(),
                chunks_added: 0,
            });
        }

        let embedder = Embedder::new(binding.embedder.clone());

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let vectors = embedder.embed_batch(&texts).await?;

        self.store
            .ensure_collection(&binding.collection, binding.embedder.dim)
            .await?;
        self.store
            .delete_by_source(&binding.collection, source)
            .await?;

        let points: Vec<PassagePoint> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| PassagePoint {
                text: chunk.text,
                source: source.to_string(),
                vector,
            })
            .collect();

        let added = self.store.upsert(&binding.collection, points).await?;
        tracing::info!(
            collection = %binding.collection,
            source = %source,
            chunks = added,
            "Ingested document"
        );

        Ok(IngestReport {
            collection: binding.collection.clone(),
            chunks_added: added,
        })
    }

    /// Fetch a URL, extract its text, and ingest it with the URL as source.
    pub async fn ingest_url(
        &self,
        binding: &KnowledgeBinding,
        url: &str,
    ) -> Result<IngestReport, RagError> {
        let response = self
            .http
            .get(url)
            .timeout(Duration::from_secs(timeouts::INGEST_FETCH_SECS))
            .send()
            .await
            .map_err(|e| RagError::Fetch(format!("fetch failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(RagError::Fetch(format!(
                "fetch returned {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RagError::Fetch(format!("read failed: {}", e)))?;

        let text = extract_text(&body);
        if text.trim().is_empty() {
            return Err(RagError::Fetch(format!("no textual content at {}", url)));
        }

        self.ingest_text(binding, &text, url).await
    }

    /// Remove one source's chunks from the persona's collection.
    pub async fn delete_by_source(
        &self,
        binding: &KnowledgeBinding,
        source: &str,
    ) -> Result<(), RagError> {
        self.store
            .delete_by_source(&binding.collection, source)
            .await
    }

    /// Drop a persona's entire collection (persona deletion cascade).
    pub async fn delete_collection(&self, collection: &str) -> Result<(), RagError> {
        self.store.delete_collection(collection).await
    }

    /// Top-k search over the persona's collection, descending score.
    /// Personas with no ingested content get the empty sequence.
    pub async fn search(
        &self,
        binding: &KnowledgeBinding,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredPassage>, RagError> {
        if !self.store.collection_exists(&binding.collection).await? {
            return Ok(Vec::new());
        }

        let embedder = Embedder::new(binding.embedder.clone());
        let query_vector = embedder.embed(query).await?;

        let top_k = top_k.clamp(1, rag::MAX_TOP_K);
        self.store
            .search(&binding.collection, query_vector, top_k)
            .await
    }

    /// Point count for an owner-facing knowledge summary.
    pub async fn collection_size(&self, collection: &str) -> Result<u64, RagError> {
        self.store.count(collection).await
    }
}

/// Strip markup from an HTML document, keeping visible text.
fn extract_text(html: &str) -> String {
    let document = scraper::Html::parse_document(html);
    let selector = scraper::Selector::parse("body").expect("static selector");

    let root_text: Vec<String> = match document.select(&selector).next() {
        Some(body) => body.text().map(|t| t.to_string()).collect(),
        None => document.root_element().text().map(|t| t.to_string()).collect(),
    };

    root_text
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_strips_markup() {
        let html = r#"<html><head><title>T</title><style>p{color:red}</style></head>
            <body><h1>Heading</h1><p>The secret code is 42.</p></body></html>"#;
        let text = extract_text(html);
        assert!(text.contains("Heading"));
        assert!(text.contains("The secret code is 42."));
        assert!(!text.contains("color:red"));
    }

    #[test]
    fn test_extract_text_plain_fragment() {
        let text = extract_text("just words, no tags");
        assert_eq!(text, "just words, no tags");
    }
}
