//! Retrieval engine for persona knowledge bases
//!
//! Features:
//! - Sentence-boundary chunking with overlap
//! - OpenAI-compatible embedding client, built per request
//! - Dense cosine search via Qdrant, one collection per persona
//! - URL ingestion with HTML text extraction
//! - Replace-on-reingest idempotency keyed by `(collection, source)`

pub mod chunker;
pub mod embeddings;
pub mod engine;
pub mod vector_store;

pub use chunker::{Chunk, ChunkConfig, TextChunker};
pub use embeddings::{Embedder, EmbedderConfig};
pub use engine::{IngestReport, KnowledgeBinding, RetrievalEngine};
pub use vector_store::{PassagePoint, ScoredPassage, VectorStore};

use thiserror::Error;

/// RAG errors
#[derive(Error, Debug)]
pub enum RagError {
    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<RagError> for parley_core::Error {
    fn from(err: RagError) -> Self {
        match err {
            RagError::Fetch(what) => parley_core::Error::Validation(what),
            other => parley_core::Error::Upstream(other.to_string()),
        }
    }
}
