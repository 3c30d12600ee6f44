//! Vector store using Qdrant
//!
//! One collection per persona, created lazily on first ingest with that
//! persona's embedding dimension. The client is shared across sessions; every
//! call names its collection explicitly so nothing tenant-scoped lives on the
//! client itself.

use qdrant_client::{
    qdrant::{
        value::Kind, Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance,
        FieldCondition, Filter, Match, PointStruct, SearchPointsBuilder, UpsertPointsBuilder,
        VectorParamsBuilder,
    },
    Qdrant,
};
use std::collections::HashMap;

use crate::RagError;

/// A chunk staged for upsert.
#[derive(Debug, Clone)]
pub struct PassagePoint {
    pub text: String,
    pub source: String,
    pub vector: Vec<f32>,
}

/// A scored search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPassage {
    pub text: String,
    pub source: String,
    pub score: f32,
}

/// Shared Qdrant client wrapper.
pub struct VectorStore {
    client: Qdrant,
}

impl VectorStore {
    /// Connect to the vector search service.
    pub fn connect(endpoint: &str) -> Result<Self, RagError> {
        let client = Qdrant::from_url(endpoint)
            .build()
            .map_err(|e| RagError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    /// Whether the named collection exists.
    pub async fn collection_exists(&self, collection: &str) -> Result<bool, RagError> {
        self.client
            .collection_exists(collection)
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))
    }

    /// Create the collection with cosine distance if it is missing.
    pub async fn ensure_collection(&self, collection: &str, dim: u32) -> Result<(), RagError> {
        if self.collection_exists(collection).await? {
            return Ok(());
        }

        self.client
            .create_collection(
                CreateCollectionBuilder::new(collection)
                    .vectors_config(VectorParamsBuilder::new(dim as u64, Distance::Cosine)),
            )
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;

        tracing::info!(collection = %collection, dim = dim, "Created collection");
        Ok(())
    }

    /// Upsert passages into the collection.
    pub async fn upsert(
        &self,
        collection: &str,
        passages: Vec<PassagePoint>,
    ) -> Result<usize, RagError> {
        if passages.is_empty() {
            return Ok(0);
        }

        let count = passages.len();
        let points: Vec<PointStruct> = passages
            .into_iter()
            .map(|p| {
                let mut payload: HashMap<String, qdrant_client::qdrant::Value> = HashMap::new();
                payload.insert("text".to_string(), p.text.into());
                payload.insert("source".to_string(), p.source.into());
                PointStruct::new(uuid::Uuid::new_v4().to_string(), p.vector, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, points))
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;

        Ok(count)
    }

    /// Top-k cosine search. A missing collection yields the empty sequence.
    pub async fn search(
        &self,
        collection: &str,
        query_vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<ScoredPassage>, RagError> {
        if !self.collection_exists(collection).await? {
            return Ok(Vec::new());
        }

        let results = self
            .client
            .search_points(
                SearchPointsBuilder::new(collection, query_vector, top_k as u64)
                    .with_payload(true),
            )
            .await
            .map_err(|e| RagError::Search(e.to_string()))?;

        let passages = results
            .result
            .into_iter()
            .map(|point| {
                let mut text = String::new();
                let mut source = String::new();
                for (key, value) in point.payload {
                    if let Some(Kind::StringValue(s)) = value.kind {
                        match key.as_str() {
                            "text" => text = s,
                            "source" => source = s,
                            _ => {}
                        }
                    }
                }
                ScoredPassage {
                    text,
                    source,
                    score: point.score,
                }
            })
            .collect();

        Ok(passages)
    }

    /// Remove every point whose `source` payload matches.
    pub async fn delete_by_source(&self, collection: &str, source: &str) -> Result<(), RagError> {
        if !self.collection_exists(collection).await? {
            return Ok(());
        }

        let selector = Filter {
            must: vec![source_condition(source)],
            ..Default::default()
        };

        self.client
            .delete_points(DeletePointsBuilder::new(collection).points(selector))
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;

        Ok(())
    }

    /// Drop the whole collection. Missing collections are not an error.
    pub async fn delete_collection(&self, collection: &str) -> Result<(), RagError> {
        if !self.collection_exists(collection).await? {
            return Ok(());
        }
        self.client
            .delete_collection(collection)
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;
        tracing::info!(collection = %collection, "Dropped collection");
        Ok(())
    }

    /// Number of points in the collection; 0 when it does not exist.
    pub async fn count(&self, collection: &str) -> Result<u64, RagError> {
        if !self.collection_exists(collection).await? {
            return Ok(0);
        }
        let info = self
            .client
            .collection_info(collection)
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;
        Ok(info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or(0))
    }
}

fn source_condition(source: &str) -> Condition {
    Condition {
        condition_one_of: Some(qdrant_client::qdrant::condition::ConditionOneOf::Field(
            FieldCondition {
                key: "source".to_string(),
                r#match: Some(Match {
                    match_value: Some(qdrant_client::qdrant::r#match::MatchValue::Keyword(
                        source.to_string(),
                    )),
                }),
                ..Default::default()
            },
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_condition_shape() {
        let condition = source_condition("doc-1");
        match condition.condition_one_of {
            Some(qdrant_client::qdrant::condition::ConditionOneOf::Field(field)) => {
                assert_eq!(field.key, "source");
            }
            other => panic!("unexpected condition: {:?}", other),
        }
    }
}
