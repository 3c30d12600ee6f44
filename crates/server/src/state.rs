//! Application state
//!
//! Shared state across all handlers.

use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;

use parley_config::Settings;
use parley_core::{collection_name, Error, Persona};
use parley_orchestrator::SessionOrchestrator;
use parley_persistence::PersistenceLayer;
use parley_rag::{KnowledgeBinding, RetrievalEngine};

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub stores: PersistenceLayer,
    pub engine: Arc<RetrievalEngine>,
    pub orchestrator: Arc<SessionOrchestrator>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.llm_call_timeout_seconds)
    }

    /// Build the short-lived `(collection, embedder)` binding for a
    /// persona's knowledge base. Personas without an embedding profile
    /// cannot hold knowledge.
    pub async fn knowledge_binding(&self, persona: &Persona) -> Result<KnowledgeBinding, Error> {
        let embedding_profile_id = persona.embedding_profile_id.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "persona {} has no embedding profile configured",
                persona.id
            ))
        })?;

        let resolved = self
            .stores
            .profiles
            .resolve_embedding(&persona.owner, embedding_profile_id)
            .await
            .map_err(Error::from)?;

        Ok(KnowledgeBinding {
            collection: collection_name(&persona.owner, &persona.id),
            embedder: parley_rag::EmbedderConfig {
                base_url: resolved.base_url,
                model: resolved.model,
                api_key: resolved.api_key,
                dim: resolved.dim,
            },
        })
    }
}
