//! Backend resolution
//!
//! A turn resolves its upstream clients through [`BackendFactory`], so
//! decrypted credentials exist only inside the resolving call frame and the
//! orchestrator stays testable with scripted backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use parley_core::{Error, Persona};
use parley_llm::{ChatBackend, OpenAiBackend, OpenAiConfig};
use parley_persistence::ApiProfileStore;
use parley_rag::EmbedderConfig;

/// A chat backend plus the profile's sampling temperature.
pub struct ResolvedChatBackend {
    pub backend: Arc<dyn ChatBackend>,
    pub temperature: f32,
}

/// Resolves per-persona upstream clients for one turn.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Build the chat backend for a persona's API profile.
    async fn chat_backend(&self, persona: &Persona) -> Result<ResolvedChatBackend, Error>;

    /// Build the embedder for a persona's knowledge profile, or `None` when
    /// the persona has no knowledge configuration.
    async fn embedder_config(&self, persona: &Persona) -> Result<Option<EmbedderConfig>, Error>;
}

/// Production factory backed by the API-profile store.
pub struct ProfileBackendFactory {
    profiles: ApiProfileStore,
    llm_timeout: Duration,
}

impl ProfileBackendFactory {
    pub fn new(profiles: ApiProfileStore, llm_timeout: Duration) -> Self {
        Self {
            profiles,
            llm_timeout,
        }
    }
}

#[async_trait]
impl BackendFactory for ProfileBackendFactory {
    async fn chat_backend(&self, persona: &Persona) -> Result<ResolvedChatBackend, Error> {
        let resolved = self
            .profiles
            .resolve_llm(&persona.owner, &persona.api_profile_id)
            .await
            .map_err(Error::from)?;

        let backend = OpenAiBackend::new(OpenAiConfig {
            base_url: resolved.base_url,
            model: resolved.model,
            api_key: resolved.api_key,
            timeout: self.llm_timeout,
        })
        .map_err(Error::from)?;

        Ok(ResolvedChatBackend {
            backend: Arc::new(backend),
            temperature: resolved.temperature,
        })
    }

    async fn embedder_config(&self, persona: &Persona) -> Result<Option<EmbedderConfig>, Error> {
        let Some(embedding_profile_id) = &persona.embedding_profile_id else {
            return Ok(None);
        };
        let resolved = self
            .profiles
            .resolve_embedding(&persona.owner, embedding_profile_id)
            .await
            .map_err(Error::from)?;

        Ok(Some(EmbedderConfig {
            base_url: resolved.base_url,
            model: resolved.model,
            api_key: resolved.api_key,
            dim: resolved.dim,
        }))
    }
}
