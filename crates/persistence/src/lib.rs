//! Relational persistence layer
//!
//! Provides durable storage for:
//! - API profiles (keys encrypted at rest)
//! - Personas
//! - Sessions and their append-only message logs
//!
//! All stores share one connection pool; writes are transactional per entity.

pub mod client;
pub mod personas;
pub mod profiles;
pub mod schema;
pub mod secrets;
pub mod sessions;

pub use client::connect;
pub use personas::{NewPersona, PersonaPatch, PersonaStore};
pub use profiles::{
    ApiProfilePatch, ApiProfileStore, NewApiProfile, ResolvedEmbedding, ResolvedLlm,
};
pub use secrets::KeyCipher;
pub use sessions::ConversationStore;

use thiserror::Error;

/// Persistence errors
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Profile is not an embedding profile: {0}")]
    NotEmbedding(String),

    #[error("Corrupt row: {0}")]
    InvalidRow(String),
}

impl From<PersistError> for parley_core::Error {
    fn from(err: PersistError) -> Self {
        match err {
            PersistError::NotFound(what) => parley_core::Error::NotFound(what),
            PersistError::PermissionDenied => parley_core::Error::PermissionDenied,
            PersistError::Conflict(what) | PersistError::Invalid(what) => {
                parley_core::Error::Validation(what)
            }
            PersistError::Crypto(what) | PersistError::NotEmbedding(what) => {
                parley_core::Error::Config(what)
            }
            PersistError::Database(e) => parley_core::Error::Internal(e.to_string()),
            PersistError::InvalidRow(what) => parley_core::Error::Internal(what),
        }
    }
}

/// Combined persistence layer handed to the server and orchestrator.
#[derive(Clone)]
pub struct PersistenceLayer {
    pub profiles: ApiProfileStore,
    pub personas: PersonaStore,
    pub conversations: ConversationStore,
}

/// Connect, ensure schema, and build all stores.
pub async fn init(
    database_url: &str,
    encryption_key: [u8; 32],
) -> Result<PersistenceLayer, PersistError> {
    let pool = connect(database_url).await?;
    let cipher = KeyCipher::new(encryption_key);

    Ok(PersistenceLayer {
        profiles: ApiProfileStore::new(pool.clone(), cipher),
        personas: PersonaStore::new(pool.clone()),
        conversations: ConversationStore::new(pool),
    })
}
