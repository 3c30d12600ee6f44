//! API profile store
//!
//! CRUD over upstream endpoint profiles, scoped by owner. The API key is
//! encrypted before it ever reaches a row and is only decrypted inside
//! [`ApiProfileStore::resolve_llm`] / [`ApiProfileStore::resolve_embedding`],
//! whose results zeroize the plaintext on drop.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::SqlitePool;
use zeroize::Zeroizing;

use parley_core::ApiProfile;

use crate::secrets::KeyCipher;
use crate::PersistError;

/// Row tuple for `api_profiles` queries.
type ProfileRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    f64,
    i64,
    Option<i64>,
    String,
);

/// Fields accepted when creating a profile. The key arrives in plaintext
/// from the request body and is encrypted immediately.
#[derive(Debug, Clone, Deserialize)]
pub struct NewApiProfile {
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub is_embedding_model: bool,
    #[serde(default)]
    pub embedding_dim: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}

/// Partial update; absent fields are left untouched. `api_key` is write-only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiProfilePatch {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub is_embedding_model: Option<bool>,
    pub embedding_dim: Option<u32>,
}

/// Decrypted chat-endpoint credentials, alive for a single call frame.
pub struct ResolvedLlm {
    pub base_url: String,
    pub model: String,
    pub api_key: Zeroizing<String>,
    pub temperature: f32,
}

/// Decrypted embedding-endpoint credentials plus the collection dimension.
pub struct ResolvedEmbedding {
    pub base_url: String,
    pub model: String,
    pub api_key: Zeroizing<String>,
    pub dim: u32,
}

/// Store for API profiles.
#[derive(Clone)]
pub struct ApiProfileStore {
    pool: SqlitePool,
    cipher: KeyCipher,
}

impl ApiProfileStore {
    pub fn new(pool: SqlitePool, cipher: KeyCipher) -> Self {
        Self { pool, cipher }
    }

    /// Create a profile for `owner`.
    pub async fn create(&self, owner: &str, new: NewApiProfile) -> Result<ApiProfile, PersistError> {
        let encrypted = self.cipher.encrypt(&new.api_key)?;
        let profile = ApiProfile {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            name: new.name,
            base_url: new.base_url,
            model: new.model,
            encrypted_api_key: encrypted,
            temperature: new.temperature,
            is_embedding_model: new.is_embedding_model,
            embedding_dim: new.embedding_dim,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO api_profiles (id, owner, name, base_url, model, encrypted_api_key, \
             temperature, is_embedding_model, embedding_dim, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&profile.id)
        .bind(&profile.owner)
        .bind(&profile.name)
        .bind(&profile.base_url)
        .bind(&profile.model)
        .bind(&profile.encrypted_api_key)
        .bind(profile.temperature as f64)
        .bind(profile.is_embedding_model as i64)
        .bind(profile.embedding_dim.map(|d| d as i64))
        .bind(profile.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::info!(profile_id = %profile.id, owner = %owner, "Created API profile");
        Ok(profile)
    }

    /// Fetch a profile owned by `owner`.
    pub async fn get(&self, owner: &str, id: &str) -> Result<ApiProfile, PersistError> {
        let row: Option<ProfileRow> = sqlx::query_as(
            "SELECT id, owner, name, base_url, model, encrypted_api_key, temperature, \
             is_embedding_model, embedding_dim, created_at FROM api_profiles WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| PersistError::NotFound(format!("api profile {}", id)))?;
        if row.1 != owner {
            return Err(PersistError::PermissionDenied);
        }
        row_to_profile(row)
    }

    /// List profiles for `owner`, newest first.
    pub async fn list(&self, owner: &str) -> Result<Vec<ApiProfile>, PersistError> {
        let rows: Vec<ProfileRow> = sqlx::query_as(
            "SELECT id, owner, name, base_url, model, encrypted_api_key, temperature, \
             is_embedding_model, embedding_dim, created_at FROM api_profiles \
             WHERE owner = ?1 ORDER BY created_at DESC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_profile).collect()
    }

    /// Apply a partial update.
    pub async fn update(
        &self,
        owner: &str,
        id: &str,
        patch: ApiProfilePatch,
    ) -> Result<ApiProfile, PersistError> {
        let mut profile = self.get(owner, id).await?;

        if let Some(name) = patch.name {
            profile.name = name;
        }
        if let Some(base_url) = patch.base_url {
            profile.base_url = base_url;
        }
        if let Some(model) = patch.model {
            profile.model = model;
        }
        if let Some(api_key) = patch.api_key {
            profile.encrypted_api_key = self.cipher.encrypt(&api_key)?;
        }
        if let Some(temperature) = patch.temperature {
            profile.temperature = temperature;
        }
        if let Some(is_embedding) = patch.is_embedding_model {
            profile.is_embedding_model = is_embedding;
        }
        if let Some(dim) = patch.embedding_dim {
            profile.embedding_dim = Some(dim);
        }

        sqlx::query(
            "UPDATE api_profiles SET name = ?1, base_url = ?2, model = ?3, \
             encrypted_api_key = ?4, temperature = ?5, is_embedding_model = ?6, \
             embedding_dim = ?7 WHERE id = ?8 AND owner = ?9",
        )
        .bind(&profile.name)
        .bind(&profile.base_url)
        .bind(&profile.model)
        .bind(&profile.encrypted_api_key)
        .bind(profile.temperature as f64)
        .bind(profile.is_embedding_model as i64)
        .bind(profile.embedding_dim.map(|d| d as i64))
        .bind(&profile.id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(profile)
    }

    /// Delete a profile and cascade personas that reference it.
    ///
    /// Returns the ids of cascaded personas so the caller can drop their
    /// retrieval collections.
    pub async fn delete(&self, owner: &str, id: &str) -> Result<Vec<String>, PersistError> {
        // Ownership check first; also yields NotFound for missing rows.
        self.get(owner, id).await?;

        let mut tx = self.pool.begin().await?;

        let cascaded: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM personas WHERE owner = ?1 AND api_profile_id = ?2")
                .bind(owner)
                .bind(id)
                .fetch_all(&mut *tx)
                .await?;

        sqlx::query("DELETE FROM personas WHERE owner = ?1 AND api_profile_id = ?2")
            .bind(owner)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM api_profiles WHERE id = ?1 AND owner = ?2")
            .bind(id)
            .bind(owner)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            profile_id = %id,
            cascaded_personas = cascaded.len(),
            "Deleted API profile"
        );
        Ok(cascaded.into_iter().map(|(pid,)| pid).collect())
    }

    /// Decrypt chat credentials for a profile. The plaintext key lives only
    /// in the returned value and is zeroized on drop.
    pub async fn resolve_llm(&self, owner: &str, id: &str) -> Result<ResolvedLlm, PersistError> {
        let profile = self.get(owner, id).await?;
        let api_key = self.cipher.decrypt(&profile.encrypted_api_key)?;
        Ok(ResolvedLlm {
            base_url: profile.base_url,
            model: profile.model,
            api_key,
            temperature: profile.temperature,
        })
    }

    /// Decrypt embedding credentials for a profile.
    pub async fn resolve_embedding(
        &self,
        owner: &str,
        id: &str,
    ) -> Result<ResolvedEmbedding, PersistError> {
        let profile = self.get(owner, id).await?;
        if !profile.is_embedding_model {
            return Err(PersistError::NotEmbedding(profile.id));
        }
        let api_key = self.cipher.decrypt(&profile.encrypted_api_key)?;
        Ok(ResolvedEmbedding {
            base_url: profile.base_url,
            model: profile.model,
            api_key,
            dim: profile.embedding_dim.unwrap_or(DEFAULT_EMBEDDING_DIM),
        })
    }

    /// Masked key preview for DTOs.
    pub fn key_preview(&self, profile: &ApiProfile) -> String {
        self.cipher.preview(&profile.encrypted_api_key)
    }
}

/// Fallback vector dimension when an embedding profile carries none.
const DEFAULT_EMBEDDING_DIM: u32 = 1536;

fn row_to_profile(row: ProfileRow) -> Result<ApiProfile, PersistError> {
    let (id, owner, name, base_url, model, encrypted_api_key, temperature, is_embedding, dim, created_at) =
        row;
    Ok(ApiProfile {
        id,
        owner,
        name,
        base_url,
        model,
        encrypted_api_key,
        temperature: temperature as f32,
        is_embedding_model: is_embedding != 0,
        embedding_dim: dim.map(|d| d as u32),
        created_at: parse_timestamp(&created_at)?,
    })
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, PersistError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| PersistError::InvalidRow(format!("bad timestamp: {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::connect;

    async fn store() -> ApiProfileStore {
        let pool = connect("sqlite::memory:").await.unwrap();
        ApiProfileStore::new(pool, KeyCipher::new([1u8; 32]))
    }

    fn sample() -> NewApiProfile {
        NewApiProfile {
            name: "main".into(),
            base_url: "https://api.example.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key: "sk-test-abcd1234".into(),
            temperature: 0.5,
            is_embedding_model: false,
            embedding_dim: None,
        }
    }

    #[tokio::test]
    async fn test_create_encrypts_key() {
        let store = store().await;
        let profile = store.create("alice", sample()).await.unwrap();
        assert!(profile.encrypted_api_key.starts_with("v1:"));
        assert!(!profile.encrypted_api_key.contains("sk-test"));
        assert_eq!(store.key_preview(&profile), "****1234");
    }

    #[tokio::test]
    async fn test_cross_owner_access_denied() {
        let store = store().await;
        let profile = store.create("alice", sample()).await.unwrap();
        let err = store.get("mallory", &profile.id).await.unwrap_err();
        assert!(matches!(err, PersistError::PermissionDenied));
    }

    #[tokio::test]
    async fn test_resolve_llm_decrypts() {
        let store = store().await;
        let profile = store.create("alice", sample()).await.unwrap();
        let resolved = store.resolve_llm("alice", &profile.id).await.unwrap();
        assert_eq!(resolved.api_key.as_str(), "sk-test-abcd1234");
        assert_eq!(resolved.model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_resolve_embedding_requires_flag() {
        let store = store().await;
        let profile = store.create("alice", sample()).await.unwrap();
        assert!(store.resolve_embedding("alice", &profile.id).await.is_err());

        let patch = ApiProfilePatch {
            is_embedding_model: Some(true),
            embedding_dim: Some(768),
            ..Default::default()
        };
        store.update("alice", &profile.id, patch).await.unwrap();
        let resolved = store.resolve_embedding("alice", &profile.id).await.unwrap();
        assert_eq!(resolved.dim, 768);
    }

    #[tokio::test]
    async fn test_update_rotates_key() {
        let store = store().await;
        let profile = store.create("alice", sample()).await.unwrap();
        let patch = ApiProfilePatch {
            api_key: Some("sk-rotated-9999".into()),
            ..Default::default()
        };
        let updated = store.update("alice", &profile.id, patch).await.unwrap();
        assert_ne!(updated.encrypted_api_key, profile.encrypted_api_key);
        let resolved = store.resolve_llm("alice", &profile.id).await.unwrap();
        assert_eq!(resolved.api_key.as_str(), "sk-rotated-9999");
    }
}
