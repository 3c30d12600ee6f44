//! Persona store
//!
//! CRUD over personas, scoped by owner. Creating or re-pointing a persona
//! verifies that the referenced API profile belongs to the same owner; a
//! cross-tenant reference is rejected without revealing whether the profile
//! exists.

use chrono::Utc;
use serde::Deserialize;
use sqlx::SqlitePool;

use parley_core::{validate_handle, Persona};

use crate::profiles::parse_timestamp;
use crate::PersistError;

/// Row tuple for `personas` queries.
type PersonaRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    f64,
    i64,
    i64,
    String,
    Option<String>,
    i64,
    Option<String>,
    String,
);

/// Fields accepted when creating a persona.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPersona {
    pub handle: String,
    pub display_name: String,
    pub system_prompt: String,
    #[serde(default)]
    pub tone: String,
    #[serde(default = "default_proactivity")]
    pub proactivity: f32,
    #[serde(default = "default_memory_window")]
    pub memory_window: u32,
    #[serde(default = "default_max_agents")]
    pub max_agents_per_turn: u32,
    pub api_profile_id: String,
    #[serde(default)]
    pub embedding_profile_id: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub background_text: Option<String>,
}

fn default_proactivity() -> f32 {
    0.5
}

fn default_memory_window() -> u32 {
    20
}

fn default_max_agents() -> u32 {
    2
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersonaPatch {
    pub display_name: Option<String>,
    pub system_prompt: Option<String>,
    pub tone: Option<String>,
    pub proactivity: Option<f32>,
    pub memory_window: Option<u32>,
    pub max_agents_per_turn: Option<u32>,
    pub api_profile_id: Option<String>,
    pub embedding_profile_id: Option<String>,
    pub is_default: Option<bool>,
    pub background_text: Option<String>,
}

/// Store for personas.
#[derive(Clone)]
pub struct PersonaStore {
    pool: SqlitePool,
}

impl PersonaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a persona for `owner`.
    pub async fn create(&self, owner: &str, new: NewPersona) -> Result<Persona, PersistError> {
        validate_handle(&new.handle)
            .map_err(|_| PersistError::Invalid(format!("invalid handle: {:?}", new.handle)))?;
        self.check_profile_owner(owner, &new.api_profile_id).await?;
        if let Some(embedding_id) = &new.embedding_profile_id {
            self.check_embedding_profile(owner, embedding_id).await?;
        }

        let persona = Persona {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            handle: new.handle,
            display_name: new.display_name,
            system_prompt: new.system_prompt,
            tone: new.tone,
            proactivity: new.proactivity,
            memory_window: new.memory_window,
            max_agents_per_turn: new.max_agents_per_turn,
            api_profile_id: new.api_profile_id,
            embedding_profile_id: new.embedding_profile_id,
            is_default: new.is_default,
            background_text: new.background_text,
            created_at: Utc::now(),
        }
        .normalized();

        let mut tx = self.pool.begin().await?;

        if persona.is_default {
            // Newest default wins; a tenant has at most one.
            sqlx::query("UPDATE personas SET is_default = 0 WHERE owner = ?1")
                .bind(owner)
                .execute(&mut *tx)
                .await?;
        }

        let inserted = sqlx::query(
            "INSERT INTO personas (id, owner, handle, display_name, system_prompt, tone, \
             proactivity, memory_window, max_agents_per_turn, api_profile_id, \
             embedding_profile_id, is_default, background_text, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(&persona.id)
        .bind(&persona.owner)
        .bind(&persona.handle)
        .bind(&persona.display_name)
        .bind(&persona.system_prompt)
        .bind(&persona.tone)
        .bind(persona.proactivity as f64)
        .bind(persona.memory_window as i64)
        .bind(persona.max_agents_per_turn as i64)
        .bind(&persona.api_profile_id)
        .bind(&persona.embedding_profile_id)
        .bind(persona.is_default as i64)
        .bind(&persona.background_text)
        .bind(persona.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(PersistError::Conflict(format!(
                    "handle already in use: {}",
                    persona.handle
                )));
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;

        tracing::info!(persona_id = %persona.id, handle = %persona.handle, owner = %owner, "Created persona");
        Ok(persona)
    }

    /// Fetch a persona owned by `owner`.
    pub async fn get(&self, owner: &str, id: &str) -> Result<Persona, PersistError> {
        let row: Option<PersonaRow> = sqlx::query_as(
            "SELECT id, owner, handle, display_name, system_prompt, tone, proactivity, \
             memory_window, max_agents_per_turn, api_profile_id, embedding_profile_id, \
             is_default, background_text, created_at FROM personas WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| PersistError::NotFound(format!("persona {}", id)))?;
        if row.1 != owner {
            return Err(PersistError::PermissionDenied);
        }
        row_to_persona(row)
    }

    /// List all personas for `owner`, oldest first (stable roster order).
    pub async fn list(&self, owner: &str) -> Result<Vec<Persona>, PersistError> {
        let rows: Vec<PersonaRow> = sqlx::query_as(
            "SELECT id, owner, handle, display_name, system_prompt, tone, proactivity, \
             memory_window, max_agents_per_turn, api_profile_id, embedding_profile_id, \
             is_default, background_text, created_at FROM personas WHERE owner = ?1 ORDER BY created_at ASC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_persona).collect()
    }

    /// Apply a partial update.
    pub async fn update(
        &self,
        owner: &str,
        id: &str,
        patch: PersonaPatch,
    ) -> Result<Persona, PersistError> {
        let mut persona = self.get(owner, id).await?;

        if let Some(profile_id) = &patch.api_profile_id {
            self.check_profile_owner(owner, profile_id).await?;
            persona.api_profile_id = profile_id.clone();
        }
        if let Some(embedding_id) = &patch.embedding_profile_id {
            self.check_embedding_profile(owner, embedding_id).await?;
            persona.embedding_profile_id = Some(embedding_id.clone());
        }
        if let Some(display_name) = patch.display_name {
            persona.display_name = display_name;
        }
        if let Some(system_prompt) = patch.system_prompt {
            persona.system_prompt = system_prompt;
        }
        if let Some(tone) = patch.tone {
            persona.tone = tone;
        }
        if let Some(proactivity) = patch.proactivity {
            persona.proactivity = proactivity;
        }
        if let Some(memory_window) = patch.memory_window {
            persona.memory_window = memory_window;
        }
        if let Some(max_agents) = patch.max_agents_per_turn {
            persona.max_agents_per_turn = max_agents;
        }
        if let Some(background_text) = patch.background_text {
            persona.background_text = Some(background_text);
        }
        let becomes_default = patch.is_default.unwrap_or(persona.is_default);
        persona.is_default = becomes_default;
        let persona = persona.normalized();

        let mut tx = self.pool.begin().await?;

        if becomes_default {
            sqlx::query("UPDATE personas SET is_default = 0 WHERE owner = ?1 AND id != ?2")
                .bind(owner)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "UPDATE personas SET display_name = ?1, system_prompt = ?2, tone = ?3, \
             proactivity = ?4, memory_window = ?5, max_agents_per_turn = ?6, \
             api_profile_id = ?7, embedding_profile_id = ?8, is_default = ?9, \
             background_text = ?10 WHERE id = ?11 AND owner = ?12",
        )
        .bind(&persona.display_name)
        .bind(&persona.system_prompt)
        .bind(&persona.tone)
        .bind(persona.proactivity as f64)
        .bind(persona.memory_window as i64)
        .bind(persona.max_agents_per_turn as i64)
        .bind(&persona.api_profile_id)
        .bind(&persona.embedding_profile_id)
        .bind(persona.is_default as i64)
        .bind(&persona.background_text)
        .bind(&persona.id)
        .bind(owner)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(persona)
    }

    /// Delete a persona. The caller is responsible for dropping its
    /// retrieval collection.
    pub async fn delete(&self, owner: &str, id: &str) -> Result<(), PersistError> {
        self.get(owner, id).await?;
        sqlx::query("DELETE FROM personas WHERE id = ?1 AND owner = ?2")
            .bind(id)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        tracing::info!(persona_id = %id, owner = %owner, "Deleted persona");
        Ok(())
    }

    /// Reject cross-tenant API-profile references.
    async fn check_profile_owner(&self, owner: &str, profile_id: &str) -> Result<(), PersistError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT owner FROM api_profiles WHERE id = ?1")
                .bind(profile_id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            None => Err(PersistError::NotFound(format!("api profile {}", profile_id))),
            Some((profile_owner,)) if profile_owner != owner => {
                Err(PersistError::PermissionDenied)
            }
            Some(_) => Ok(()),
        }
    }

    /// An embedding reference must point at an embedding-capable profile
    /// owned by the same tenant.
    async fn check_embedding_profile(
        &self,
        owner: &str,
        profile_id: &str,
    ) -> Result<(), PersistError> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT owner, is_embedding_model FROM api_profiles WHERE id = ?1")
                .bind(profile_id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            None => Err(PersistError::NotFound(format!("api profile {}", profile_id))),
            Some((profile_owner, _)) if profile_owner != owner => {
                Err(PersistError::PermissionDenied)
            }
            Some((_, is_embedding)) if is_embedding == 0 => {
                Err(PersistError::NotEmbedding(profile_id.to_string()))
            }
            Some(_) => Ok(()),
        }
    }
}

fn row_to_persona(row: PersonaRow) -> Result<Persona, PersistError> {
    let (
        id,
        owner,
        handle,
        display_name,
        system_prompt,
        tone,
        proactivity,
        memory_window,
        max_agents_per_turn,
        api_profile_id,
        embedding_profile_id,
        is_default,
        background_text,
        created_at,
    ) = row;
    Ok(Persona {
        id,
        owner,
        handle,
        display_name,
        system_prompt,
        tone,
        proactivity: proactivity as f32,
        memory_window: memory_window as u32,
        max_agents_per_turn: max_agents_per_turn as u32,
        api_profile_id,
        embedding_profile_id,
        is_default: is_default != 0,
        background_text,
        created_at: parse_timestamp(&created_at)?,
    })
}
