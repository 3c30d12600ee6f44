//! Domain entities
//!
//! Plain data carried between the stores, the scheduler, the runtime, and the
//! API layer. Owner scoping is by `username`; see [`crate::ids`] for the
//! identifier formats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// An upstream OpenAI-compatible endpoint plus credentials.
///
/// `encrypted_api_key` holds ciphertext only; the plaintext is materialized
/// by the persona store inside the call frame that dispatches to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiProfile {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub encrypted_api_key: String,
    pub temperature: f32,
    pub is_embedding_model: bool,
    /// Vector dimension for embedding profiles; bounds the dimension used
    /// when creating a persona's retrieval collection.
    pub embedding_dim: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl ApiProfile {
    /// Masked key preview (`****` + last 4) safe to return to clients.
    pub fn key_preview(plaintext: &str) -> String {
        let last4: String = plaintext
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("****{}", last4)
    }
}

/// One participant in a group chat: a prompt-and-config bundle bound to an
/// API profile, with an optional private knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub owner: String,
    /// Mention slug, unique per owner (`@handle`).
    pub handle: String,
    pub display_name: String,
    pub system_prompt: String,
    pub tone: String,
    /// Baseline bias toward speaking up, in `[0, 1]`.
    pub proactivity: f32,
    /// How many history messages the runtime renders into the prompt.
    pub memory_window: u32,
    pub max_agents_per_turn: u32,
    pub api_profile_id: String,
    /// Embedding profile backing this persona's knowledge base. Personas
    /// without one run in direct mode and cannot ingest documents.
    pub embedding_profile_id: Option<String>,
    pub is_default: bool,
    /// Optional seed document; chunked and indexed into the persona's
    /// retrieval collection when present.
    pub background_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Persona {
    /// Whether the persona is configured for retrieval-augmented replies.
    pub fn has_knowledge_config(&self) -> bool {
        self.embedding_profile_id.is_some()
    }
}

impl Persona {
    /// Clamp tunables into their documented ranges.
    pub fn normalized(mut self) -> Self {
        self.proactivity = self.proactivity.clamp(0.0, 1.0);
        self.memory_window = self.memory_window.max(1);
        self.max_agents_per_turn = self.max_agents_per_turn.max(1);
        self
    }
}

/// A long-lived conversation owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub owner: String,
    pub title: Option<String>,
    pub user_display_name: Option<String>,
    pub user_handle: Option<String>,
    pub user_persona: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Handle under which the human participant appears in the message log.
    pub fn effective_user_handle(&self) -> &str {
        self.user_handle.as_deref().unwrap_or("user")
    }
}

/// Mutable session metadata accepted by `PATCH /sessions/{id}`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SessionPatch {
    pub title: Option<String>,
    pub user_display_name: Option<String>,
    pub user_handle: Option<String>,
    pub user_persona: Option<String>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.user_display_name.is_none()
            && self.user_handle.is_none()
            && self.user_persona.is_none()
    }
}

/// One committed message in a session's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: SessionId,
    /// User handle or persona handle.
    pub sender: String,
    pub content: String,
    /// Monotonically increasing per session; breaks `created_at` ties.
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persona_normalized_clamps() {
        let p = Persona {
            id: "p".into(),
            owner: "u".into(),
            handle: "h".into(),
            display_name: "H".into(),
            system_prompt: String::new(),
            tone: String::new(),
            proactivity: 1.7,
            memory_window: 0,
            max_agents_per_turn: 0,
            api_profile_id: "a".into(),
            embedding_profile_id: None,
            is_default: false,
            background_text: None,
            created_at: Utc::now(),
        }
        .normalized();
        assert_eq!(p.proactivity, 1.0);
        assert_eq!(p.memory_window, 1);
        assert_eq!(p.max_agents_per_turn, 1);
    }

    #[test]
    fn test_key_preview_shows_last4_only() {
        assert_eq!(ApiProfile::key_preview("sk-abcdef123456"), "****3456");
        assert_eq!(ApiProfile::key_preview("abc"), "****abc");
    }

    #[test]
    fn test_session_patch_empty() {
        assert!(SessionPatch::default().is_empty());
        let p = SessionPatch {
            title: Some("t".into()),
            ..Default::default()
        };
        assert!(!p.is_empty());
    }
}
