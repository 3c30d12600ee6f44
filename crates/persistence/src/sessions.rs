//! Conversation store
//!
//! Sessions and their append-only message logs. `append_message` assigns a
//! monotonically increasing per-session position inside a transaction, so the
//! commit order equals the position order even when `created_at` ties.

use chrono::Utc;
use sqlx::SqlitePool;

use parley_core::{Message, Session, SessionId, SessionPatch};

use crate::profiles::parse_timestamp;
use crate::PersistError;

type SessionRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

type MessageRow = (String, String, String, String, i64, String);

/// Store for sessions and messages.
#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Liveness probe for readiness checks.
    pub async fn ping(&self) -> Result<(), PersistError> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    /// Create a session for `owner` with optional metadata.
    pub async fn create_session(
        &self,
        owner: &str,
        meta: SessionPatch,
    ) -> Result<Session, PersistError> {
        let id = SessionId::generate(owner)
            .map_err(|e| PersistError::Invalid(e.to_string()))?;
        let session = Session {
            id,
            owner: owner.to_string(),
            title: meta.title,
            user_display_name: meta.user_display_name,
            user_handle: meta.user_handle,
            user_persona: meta.user_persona,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO sessions (id, owner, title, user_display_name, user_handle, \
             user_persona, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(session.id.as_str())
        .bind(&session.owner)
        .bind(&session.title)
        .bind(&session.user_display_name)
        .bind(&session.user_handle)
        .bind(&session.user_persona)
        .bind(session.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::info!(session_id = %session.id, owner = %owner, "Created session");
        Ok(session)
    }

    /// Fetch a session by id.
    pub async fn get_session(&self, id: &SessionId) -> Result<Session, PersistError> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT id, owner, title, user_display_name, user_handle, user_persona, created_at \
             FROM sessions WHERE id = ?1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| PersistError::NotFound(format!("session {}", id)))
            .and_then(row_to_session)
    }

    /// List sessions owned by `owner`, newest first.
    pub async fn list_sessions(&self, owner: &str) -> Result<Vec<Session>, PersistError> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT id, owner, title, user_display_name, user_handle, user_persona, created_at \
             FROM sessions WHERE owner = ?1 ORDER BY created_at DESC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_session).collect()
    }

    /// Update mutable session metadata.
    pub async fn update_session_meta(
        &self,
        id: &SessionId,
        patch: SessionPatch,
    ) -> Result<Session, PersistError> {
        let mut session = self.get_session(id).await?;

        if let Some(title) = patch.title {
            session.title = Some(title);
        }
        if let Some(name) = patch.user_display_name {
            session.user_display_name = Some(name);
        }
        if let Some(handle) = patch.user_handle {
            session.user_handle = Some(handle);
        }
        if let Some(persona) = patch.user_persona {
            session.user_persona = Some(persona);
        }

        sqlx::query(
            "UPDATE sessions SET title = ?1, user_display_name = ?2, user_handle = ?3, \
             user_persona = ?4 WHERE id = ?5",
        )
        .bind(&session.title)
        .bind(&session.user_display_name)
        .bind(&session.user_handle)
        .bind(&session.user_persona)
        .bind(session.id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    /// Delete a session, cascading its messages.
    pub async fn delete_session(&self, id: &SessionId) -> Result<(), PersistError> {
        self.get_session(id).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE session_id = ?1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(session_id = %id, "Deleted session");
        Ok(())
    }

    /// Bulk delete, restricted to sessions actually owned by `owner`.
    /// Returns the ids that were deleted.
    pub async fn delete_sessions(
        &self,
        ids: &[SessionId],
        owner: &str,
    ) -> Result<Vec<SessionId>, PersistError> {
        let mut deleted = Vec::new();
        for id in ids {
            let mut tx = self.pool.begin().await?;
            let owned: Option<(String,)> =
                sqlx::query_as("SELECT owner FROM sessions WHERE id = ?1")
                    .bind(id.as_str())
                    .fetch_optional(&mut *tx)
                    .await?;
            if owned.map(|(o,)| o == owner).unwrap_or(false) {
                sqlx::query("DELETE FROM messages WHERE session_id = ?1")
                    .bind(id.as_str())
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM sessions WHERE id = ?1")
                    .bind(id.as_str())
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                deleted.push(id.clone());
            }
        }
        Ok(deleted)
    }

    /// Append a message, atomically assigning the next position.
    pub async fn append_message(
        &self,
        session_id: &SessionId,
        sender: &str,
        content: &str,
    ) -> Result<Message, PersistError> {
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            sender: sender.to_string(),
            content: content.to_string(),
            position: 0,
            created_at: Utc::now(),
        };

        let mut tx = self.pool.begin().await?;

        let exists: Option<(String,)> =
            sqlx::query_as("SELECT id FROM sessions WHERE id = ?1")
                .bind(session_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(PersistError::NotFound(format!("session {}", session_id)));
        }

        let position: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(position), 0) + 1 FROM messages WHERE session_id = ?1",
        )
        .bind(session_id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO messages (id, session_id, sender, content, position, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&message.id)
        .bind(session_id.as_str())
        .bind(&message.sender)
        .bind(&message.content)
        .bind(position)
        .bind(message.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Message { position, ..message })
    }

    /// The most recent `limit` messages, returned oldest first.
    pub async fn list_messages(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<Message>, PersistError> {
        self.get_session(session_id).await?;

        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, session_id, sender, content, position, created_at FROM ( \
                 SELECT * FROM messages WHERE session_id = ?1 \
                 ORDER BY position DESC LIMIT ?2 \
             ) ORDER BY position ASC",
        )
        .bind(session_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }
}

fn row_to_session(row: SessionRow) -> Result<Session, PersistError> {
    let (id, owner, title, user_display_name, user_handle, user_persona, created_at) = row;
    Ok(Session {
        id: SessionId::parse(&id).map_err(|e| PersistError::InvalidRow(e.to_string()))?,
        owner,
        title,
        user_display_name,
        user_handle,
        user_persona,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn row_to_message(row: MessageRow) -> Result<Message, PersistError> {
    let (id, session_id, sender, content, position, created_at) = row;
    Ok(Message {
        id,
        session_id: SessionId::parse(&session_id)
            .map_err(|e| PersistError::InvalidRow(e.to_string()))?,
        sender,
        content,
        position,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::connect;

    async fn store() -> ConversationStore {
        ConversationStore::new(connect("sqlite::memory:").await.unwrap())
    }

    #[tokio::test]
    async fn test_create_embeds_owner() {
        let store = store().await;
        let session = store
            .create_session("alice", SessionPatch::default())
            .await
            .unwrap();
        assert_eq!(session.id.owner(), "alice");
        assert_eq!(store.get_session(&session.id).await.unwrap().owner, "alice");
    }

    #[tokio::test]
    async fn test_append_assigns_monotonic_positions() {
        let store = store().await;
        let session = store
            .create_session("alice", SessionPatch::default())
            .await
            .unwrap();

        let m1 = store.append_message(&session.id, "user", "first").await.unwrap();
        let m2 = store.append_message(&session.id, "user", "second").await.unwrap();
        let m3 = store.append_message(&session.id, "maid", "third").await.unwrap();

        assert!(m1.position < m2.position);
        assert!(m2.position < m3.position);
        assert!(m1.created_at <= m2.created_at);
    }

    #[tokio::test]
    async fn test_list_messages_is_ascending_and_truncated() {
        let store = store().await;
        let session = store
            .create_session("alice", SessionPatch::default())
            .await
            .unwrap();
        for i in 0..5 {
            store
                .append_message(&session.id, "user", &format!("msg {}", i))
                .await
                .unwrap();
        }

        let last_three = store.list_messages(&session.id, 3).await.unwrap();
        let contents: Vec<_> = last_three.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 2", "msg 3", "msg 4"]);
    }

    #[tokio::test]
    async fn test_delete_cascades_messages() {
        let store = store().await;
        let session = store
            .create_session("alice", SessionPatch::default())
            .await
            .unwrap();
        store.append_message(&session.id, "user", "hi").await.unwrap();
        store.delete_session(&session.id).await.unwrap();

        assert!(matches!(
            store.get_session(&session.id).await.unwrap_err(),
            PersistError::NotFound(_)
        ));
        assert!(matches!(
            store.append_message(&session.id, "user", "late").await.unwrap_err(),
            PersistError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_bulk_delete_respects_owner() {
        let store = store().await;
        let mine = store
            .create_session("alice", SessionPatch::default())
            .await
            .unwrap();
        let theirs = store
            .create_session("bob", SessionPatch::default())
            .await
            .unwrap();

        let deleted = store
            .delete_sessions(&[mine.id.clone(), theirs.id.clone()], "alice")
            .await
            .unwrap();
        assert_eq!(deleted, vec![mine.id]);
        assert!(store.get_session(&theirs.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_meta() {
        let store = store().await;
        let session = store
            .create_session("alice", SessionPatch::default())
            .await
            .unwrap();
        let patch = SessionPatch {
            title: Some("planning".into()),
            user_handle: Some("al".into()),
            ..Default::default()
        };
        let updated = store.update_session_meta(&session.id, patch).await.unwrap();
        assert_eq!(updated.title.as_deref(), Some("planning"));
        assert_eq!(updated.effective_user_handle(), "al");
    }
}
