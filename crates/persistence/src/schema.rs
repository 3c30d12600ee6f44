//! Schema creation
//!
//! Idempotent DDL executed at startup. Timestamps are stored as RFC 3339
//! text; booleans as 0/1 integers.

use sqlx::SqlitePool;

use crate::PersistError;

/// Create all required tables and indexes.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<(), PersistError> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS api_profiles (
            id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            name TEXT NOT NULL,
            base_url TEXT NOT NULL,
            model TEXT NOT NULL,
            encrypted_api_key TEXT NOT NULL,
            temperature REAL NOT NULL,
            is_embedding_model INTEGER NOT NULL DEFAULT 0,
            embedding_dim INTEGER,
            created_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_api_profiles_owner ON api_profiles(owner)",
        r#"
        CREATE TABLE IF NOT EXISTS personas (
            id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            handle TEXT NOT NULL,
            display_name TEXT NOT NULL,
            system_prompt TEXT NOT NULL,
            tone TEXT NOT NULL,
            proactivity REAL NOT NULL,
            memory_window INTEGER NOT NULL,
            max_agents_per_turn INTEGER NOT NULL,
            api_profile_id TEXT NOT NULL,
            embedding_profile_id TEXT,
            is_default INTEGER NOT NULL DEFAULT 0,
            background_text TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (owner, handle)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_personas_owner ON personas(owner)",
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            title TEXT,
            user_display_name TEXT,
            user_handle TEXT,
            user_persona TEXT,
            created_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_sessions_owner ON sessions(owner)",
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            sender TEXT NOT NULL,
            content TEXT NOT NULL,
            position INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (session_id, position)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, position)",
    ];

    for stmt in statements {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        ensure_schema(&pool).await.unwrap();
        ensure_schema(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('api_profiles', 'personas', 'sessions', 'messages')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 4);
    }
}
