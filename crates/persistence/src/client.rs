//! Database connection management

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::schema;
use crate::PersistError;

/// Open a connection pool and ensure the schema exists.
pub async fn connect(database_url: &str) -> Result<SqlitePool, PersistError> {
    tracing::info!(url = %redact_url(database_url), "Connecting to relational store");

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await?;

    schema::ensure_schema(&pool).await?;
    tracing::info!("Schema ensured");

    Ok(pool)
}

/// Strip credentials from a connection string before logging it.
fn redact_url(url: &str) -> String {
    match url.split_once('@') {
        Some((_, host)) => format!("***@{}", host),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_in_memory() {
        let pool = connect("sqlite::memory:").await.unwrap();
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&pool).await.unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("postgres://user:pw@db:5432/x"),
            "***@db:5432/x"
        );
        assert_eq!(redact_url("sqlite::memory:"), "sqlite::memory:");
    }
}
