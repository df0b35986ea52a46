use crate::config::DatabaseConfig;
use crate::db::models::*;
use crate::error::{AppError, AppResult};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use tracing::info;

pub type DbPool = Pool<Sqlite>;

/// Database operations for registered clients
pub struct ClientRepo;

impl ClientRepo {
    /// Get a client by id
    pub async fn get(pool: &DbPool, client_id: &str) -> AppResult<Option<Client>> {
        let client = sqlx::query_as::<_, Client>("SELECT * FROM clients WHERE client_id = ?")
            .bind(client_id)
            .fetch_optional(pool)
            .await?;

        Ok(client)
    }

    pub async fn exists(pool: &DbPool, client_id: &str) -> AppResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM clients WHERE client_id = ?")
            .bind(client_id)
            .fetch_optional(pool)
            .await?;
        Ok(found.is_some())
    }

    /// Create or replace a client's verifier and authorized set.
    ///
    /// One statement, so a concurrent reader sees either the old record or
    /// the new one. `created_at` survives a replacement.
    pub async fn upsert(pool: &DbPool, new_client: &NewClient) -> AppResult<Client> {
        let now = Utc::now();
        let repositories = serde_json::to_string(&new_client.repositories)
            .map_err(|e| AppError::internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO clients (client_id, secret_verifier, repositories, secret_issued_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(client_id) DO UPDATE SET
                secret_verifier = excluded.secret_verifier,
                repositories = excluded.repositories,
                secret_issued_at = excluded.secret_issued_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&new_client.client_id)
        .bind(&new_client.secret_verifier)
        .bind(&repositories)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::get(pool, &new_client.client_id)
            .await?
            .ok_or_else(|| AppError::internal("Failed to retrieve stored client"))
    }

    /// Insert a client only if the id is still free. Returns false on a clash.
    pub async fn insert_new(pool: &DbPool, new_client: &NewClient) -> AppResult<bool> {
        let now = Utc::now();
        let repositories = serde_json::to_string(&new_client.repositories)
            .map_err(|e| AppError::internal(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO clients (client_id, secret_verifier, repositories, secret_issued_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(client_id) DO NOTHING
            "#,
        )
        .bind(&new_client.client_id)
        .bind(&new_client.secret_verifier)
        .bind(&repositories)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn count(pool: &DbPool) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM clients")
            .fetch_one(pool)
            .await?;
        Ok(count)
    }
}

/// Open the client store.
///
/// An in-memory database only lives as long as its connection, so the pool
/// is pinned to one connection in that case.
pub async fn connect(config: &DatabaseConfig) -> AppResult<DbPool> {
    let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
    let max_connections = if config.url.contains(":memory:") {
        1
    } else {
        config.max_connections.max(1)
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    info!("Database connected: {}", config.url);
    Ok(pool)
}

#[cfg(test)]
pub async fn setup_test_db() -> DbPool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    init_db(&pool).await.expect("Failed to init database");
    pool
}

/// Initialize database schema
pub async fn init_db(pool: &DbPool) -> AppResult<()> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clients (
            client_id TEXT PRIMARY KEY NOT NULL,
            secret_verifier TEXT NOT NULL,
            repositories TEXT NOT NULL DEFAULT '[]',
            secret_issued_at DATETIME NOT NULL,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_client(client_id: &str, verifier: &str, repositories: &[&str]) -> NewClient {
        NewClient {
            client_id: client_id.to_string(),
            secret_verifier: verifier.to_string(),
            repositories: repositories.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_client_upsert_creates_new() {
        let pool = setup_test_db().await;
        let client = ClientRepo::upsert(&pool, &new_client("c1", "v1", &["docs"]))
            .await
            .unwrap();
        assert_eq!(client.client_id, "c1");
        assert_eq!(client.secret_verifier, "v1");
        assert_eq!(client.repositories(), vec!["docs"]);
    }

    #[tokio::test]
    async fn test_client_upsert_replaces_existing() {
        let pool = setup_test_db().await;
        let first = ClientRepo::upsert(&pool, &new_client("c1", "v1", &["docs"]))
            .await
            .unwrap();
        let second = ClientRepo::upsert(&pool, &new_client("c1", "v2", &["infra", "billing"]))
            .await
            .unwrap();

        assert_eq!(second.secret_verifier, "v2");
        assert_eq!(second.repositories(), vec!["infra", "billing"]);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(ClientRepo::count(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_client_get_nonexistent_returns_none() {
        let pool = setup_test_db().await;
        assert!(ClientRepo::get(&pool, "nope").await.unwrap().is_none());
        assert!(!ClientRepo::exists(&pool, "nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_new_refuses_clash() {
        let pool = setup_test_db().await;
        assert!(ClientRepo::insert_new(&pool, &new_client("c1", "v1", &["docs"]))
            .await
            .unwrap());
        assert!(!ClientRepo::insert_new(&pool, &new_client("c1", "v2", &["infra"]))
            .await
            .unwrap());

        let stored = ClientRepo::get(&pool, "c1").await.unwrap().unwrap();
        assert_eq!(stored.secret_verifier, "v1");
        assert!(ClientRepo::exists(&pool, "c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_init_db_is_idempotent() {
        let pool = setup_test_db().await;
        init_db(&pool).await.unwrap();
        assert_eq!(ClientRepo::count(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_in_memory() {
        let pool = connect(&DatabaseConfig::default()).await.unwrap();
        init_db(&pool).await.unwrap();
        ClientRepo::upsert(&pool, &new_client("c1", "v1", &["docs"]))
            .await
            .unwrap();
        assert!(ClientRepo::exists(&pool, "c1").await.unwrap());
    }
}
