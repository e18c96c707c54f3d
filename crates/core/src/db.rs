//! Durable key-value store backing population snapshots and federation
//! sequence counters.
//!
//! All durable state flows through the `SwarmDataStore` abstraction;
//! the SQLite implementation is the default and the in-memory pool is
//! used by tests. WAL event files are deliberately NOT stored here: the
//! learning bus owns its own append-only files.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::time::timeout;

const DB_TIMEOUT_SECS: u64 = 5;

/// Store scope for population state.
pub const POPULATION_STORE_ID: &str = "core.population";
/// Store scope for federation replay-protection counters.
pub const FEDERATION_STORE_ID: &str = "core.federation";

#[async_trait]
pub trait SwarmDataStore: Send + Sync {
    async fn get_json(&self, scope: &str, key: &str) -> anyhow::Result<Option<serde_json::Value>>;

    async fn set_json(
        &self,
        scope: &str,
        key: &str,
        value: serde_json::Value,
    ) -> anyhow::Result<()>;

    /// Atomically increment and return the counter stored under `key`.
    /// Crash-safe: the UPSERT and RETURNING happen in one statement.
    async fn increment_counter(&self, scope: &str, key: &str) -> anyhow::Result<i64>;
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options: SqliteConnectOptions = database_url.parse()?;
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options.create_if_missing(true))
            .await?;
        init_db(&pool).await?;
        Ok(Self { pool })
    }

    fn check_key(key: &str) -> anyhow::Result<()> {
        if key.contains('\0') {
            anyhow::bail!("Key must not contain null bytes");
        }
        if key.len() > 255 {
            anyhow::bail!("Key exceeds maximum length (255 characters)");
        }
        Ok(())
    }
}

pub async fn init_db(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS swarm_data (
            scope_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (scope_id, key)
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[async_trait]
impl SwarmDataStore for SqliteStore {
    async fn get_json(&self, scope: &str, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        Self::check_key(key)?;
        let query_future =
            sqlx::query("SELECT value FROM swarm_data WHERE scope_id = ? AND key = ?")
                .bind(scope)
                .bind(key)
                .fetch_optional(&self.pool);

        let row = timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(|_| {
                anyhow::anyhow!("Database operation timed out after {}s", DB_TIMEOUT_SECS)
            })??;

        match row {
            Some(row) => {
                let raw: String = row.get(0);
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn set_json(
        &self,
        scope: &str,
        key: &str,
        value: serde_json::Value,
    ) -> anyhow::Result<()> {
        Self::check_key(key)?;
        let raw = serde_json::to_string(&value)?;
        let query_future = sqlx::query(
            "INSERT INTO swarm_data (scope_id, key, value, updated_at)
             VALUES (?, ?, ?, datetime('now'))
             ON CONFLICT(scope_id, key) DO UPDATE
             SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(scope)
        .bind(key)
        .bind(raw)
        .execute(&self.pool);

        timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(|_| {
                anyhow::anyhow!("Database operation timed out after {}s", DB_TIMEOUT_SECS)
            })??;
        Ok(())
    }

    async fn increment_counter(&self, scope: &str, key: &str) -> anyhow::Result<i64> {
        Self::check_key(key)?;
        // Atomic UPSERT: INSERT or UPDATE in a single SQL statement.
        // The RETURNING clause gives us the new value without a second query.
        let query_future = sqlx::query(
            "INSERT INTO swarm_data (scope_id, key, value) VALUES (?, ?, '1')
             ON CONFLICT(scope_id, key) DO UPDATE
             SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)
             RETURNING value",
        )
        .bind(scope)
        .bind(key)
        .fetch_one(&self.pool);

        let row = timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(|_| {
                anyhow::anyhow!("Database operation timed out after {}s", DB_TIMEOUT_SECS)
            })??;

        let raw: String = row.get(0);
        raw.parse::<i64>()
            .map_err(|e| anyhow::anyhow!("Counter value '{}' is not an integer: {}", raw, e))
    }
}
