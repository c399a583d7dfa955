//! SQLite-backed local storage for recipients, threads, known contacts and
//! job records.
//!
//! All tables live in one database so a job record can be deleted in the same
//! transaction that commits the state the job produced. Repository functions
//! take a `&mut SqliteConnection`, which is either a pooled connection or the
//! connection behind an open [`sqlx::Transaction`].

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

pub mod accounts;
pub mod disappearing;
pub mod recipients;
pub mod threads;

pub use accounts::SignalAccount;
pub use disappearing::{DisappearingMessagesConfiguration, DisappearingMessageToken, TimerUpdate};
pub use recipients::SignalRecipient;
pub use threads::ContactThread;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn corrupt(table: &'static str, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            reason: reason.into(),
        }
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS recipients (
        id            TEXT PRIMARY KEY,
        aci           TEXT NULL UNIQUE,
        phone_number  TEXT NULL UNIQUE,
        is_registered INTEGER NOT NULL DEFAULT 0,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS contact_threads (
        id                TEXT PRIMARY KEY,
        recipient_id      TEXT NOT NULL UNIQUE REFERENCES recipients(id),
        should_be_visible INTEGER NOT NULL DEFAULT 0,
        created_at        TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS disappearing_message_configs (
        thread_id        TEXT PRIMARY KEY REFERENCES contact_threads(id),
        is_enabled       INTEGER NOT NULL,
        duration_seconds INTEGER NOT NULL,
        timer_version    INTEGER NOT NULL,
        updated_at       TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS signal_accounts (
        id           TEXT PRIMARY KEY,
        phone_number TEXT NOT NULL UNIQUE,
        aci          TEXT NULL,
        contact_name TEXT NULL,
        created_at   TEXT NOT NULL,
        updated_at   TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_records (
        id              TEXT PRIMARY KEY,
        kind            TEXT NOT NULL,
        payload         TEXT NOT NULL,
        status          TEXT NOT NULL,
        attempt         INTEGER NOT NULL,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL,
        next_attempt_at TEXT NULL,
        last_error      TEXT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS job_records_kind_status ON job_records (kind, status)",
];

/// Handle to the local SQLite database.
///
/// Cheap to clone; clones share the same pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to `url` and create the schema if needed.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // Every connection to `:memory:` is a separate database, so an
        // in-memory pool must keep exactly one connection alive forever.
        let pool = if is_memory_url(url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await?
        };

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        tracing::debug!(url, "local database ready");
        Ok(Self { pool })
    }

    /// Fresh private in-memory database.
    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a write transaction. Dropping it without `commit` rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StorageError> {
        Ok(self.pool.begin().await?)
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// Parse a TEXT column into a domain value.
pub(crate) fn parse_column<T>(
    row: &SqliteRow,
    column: &str,
    table: &'static str,
) -> Result<T, StorageError>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e| StorageError::corrupt(table, format!("{column}: {e}")))
}

/// Parse a nullable TEXT column into a domain value.
pub(crate) fn parse_optional_column<T>(
    row: &SqliteRow,
    column: &str,
    table: &'static str,
) -> Result<Option<T>, StorageError>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|raw| {
        raw.parse()
            .map_err(|e| StorageError::corrupt(table, format!("{column}: {e}")))
    })
    .transpose()
}

/// Read an INTEGER column holding a `u32`.
pub(crate) fn u32_column(
    row: &SqliteRow,
    column: &str,
    table: &'static str,
) -> Result<u32, StorageError> {
    let raw: i64 = row.try_get(column)?;
    u32::try_from(raw).map_err(|_| StorageError::corrupt(table, format!("{column}: {raw} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_creation_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        for statement in SCHEMA {
            sqlx::query(statement).execute(db.pool()).await.unwrap();
        }

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();

        assert_eq!(
            tables,
            vec![
                "contact_threads",
                "disappearing_message_configs",
                "job_records",
                "recipients",
                "signal_accounts",
            ]
        );
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let db = Database::in_memory().await.unwrap();
        {
            let mut tx = db.begin().await.unwrap();
            sqlx::query(
                "INSERT INTO recipients (id, is_registered, created_at, updated_at) VALUES ('r1', 0, 'now', 'now')",
            )
            .execute(&mut *tx)
            .await
            .unwrap();
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM recipients")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
