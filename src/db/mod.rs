pub mod models;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: Pool<Sqlite>,
}

impl Database {
    /// Create an in-memory SQLite database for tests, with migrations applied.
    #[cfg(test)]
    pub async fn test_db() -> Self {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .expect("valid memory URL")
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // critical: multiple connections to :memory: get separate DBs
            .connect_with(options)
            .await
            .expect("connect to in-memory SQLite");

        let db = Self { pool };
        db.migrate().await.expect("run migrations");
        db
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }
}

/// Encode a list of ids as a JSON array for `json_each(?)` membership tests.
pub(crate) fn id_array(ids: &[i64]) -> String {
    serde_json::Value::from(ids.to_vec()).to_string()
}

/// Timestamp format used for every TEXT datetime column.
pub(crate) fn sql_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Recursive CTE mapping every namespace to its root namespace.
///
/// Prepend to a query with `WITH RECURSIVE` and join on `ancestry(id, root_id)`.
pub(crate) const NAMESPACE_ANCESTRY: &str = r#"
    ancestry(id, root_id) AS (
        SELECT id, id FROM namespaces WHERE parent_id IS NULL
        UNION ALL
        SELECT n.id, a.root_id FROM namespaces n JOIN ancestry a ON n.parent_id = a.id
    )
"#;
