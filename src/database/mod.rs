use crate::config::DatabaseConfig;
use crate::errors::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{migrate::MigrateDatabase, Pool, Sqlite};

pub mod executions;
pub mod jobs;
pub mod processed_events;

/// Durable store for jobs, executions and the processed-event ledger.
///
/// The repository is the sole source of truth for job state; in-memory
/// maps held by the scheduler are derived projections and may lag.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            Sqlite::create_database(&config.url)
                .await
                .context("creating database")?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(10))
            .connect(&config.url)
            .await
            .context("connecting to database")?;

        Ok(Self { pool })
    }

    /// In-memory database for tests. A single connection keeps every
    /// query on the same sqlite memory instance.
    pub async fn new_in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("connecting to in-memory database")?;
        let database = Self { pool };
        database.migrate().await?;
        Ok(database)
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

/// Parse a datetime stored as either RFC3339 or the bare sqlite format.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc());
    }
    Err(crate::errors::AppError::fatal(format!(
        "unparseable datetime in database: {s}"
    )))
}

pub(crate) fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_datetime(&v)).transpose()
}
