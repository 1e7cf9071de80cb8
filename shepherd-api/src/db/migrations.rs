//! Schema setup
//!
//! The applied schema version is kept in SQLite's `user_version` header, so
//! no bookkeeping table is needed.

use shepherd_common::{Error, Result};
use sqlx::SqlitePool;

/// Schema version this build writes
pub const SCHEMA_VERSION: i64 = 1;

const CLUSTERS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS clusters (
    server TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    project TEXT NOT NULL,
    document TEXT NOT NULL,
    revision INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_clusters_name ON clusters(project, name);
";

/// Schema version recorded in the database file, 0 when never set up
pub async fn schema_version(pool: &SqlitePool) -> Result<i64> {
    sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to read schema version: {}", e)))
}

/// Bring the schema up to [`SCHEMA_VERSION`]. Refuses files written by a
/// newer build.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current = schema_version(pool).await?;
    if current > SCHEMA_VERSION {
        return Err(Error::InvalidConfig(format!(
            "database schema version {} is newer than supported version {}",
            current, SCHEMA_VERSION
        )));
    }
    if current == SCHEMA_VERSION {
        tracing::debug!(version = current, "Database schema up to date");
        return Ok(());
    }

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| Error::System(format!("Failed to start schema transaction: {}", e)))?;
    sqlx::raw_sql(CLUSTERS_SCHEMA)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::System(format!("Failed to create clusters table: {}", e)))?;
    sqlx::raw_sql(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::System(format!("Failed to record schema version: {}", e)))?;
    tx.commit()
        .await
        .map_err(|e| Error::System(format!("Failed to commit schema: {}", e)))?;

    tracing::info!(from = current, to = SCHEMA_VERSION, "Applied database schema");
    Ok(())
}
