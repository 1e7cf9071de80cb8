//! Database layer using SQLite
//!
//! Provides persistent storage for registered clusters. Each entry is kept
//! as one JSON document keyed by server address.

pub mod migrations;

use shepherd_common::{Cluster, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection, creating the file when missing
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        // Create parent directory if needed
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        shepherd_common::Error::System(format!("Failed to create DB directory: {}", e))
                    })?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| shepherd_common::Error::InvalidConfig(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| shepherd_common::Error::System(format!("Database connection failed: {}", e)))?;

        tracing::info!("Database connection established");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool).await?;
        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // Cluster operations
    pub async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        clusters::list_clusters(&self.pool).await
    }

    pub async fn save_cluster(&self, cluster: &Cluster, revision: u64) -> Result<()> {
        clusters::save_cluster(&self.pool, cluster, revision).await
    }

    pub async fn delete_cluster(&self, server: &str) -> Result<()> {
        clusters::delete_cluster(&self.pool, server).await
    }

    /// Highest revision written so far, 0 for an empty table
    pub async fn max_revision(&self) -> Result<u64> {
        clusters::max_revision(&self.pool).await
    }

    /// Close the database connection
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Database connection closed");
    }
}

/// Cluster database operations
mod clusters {
    use super::*;
    use sqlx::Row;

    pub async fn list_clusters(pool: &SqlitePool) -> Result<Vec<Cluster>> {
        let rows = sqlx::query("SELECT server, document FROM clusters ORDER BY server")
            .fetch_all(pool)
            .await
            .map_err(|e| shepherd_common::Error::System(format!("Failed to list clusters: {}", e)))?;

        let mut clusters = Vec::with_capacity(rows.len());
        for row in rows {
            let server: String = row.get("server");
            let document: String = row.get("document");
            match serde_json::from_str::<Cluster>(&document) {
                Ok(cluster) => clusters.push(cluster),
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "Skipping unreadable cluster record");
                }
            }
        }

        Ok(clusters)
    }

    /// Insert or replace the record for `cluster.server`.
    ///
    /// Writes carrying an older `revision` than the stored one are ignored.
    pub async fn save_cluster(pool: &SqlitePool, cluster: &Cluster, revision: u64) -> Result<()> {
        let document = serde_json::to_string(cluster)?;

        sqlx::query(
            "INSERT INTO clusters (server, name, project, document, revision, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(server) DO UPDATE SET
                name = excluded.name,
                project = excluded.project,
                document = excluded.document,
                revision = excluded.revision,
                updated_at = excluded.updated_at
             WHERE excluded.revision >= clusters.revision",
        )
        .bind(&cluster.server)
        .bind(&cluster.name)
        .bind(&cluster.project)
        .bind(&document)
        .bind(revision as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(pool)
        .await
        .map_err(|e| shepherd_common::Error::System(format!("Failed to save cluster: {}", e)))?;

        Ok(())
    }

    pub async fn max_revision(pool: &SqlitePool) -> Result<u64> {
        let row = sqlx::query("SELECT COALESCE(MAX(revision), 0) AS revision FROM clusters")
            .fetch_one(pool)
            .await
            .map_err(|e| shepherd_common::Error::System(format!("Failed to read revision: {}", e)))?;

        let revision: i64 = row.get("revision");
        Ok(revision.max(0) as u64)
    }

    pub async fn delete_cluster(pool: &SqlitePool, server: &str) -> Result<()> {
        sqlx::query("DELETE FROM clusters WHERE server = ?")
            .bind(server)
            .execute(pool)
            .await
            .map_err(|e| shepherd_common::Error::System(format!("Failed to delete cluster: {}", e)))?;

        Ok(())
    }
}
