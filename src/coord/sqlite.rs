use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};

use super::{child_prefix, parent_paths, CoordBackend, Node};
use crate::error::{PipelineError, Result};

/// Durable coordination store on SQLite.
///
/// Create-if-not-exists relies on the primary key; compare-and-swap is an
/// `UPDATE ... WHERE version = ?` that must touch exactly one row.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
}

impl SqliteBackend {
    /// Open (or create) the store at `db_path` and run migrations
    pub async fn open(db_path: &str, max_connections: u32) -> anyhow::Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path);
        Self::connect(&db_url, max_connections).await
    }

    /// Private in-memory database, mainly for tests.
    /// A single connection keeps every query on the same database.
    pub async fn in_memory() -> anyhow::Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(db_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await
            .context("Failed to connect to coordination database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run coordination database migrations")?;

        Ok(Self { pool })
    }
}

fn map_create_error(path: &str, e: sqlx::Error) -> PipelineError {
    if let sqlx::Error::Database(ref db) = e {
        if db.is_unique_violation() {
            return PipelineError::NodeExists(path.to_string());
        }
    }
    e.into()
}

#[async_trait]
impl CoordBackend for SqliteBackend {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create(&self, path: &str, value: &[u8], owner: Option<u64>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        for parent in parent_paths(path) {
            sqlx::query(
                "INSERT OR IGNORE INTO nodes (path, value, version, created_at, updated_at) VALUES (?, x'', 0, ?, ?)",
            )
            .bind(&parent)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            r#"
            INSERT INTO nodes (path, value, version, ephemeral_owner, created_at, updated_at)
            VALUES (?, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(path)
        .bind(value)
        .bind(owner.map(|o| o as i64))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_create_error(path, e))?;
        tx.commit().await?;
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Option<Node>> {
        let row = sqlx::query("SELECT value, version, ephemeral_owner FROM nodes WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Node {
            value: r.get("value"),
            version: r.get("version"),
            ephemeral_owner: r.get::<Option<i64>, _>("ephemeral_owner").map(|o| o as u64),
        }))
    }

    async fn update(&self, path: &str, value: &[u8], version: Option<i64>) -> Result<i64> {
        let now = Utc::now();
        let result = match version {
            Some(expected) => {
                sqlx::query(
                    "UPDATE nodes SET value = ?, version = version + 1, updated_at = ? WHERE path = ? AND version = ?",
                )
                .bind(value)
                .bind(now)
                .bind(path)
                .bind(expected)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "UPDATE nodes SET value = ?, version = version + 1, updated_at = ? WHERE path = ?",
                )
                .bind(value)
                .bind(now)
                .bind(path)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return match self.read(path).await? {
                Some(_) => Err(PipelineError::BadVersion(path.to_string())),
                None => Err(PipelineError::NotFound(path.to_string())),
            };
        }

        let row = sqlx::query("SELECT version FROM nodes WHERE path = ?")
            .bind(path)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("version"))
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let prefix = child_prefix(path);
        let mut tx = self.pool.begin().await?;
        let (children,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM nodes WHERE substr(path, 1, length(?1)) = ?1",
        )
        .bind(&prefix)
        .fetch_one(&mut *tx)
        .await?;

        if children > 0 && !recursive {
            return Err(PipelineError::Conflict(format!("{} has children", path)));
        }
        if recursive {
            sqlx::query("DELETE FROM nodes WHERE substr(path, 1, length(?1)) = ?1")
                .bind(&prefix)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM nodes WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let prefix = child_prefix(path);
        let rows = sqlx::query(
            "SELECT path FROM nodes WHERE substr(path, 1, length(?1)) = ?1 ORDER BY path",
        )
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                let full: String = r.get("path");
                let rest = full.get(prefix.len()..)?;
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nodes WHERE path = ?")
            .bind(path)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn release_owner(&self, owner: u64) -> Result<usize> {
        let result = sqlx::query("DELETE FROM nodes WHERE ephemeral_owner = ?")
            .bind(owner as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}
