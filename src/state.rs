//! Local engine state: checkpoints and the branch registry.
//!
//! A small SQLite database (WAL mode) records, per file, the content
//! identity that was last written successfully — the resume-on-restart
//! checkpoint — plus every branch the engine has ever observed and the
//! branch the index currently tracks. The vector store holds the content;
//! this database only holds progress metadata.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Content identity recorded for a completed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub commit: String,
    pub content_hash: String,
}

pub struct StateDb {
    pool: SqlitePool,
}

impl StateDb {
    /// Open (or create) the state database.
    ///
    /// `writers` is the number of tasks that will hit the database at once
    /// — the T+2 pipeline workers all upsert checkpoints as their files
    /// complete. The pool holds one connection per writer plus one for the
    /// driving command, and SQLite's busy handler waits out the brief
    /// WAL-append contention instead of surfacing `SQLITE_BUSY`.
    pub async fn connect(path: &Path, writers: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(writers.max(1) as u32 + 1)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Create the schema. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                path TEXT PRIMARY KEY,
                commit_id TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS branches (
                name TEXT PRIMARY KEY,
                last_seen_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn checkpoint_get(&self, path: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query("SELECT commit_id, content_hash FROM checkpoints WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| Checkpoint {
            commit: r.get(0),
            content_hash: r.get(1),
        }))
    }

    /// Record a file as completely written. Called as each file's batch
    /// write succeeds, so a crash loses at most the in-flight files.
    pub async fn checkpoint_put(&self, path: &str, commit: &str, content_hash: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO checkpoints (path, commit_id, content_hash, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                commit_id = excluded.commit_id,
                content_hash = excluded.content_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(path)
        .bind(commit)
        .bind(content_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn checkpoint_remove(&self, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn checkpoints_all(&self) -> Result<HashMap<String, Checkpoint>> {
        let rows = sqlx::query("SELECT path, commit_id, content_hash FROM checkpoints")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get::<String, _>(0),
                    Checkpoint {
                        commit: r.get(1),
                        content_hash: r.get(2),
                    },
                )
            })
            .collect())
    }

    pub async fn checkpoint_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM checkpoints")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn record_branch(&self, name: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO branches (name, last_seen_at) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(name)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn known_branches(&self) -> Result<HashSet<String>> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT name FROM branches")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// Branch the index currently reflects (set on every index/switch run).
    pub async fn tracked_branch(&self) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM meta WHERE key = 'tracked_branch'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    pub async fn set_tracked_branch(&self, branch: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO meta (key, value) VALUES ('tracked_branch', ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(branch)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
