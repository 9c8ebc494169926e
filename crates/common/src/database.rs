//! Embedded store for all cache metadata.
//!
//! One SQLite file under the config directory holds every folder's state:
//! the block-cache LRU (`cached_blocks`), the pinned set (`pinned_blocks`),
//! and the file-tree index (`entries`, `entry_devices`, `child_lookup`).
//! Each table carries a leading `folder` column; all mutation happens
//! inside transactions obtained from [`Database::begin`]. Migrations run in
//! code at open and are idempotent.

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use tracing::info;

/// File name of the store under the config directory.
pub const STORE_FILE: &str = "driftfs.db";

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection pool plus the directory blobs live beside.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    root: PathBuf,
}

impl Database {
    /// Open (creating if missing) the store under `root`, which is also the
    /// parent directory of the per-folder blob directories.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let options = SqliteConnectOptions::new()
            .filename(root.join(STORE_FILE))
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool, root };
        db.run_migrations().await?;

        info!(root = %db.root.display(), "store opened");
        Ok(db)
    }

    /// In-memory store rooted at `root` for blob files. Used in tests.
    pub async fn in_memory(root: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        // A single connection: every handle must see the same memory db.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Self { pool, root };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cached_blocks (
                folder TEXT NOT NULL,
                hash   TEXT NOT NULL,
                size   INTEGER NOT NULL,
                prev   TEXT,
                next   TEXT,
                PRIMARY KEY (folder, hash)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pinned_blocks (
                folder TEXT NOT NULL,
                hash   TEXT NOT NULL,
                size   INTEGER NOT NULL,
                PRIMARY KEY (folder, hash)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                folder TEXT NOT NULL,
                path   TEXT NOT NULL,
                info   BLOB NOT NULL,
                PRIMARY KEY (folder, path)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entry_devices (
                folder TEXT NOT NULL,
                path   TEXT NOT NULL,
                device TEXT NOT NULL,
                PRIMARY KEY (folder, path, device)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS child_lookup (
                folder TEXT NOT NULL,
                parent TEXT NOT NULL,
                child  TEXT NOT NULL,
                PRIMARY KEY (folder, parent, child)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Begin a read-write transaction. Dropping it without
    /// [`Transaction::commit`] rolls everything back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, DatabaseError> {
        Ok(self.pool.begin().await?)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Directory the per-folder blob directories live under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every folder id with any state in the store.
    pub async fn folder_ids(&self) -> Result<Vec<String>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT folder FROM cached_blocks
            UNION SELECT folder FROM pinned_blocks
            UNION SELECT folder FROM entries
            UNION SELECT folder FROM entry_devices
            UNION SELECT folder FROM child_lookup
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("folder")).collect())
    }

    /// Drop every row belonging to `folder`, atomically.
    pub async fn remove_folder(&self, folder: &str) -> Result<(), DatabaseError> {
        let mut tx = self.begin().await?;
        for table in [
            "cached_blocks",
            "pinned_blocks",
            "entries",
            "entry_devices",
            "child_lookup",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE folder = ?"))
                .bind(folder)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
