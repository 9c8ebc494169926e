//! Per-folder index of announced files.
//!
//! Three tables back it: `entries` (path → bincoded [`FileInfo`]),
//! `entry_devices` (which peers advertise the current version of a path),
//! and `child_lookup` (parent directory → children). The device and child
//! sets are rows under composite primary keys, so adding and removing is
//! by value.

use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, warn};

use crate::database::{Database, DatabaseError};
use crate::protocol::{split_path, DeviceId, FileInfo};

#[derive(Debug, Error)]
pub enum TreeCacheError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("stored entry is corrupt: {0}")]
    Codec(#[from] bincode::Error),
}

pub struct FileTreeCache {
    db: Database,
    folder: String,
}

impl FileTreeCache {
    /// Open the index for `folder` and drop state belonging to peers that
    /// are no longer authorized for it.
    pub async fn open(
        db: Database,
        folder: &str,
        authorized: &[DeviceId],
    ) -> Result<Self, TreeCacheError> {
        let cache = Self {
            db,
            folder: folder.to_string(),
        };
        cache.cleanup_for_unshared_devices(authorized).await?;
        Ok(cache)
    }

    /// Record `file` as announced by `peer`: store the metadata, union the
    /// peer into the path's device set, and link the path under its parent.
    pub async fn add_entry(&self, file: &FileInfo, peer: &DeviceId) -> Result<(), TreeCacheError> {
        let info = bincode::serialize(file)?;
        let (parent, _) = split_path(&file.name);
        debug!(folder = %self.folder, path = %file.name, parent, peer = %peer.short(), "adding entry");

        let mut tx = self.db.begin().await?;
        sqlx::query("INSERT OR REPLACE INTO entries (folder, path, info) VALUES (?, ?, ?)")
            .bind(&self.folder)
            .bind(&file.name)
            .bind(info)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT OR IGNORE INTO entry_devices (folder, path, device) VALUES (?, ?, ?)")
            .bind(&self.folder)
            .bind(&file.name)
            .bind(peer.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT OR IGNORE INTO child_lookup (folder, parent, child) VALUES (?, ?, ?)")
            .bind(&self.folder)
            .bind(parent)
            .bind(&file.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Union `peer` into the device set of an existing entry without
    /// touching the stored metadata.
    pub async fn add_peer(&self, path: &str, peer: &DeviceId) -> Result<(), TreeCacheError> {
        sqlx::query("INSERT OR IGNORE INTO entry_devices (folder, path, device) VALUES (?, ?, ?)")
            .bind(&self.folder)
            .bind(path)
            .bind(peer.to_string())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn get_entry(&self, path: &str) -> Result<Option<FileInfo>, TreeCacheError> {
        let row = sqlx::query("SELECT info FROM entries WHERE folder = ? AND path = ?")
            .bind(&self.folder)
            .bind(path)
            .fetch_optional(self.db.pool())
            .await?;
        match row {
            Some(row) => Ok(Some(bincode::deserialize(row.get::<Vec<u8>, _>("info").as_slice())?)),
            None => Ok(None),
        }
    }

    /// Peers advertising the current version of `path`.
    pub async fn get_entry_devices(&self, path: &str) -> Result<Vec<DeviceId>, TreeCacheError> {
        let rows = sqlx::query("SELECT device FROM entry_devices WHERE folder = ? AND path = ?")
            .bind(&self.folder)
            .bind(path)
            .fetch_all(self.db.pool())
            .await?;
        let mut devices = Vec::with_capacity(rows.len());
        for row in &rows {
            let raw: String = row.get("device");
            match raw.parse() {
                Ok(id) => devices.push(id),
                Err(_) => warn!(folder = %self.folder, path, device = %raw, "dropping malformed device id"),
            }
        }
        Ok(devices)
    }

    /// Remove `path` and, recursively, everything beneath it.
    pub async fn remove_entry(&self, path: &str) -> Result<(), TreeCacheError> {
        // gather the subtree before touching anything
        let mut doomed = Vec::new();
        let mut stack = vec![path.to_string()];
        while let Some(current) = stack.pop() {
            stack.extend(self.get_children(&current).await?);
            doomed.push(current);
        }

        let (parent, _) = split_path(path);
        let mut tx = self.db.begin().await?;
        for victim in &doomed {
            sqlx::query("DELETE FROM entries WHERE folder = ? AND path = ?")
                .bind(&self.folder)
                .bind(victim)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM entry_devices WHERE folder = ? AND path = ?")
                .bind(&self.folder)
                .bind(victim)
                .execute(&mut *tx)
                .await?;
            // links from this node down to its children
            sqlx::query("DELETE FROM child_lookup WHERE folder = ? AND parent = ?")
                .bind(&self.folder)
                .bind(victim)
                .execute(&mut *tx)
                .await?;
        }
        let unlinked = sqlx::query(
            "DELETE FROM child_lookup WHERE folder = ? AND parent = ? AND child = ?",
        )
        .bind(&self.folder)
        .bind(parent)
        .bind(path)
        .execute(&mut *tx)
        .await?;
        if unlinked.rows_affected() == 0 {
            warn!(folder = %self.folder, path, "missing expected parent link");
        }
        tx.commit().await?;

        debug!(folder = %self.folder, path, removed = doomed.len(), "removed entry");
        Ok(())
    }

    /// Paths of the direct children of `path` (`""` is the folder root).
    pub async fn get_children(&self, path: &str) -> Result<Vec<String>, TreeCacheError> {
        let rows = sqlx::query("SELECT child FROM child_lookup WHERE folder = ? AND parent = ?")
            .bind(&self.folder)
            .bind(path)
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows.iter().map(|r| r.get("child")).collect())
    }

    /// Completion support: entries whose parent matches the prefix's parent
    /// exactly and whose base name starts with the prefix's base name. At
    /// most 13 results.
    pub async fn get_paths_matching_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<String>, TreeCacheError> {
        let (prefix_dir, prefix_base) = split_path(prefix);
        let mut result = Vec::new();

        let rows = sqlx::query("SELECT path FROM entries WHERE folder = ?")
            .bind(&self.folder)
            .fetch_all(self.db.pool())
            .await?;
        for row in &rows {
            if result.len() >= 13 {
                break;
            }
            let candidate: String = row.get("path");
            let (dir, base) = split_path(&candidate);
            if dir == prefix_dir && base.starts_with(prefix_base) {
                result.push(candidate);
            }
        }
        Ok(result)
    }

    /// Drop unauthorized peers from every device set; entries whose set
    /// becomes empty are removed (recursively). Runs once at open.
    async fn cleanup_for_unshared_devices(
        &self,
        authorized: &[DeviceId],
    ) -> Result<(), TreeCacheError> {
        let rows = sqlx::query("SELECT path, device FROM entry_devices WHERE folder = ?")
            .bind(&self.folder)
            .fetch_all(self.db.pool())
            .await?;

        let mut tx = self.db.begin().await?;
        for row in &rows {
            let device: String = row.get("device");
            let keep = device
                .parse::<DeviceId>()
                .map(|id| authorized.contains(&id))
                .unwrap_or(false);
            if !keep {
                let path: String = row.get("path");
                debug!(folder = %self.folder, path = %path, device = %device, "dropping unshared device");
                delete_device_row(&mut tx, &self.folder, &path, &device).await?;
            }
        }
        tx.commit().await?;

        let victims = sqlx::query(
            r#"
            SELECT path FROM entries WHERE folder = ?
            AND path NOT IN (SELECT path FROM entry_devices WHERE folder = ?)
            "#,
        )
        .bind(&self.folder)
        .bind(&self.folder)
        .fetch_all(self.db.pool())
        .await?;
        for row in &victims {
            let path: String = row.get("path");
            // may already be gone as part of an earlier victim's subtree
            if self.get_entry(&path).await?.is_some() {
                self.remove_entry(&path).await?;
            }
        }
        Ok(())
    }
}

async fn delete_device_row(
    tx: &mut Transaction<'static, Sqlite>,
    folder: &str,
    path: &str,
    device: &str,
) -> Result<(), TreeCacheError> {
    sqlx::query("DELETE FROM entry_devices WHERE folder = ? AND path = ? AND device = ?")
        .bind(folder)
        .bind(path)
        .bind(device)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
