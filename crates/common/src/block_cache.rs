//! Per-folder LRU cache of block payloads, with a pinned sub-set.
//!
//! Cache membership and recency order live in the store: each
//! `cached_blocks` row carries `prev`/`next` hashes forming a doubly-linked
//! list from MRU to LRU, so the whole structure is reconstructible after a
//! restart from the rows alone. Payloads are files in the folder's
//! [`BlobDir`]. Pinned blocks sit in `pinned_blocks`, do not count against
//! the byte budget, and their payloads survive eviction.

use std::collections::HashSet;

use bytes::Bytes;
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::blobs::BlobDir;
use crate::database::{Database, DatabaseError};
use crate::protocol::{BlockHash, BlockInfo};

#[derive(Debug, Error)]
pub enum BlockCacheError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One row of `cached_blocks`; keys are URL-safe base64 block hashes.
#[derive(Debug, Clone)]
struct CacheEntry {
    hash: String,
    size: i64,
    prev: Option<String>,
    next: Option<String>,
}

/// In-memory list head/tail and byte count, staged through mutations and
/// written back to the cache only after the transaction commits.
#[derive(Debug, Clone)]
struct ListState {
    mru: Option<String>,
    lru: Option<String>,
    current: i64,
}

pub struct FileBlockCache {
    db: Database,
    blobs: BlobDir,
    folder: String,
    max_bytes: i64,
    state: ListState,
}

impl FileBlockCache {
    /// Open the cache for `folder`, rebuilding the list pointers and byte
    /// count from the store, then evicting in case the budget shrank.
    pub async fn open(
        db: Database,
        folder: &str,
        max_bytes: u64,
    ) -> Result<Self, BlockCacheError> {
        let blobs = BlobDir::open(db.root(), folder)?;
        let mut cache = Self {
            db,
            blobs,
            folder: folder.to_string(),
            max_bytes: max_bytes as i64,
            state: ListState {
                mru: None,
                lru: None,
                current: 0,
            },
        };

        let pinned: HashSet<String> =
            sqlx::query("SELECT hash FROM pinned_blocks WHERE folder = ?")
                .bind(&cache.folder)
                .fetch_all(cache.db.pool())
                .await?
                .iter()
                .map(|r| r.get("hash"))
                .collect();

        let rows = sqlx::query("SELECT hash, size, prev, next FROM cached_blocks WHERE folder = ?")
            .bind(&cache.folder)
            .fetch_all(cache.db.pool())
            .await?;
        for row in &rows {
            let hash: String = row.get("hash");
            let prev: Option<String> = row.get("prev");
            let next: Option<String> = row.get("next");
            if prev.is_none() {
                cache.state.mru = Some(hash.clone());
            }
            if next.is_none() {
                cache.state.lru = Some(hash.clone());
            }
            if !pinned.contains(&hash) {
                cache.state.current += row.get::<i64, _>("size");
            }
        }

        info!(
            folder = %cache.folder,
            max_bytes = cache.max_bytes,
            current_bytes = cache.state.current,
            "block cache opened"
        );

        // the configured budget may have shrunk since last run
        let mut tx = cache.db.begin().await?;
        let mut state = cache.state.clone();
        let victims = evict_for_size(&mut tx, &cache.folder, &mut state, cache.max_bytes, 0).await?;
        tx.commit().await?;
        cache.state = state;
        cache.remove_victim_blobs(victims).await;

        Ok(cache)
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes as u64
    }

    pub fn current_bytes(&self) -> i64 {
        self.state.current
    }

    pub async fn has_cached(&self, hash: &BlockHash) -> Result<bool, BlockCacheError> {
        let row = sqlx::query("SELECT 1 FROM cached_blocks WHERE folder = ? AND hash = ?")
            .bind(&self.folder)
            .bind(hash.to_base64())
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.is_some())
    }

    pub async fn has_pinned(&self, hash: &BlockHash) -> Result<bool, BlockCacheError> {
        let row = sqlx::query("SELECT 1 FROM pinned_blocks WHERE folder = ? AND hash = ?")
            .bind(&self.folder)
            .bind(hash.to_base64())
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.is_some())
    }

    /// Fetch a payload, promoting the block to MRU. A hit on a pinned-only
    /// block inserts it into the LRU as well (the pinned entry remains and
    /// its bytes stay outside the budget). `Ok(None)` is a miss.
    pub async fn get(&mut self, hash: &BlockHash) -> Result<Option<Bytes>, BlockCacheError> {
        let key = hash.to_base64();
        let mut tx = self.db.begin().await?;
        let mut state = self.state.clone();
        let mut victims = Vec::new();

        match get_entry(&mut tx, &self.folder, &key).await? {
            Some(current) => {
                if state.mru.as_deref() != Some(key.as_str()) {
                    if current.prev.is_none() {
                        warn!(folder = %self.folder, hash = %key, "broken LRU: entry has no previous but is not at MRU");
                    }
                    splice_out(&mut tx, &self.folder, &mut state, &current).await?;
                    push_front(&mut tx, &self.folder, &mut state, &key, current.size).await?;
                }
                debug!(folder = %self.folder, hash = %key, "block cache hit");
            }
            None => {
                let pinned_size =
                    match get_pinned_size(&mut tx, &self.folder, &key).await? {
                        Some(size) => size,
                        None => {
                            debug!(folder = %self.folder, hash = %key, "block cache miss");
                            return Ok(None);
                        }
                    };
                debug!(folder = %self.folder, hash = %key, "pinned block hit");
                push_front(&mut tx, &self.folder, &mut state, &key, pinned_size).await?;
                // pinned bytes are outside the budget; this only matters if
                // the budget itself is already exceeded
                victims =
                    evict_for_size(&mut tx, &self.folder, &mut state, self.max_bytes, 0).await?;
            }
        }

        tx.commit().await?;
        self.state = state;
        self.remove_victim_blobs(victims).await;

        match self.blobs.read(hash).await? {
            Some(data) => Ok(Some(data)),
            None => {
                // the row promised a payload that is gone; drop the row and
                // let the caller pull the block again
                self.recover_missing_blob(hash).await?;
                Ok(None)
            }
        }
    }

    /// Insert a fetched payload, evicting from the LRU tail first so the
    /// budget holds, then writing the blob and the MRU entry.
    pub async fn put(&mut self, block: &BlockInfo, data: &[u8]) -> Result<(), BlockCacheError> {
        let key = block.hash.to_base64();
        debug!(
            folder = %self.folder,
            hash = %key,
            size = block.size,
            max_bytes = self.max_bytes,
            "caching block"
        );

        let mut tx = self.db.begin().await?;
        let mut state = self.state.clone();

        let victims = evict_for_size(
            &mut tx,
            &self.folder,
            &mut state,
            self.max_bytes,
            block.size as i64,
        )
        .await?;
        push_front(&mut tx, &self.folder, &mut state, &key, block.size as i64).await?;
        state.current += block.size as i64;

        self.blobs.write(&block.hash, data).await?;
        tx.commit().await?;
        self.state = state;
        self.remove_victim_blobs(victims).await;
        Ok(())
    }

    /// Pin a block whose payload was just fetched. If the block is already
    /// cached its bytes move out of the budget; otherwise the blob is
    /// written as pinned-only.
    pub async fn pin_new(&mut self, block: &BlockInfo, data: &[u8]) -> Result<(), BlockCacheError> {
        let key = block.hash.to_base64();
        debug!(folder = %self.folder, hash = %key, "pinning new block");

        let mut tx = self.db.begin().await?;
        let mut state = self.state.clone();

        if get_entry(&mut tx, &self.folder, &key).await?.is_some() {
            state.current -= block.size as i64;
        } else {
            self.blobs.write(&block.hash, data).await?;
        }
        set_pinned(&mut tx, &self.folder, &key, block.size as i64).await?;

        tx.commit().await?;
        self.state = state;
        Ok(())
    }

    /// Pin a block already resident in the LRU; its bytes leave the budget.
    pub async fn pin_existing(&mut self, block: &BlockInfo) -> Result<(), BlockCacheError> {
        let key = block.hash.to_base64();
        let mut tx = self.db.begin().await?;
        let mut state = self.state.clone();

        if get_entry(&mut tx, &self.folder, &key).await?.is_none() {
            warn!(folder = %self.folder, hash = %key, "pin_existing on uncached block, skipping");
            return Ok(());
        }
        debug!(folder = %self.folder, hash = %key, "pinning existing block");
        set_pinned(&mut tx, &self.folder, &key, block.size as i64).await?;
        state.current -= block.size as i64;

        tx.commit().await?;
        self.state = state;
        Ok(())
    }

    /// Remove a block from the pinned set. If it is also cached, its bytes
    /// re-enter the budget (evicting as needed); if it was pinned-only, the
    /// payload is deleted.
    pub async fn unpin(&mut self, hash: &BlockHash) -> Result<(), BlockCacheError> {
        let key = hash.to_base64();
        let mut tx = self.db.begin().await?;
        let mut state = self.state.clone();
        let mut victims = Vec::new();
        let mut drop_blob = false;

        if let Some(size) = get_pinned_size(&mut tx, &self.folder, &key).await? {
            delete_pinned(&mut tx, &self.folder, &key).await?;
            if get_entry(&mut tx, &self.folder, &key).await?.is_some() {
                state.current += size;
                victims =
                    evict_for_size(&mut tx, &self.folder, &mut state, self.max_bytes, 0).await?;
            } else {
                drop_blob = true;
            }
        } else {
            delete_pinned(&mut tx, &self.folder, &key).await?;
        }

        tx.commit().await?;
        self.state = state;
        self.remove_victim_blobs(victims).await;
        if drop_blob {
            self.blobs.remove(hash).await;
        }
        Ok(())
    }

    async fn recover_missing_blob(&mut self, hash: &BlockHash) -> Result<(), BlockCacheError> {
        let key = hash.to_base64();
        warn!(folder = %self.folder, hash = %key, "cached block payload missing, dropping entry");

        let mut tx = self.db.begin().await?;
        let mut state = self.state.clone();

        if let Some(entry) = get_entry(&mut tx, &self.folder, &key).await? {
            splice_out(&mut tx, &self.folder, &mut state, &entry).await?;
            delete_entry(&mut tx, &self.folder, &key).await?;
            state.current -= entry.size;
        }
        // a pinned row without a payload cannot be served either; dropping
        // it lets the next pin pass fetch the block again
        delete_pinned(&mut tx, &self.folder, &key).await?;

        tx.commit().await?;
        self.state = state;
        Ok(())
    }

    async fn remove_victim_blobs(&self, victims: Vec<String>) {
        for key in victims {
            if let Some(hash) = BlockHash::from_base64(&key) {
                self.blobs.remove(&hash).await;
            }
        }
    }
}

/// Unlink `entry` from wherever it sits in the list, fixing up neighbors
/// and the staged head/tail. The row itself is left for the caller.
async fn splice_out(
    tx: &mut Transaction<'static, Sqlite>,
    folder: &str,
    state: &mut ListState,
    entry: &CacheEntry,
) -> Result<(), BlockCacheError> {
    match &entry.prev {
        Some(prev_key) => {
            if let Some(mut prev) = get_entry(tx, folder, prev_key).await? {
                prev.next = entry.next.clone();
                set_entry(tx, folder, &prev).await?;
            }
        }
        None => state.mru = entry.next.clone(),
    }
    match &entry.next {
        Some(next_key) => {
            if let Some(mut next) = get_entry(tx, folder, next_key).await? {
                next.prev = entry.prev.clone();
                set_entry(tx, folder, &next).await?;
            }
        }
        None => state.lru = entry.prev.clone(),
    }
    Ok(())
}

/// Write `key` as the new MRU entry of the list.
async fn push_front(
    tx: &mut Transaction<'static, Sqlite>,
    folder: &str,
    state: &mut ListState,
    key: &str,
    size: i64,
) -> Result<(), BlockCacheError> {
    if let Some(old_mru_key) = state.mru.clone() {
        if let Some(mut old_mru) = get_entry(tx, folder, &old_mru_key).await? {
            old_mru.prev = Some(key.to_string());
            set_entry(tx, folder, &old_mru).await?;
        }
    }
    let entry = CacheEntry {
        hash: key.to_string(),
        size,
        prev: None,
        next: state.mru.clone(),
    };
    set_entry(tx, folder, &entry).await?;
    state.mru = Some(key.to_string());
    if state.lru.is_none() {
        state.lru = Some(key.to_string());
    }
    Ok(())
}

/// Evict LRU-tail entries until `current + extra <= max_bytes` or the list
/// is empty. Returns the keys whose blobs should be removed (victims that
/// are not pinned).
async fn evict_for_size(
    tx: &mut Transaction<'static, Sqlite>,
    folder: &str,
    state: &mut ListState,
    max_bytes: i64,
    extra: i64,
) -> Result<Vec<String>, BlockCacheError> {
    let mut removable = Vec::new();

    while state.current + extra > max_bytes {
        let Some(victim_key) = state.lru.clone() else {
            break;
        };
        let Some(victim) = get_entry(tx, folder, &victim_key).await? else {
            warn!(folder, hash = %victim_key, "broken LRU: tail entry missing");
            state.lru = None;
            break;
        };

        state.lru = victim.prev.clone();
        match &victim.prev {
            Some(prev_key) => {
                if let Some(mut prev) = get_entry(tx, folder, prev_key).await? {
                    prev.next = None;
                    set_entry(tx, folder, &prev).await?;
                }
            }
            None => state.mru = None,
        }

        delete_entry(tx, folder, &victim_key).await?;
        if get_pinned_size(tx, folder, &victim_key).await?.is_none() {
            removable.push(victim_key.clone());
        }
        state.current -= victim.size;

        debug!(
            folder,
            hash = %victim_key,
            size = victim.size,
            current_bytes = state.current,
            "evicted block"
        );
    }

    Ok(removable)
}

async fn get_entry(
    tx: &mut Transaction<'static, Sqlite>,
    folder: &str,
    key: &str,
) -> Result<Option<CacheEntry>, BlockCacheError> {
    let row = sqlx::query("SELECT size, prev, next FROM cached_blocks WHERE folder = ? AND hash = ?")
        .bind(folder)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row.map(|r| CacheEntry {
        hash: key.to_string(),
        size: r.get("size"),
        prev: r.get("prev"),
        next: r.get("next"),
    }))
}

async fn set_entry(
    tx: &mut Transaction<'static, Sqlite>,
    folder: &str,
    entry: &CacheEntry,
) -> Result<(), BlockCacheError> {
    sqlx::query(
        "INSERT OR REPLACE INTO cached_blocks (folder, hash, size, prev, next) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(folder)
    .bind(&entry.hash)
    .bind(entry.size)
    .bind(&entry.prev)
    .bind(&entry.next)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn delete_entry(
    tx: &mut Transaction<'static, Sqlite>,
    folder: &str,
    key: &str,
) -> Result<(), BlockCacheError> {
    sqlx::query("DELETE FROM cached_blocks WHERE folder = ? AND hash = ?")
        .bind(folder)
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn get_pinned_size(
    tx: &mut Transaction<'static, Sqlite>,
    folder: &str,
    key: &str,
) -> Result<Option<i64>, BlockCacheError> {
    let row = sqlx::query("SELECT size FROM pinned_blocks WHERE folder = ? AND hash = ?")
        .bind(folder)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row.map(|r| r.get("size")))
}

async fn set_pinned(
    tx: &mut Transaction<'static, Sqlite>,
    folder: &str,
    key: &str,
    size: i64,
) -> Result<(), BlockCacheError> {
    sqlx::query("INSERT OR REPLACE INTO pinned_blocks (folder, hash, size) VALUES (?, ?, ?)")
        .bind(folder)
        .bind(key)
        .bind(size)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn delete_pinned(
    tx: &mut Transaction<'static, Sqlite>,
    folder: &str,
    key: &str,
) -> Result<(), BlockCacheError> {
    sqlx::query("DELETE FROM pinned_blocks WHERE folder = ? AND hash = ?")
        .bind(folder)
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
