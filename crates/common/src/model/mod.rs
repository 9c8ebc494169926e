//! The coordinator: one block cache and one tree cache per configured
//! folder, index reconciliation, the read path, and pull scheduling.
//!
//! Two process-wide reader-writer locks order all access: `folders`
//! (tree caches, block caches, and the per-folder pull tables) and
//! `connections` (the live peer transports). `folders` is always acquired
//! before `connections`, and neither is held across a network request or
//! while waiting on a pull.

mod pull;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::blobs;
use crate::block_cache::{BlockCacheError, FileBlockCache};
use crate::config::{Config, ConfigPersister};
use crate::database::{Database, DatabaseError};
use crate::protocol::{
    BlockInfo, ClusterConfig, Connection, DeviceAnnouncement, DeviceId, FileInfo,
    FolderAnnouncement, Ordering,
};
use crate::tree_cache::{FileTreeCache, TreeCacheError};

pub use pull::FetchError;
use pull::{BlockPull, PullState};

/// Number of background pinner workers.
const PINNER_WORKERS: usize = 4;

const CLIENT_NAME: &str = "driftfs";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no such file")]
    NoSuchFile,
    #[error("fetch failed: {0}")]
    FetchFailed(#[from] FetchError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    BlockCache(#[from] BlockCacheError),
    #[error(transparent)]
    TreeCache(#[from] TreeCacheError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the model tracks for one configured folder.
pub(crate) struct FolderState {
    pub devices: Vec<DeviceId>,
    /// Sorted for binary search.
    pub pinned_paths: Vec<String>,
    pub block_cache: FileBlockCache,
    pub tree_cache: FileTreeCache,
    /// In-flight and queued pulls, keyed by base64 block hash. At most one
    /// entry per hash.
    pub pulls: HashMap<String, Arc<BlockPull>>,
}

/// One live peer connection, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub device_id: DeviceId,
    pub address: String,
}

/// Progress of a folder's pinned set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinStatus {
    pub pinned_files: usize,
    pub pinned_bytes: u64,
    pub pending_files: usize,
    pub pending_bytes: u64,
}

/// Cheap-to-clone handle on the coordinator; clones share all state.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

impl std::ops::Deref for Model {
    type Target = ModelInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

pub struct ModelInner {
    config: Mutex<Config>,
    persister: Option<Arc<dyn ConfigPersister>>,
    block_size: u64,
    /// Lock `F`: folder state. Acquired before `connections`.
    pub(crate) folders: RwLock<HashMap<String, FolderState>>,
    /// Lock `P`: peer transports. Never acquired before `folders` is, when
    /// both are needed.
    pub(crate) connections: RwLock<HashMap<DeviceId, Arc<dyn Connection>>>,
    pin_tx: flume::Sender<Arc<BlockPull>>,
    pub(crate) pin_rx: flume::Receiver<Arc<BlockPull>>,
}

impl Model {
    /// Build the model from a configuration snapshot: open the caches of
    /// every parseable folder, drop state of folders that disappeared from
    /// configuration, and unpin blocks of files that left the pinned list.
    ///
    /// Call [`Model::spawn_pinner_workers`] afterwards to start servicing
    /// queued pin fetches.
    pub async fn new(
        db: Database,
        config: Config,
        persister: Option<Arc<dyn ConfigPersister>>,
    ) -> Result<Self, ModelError> {
        let mut folders = HashMap::new();

        for folder_cfg in &config.folders {
            let max_bytes = match folder_cfg.cache_size_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(folder = %folder_cfg.id, error = %e, "skipping folder with invalid cache size");
                    continue;
                }
            };

            let block_cache = FileBlockCache::open(db.clone(), &folder_cfg.id, max_bytes).await?;
            let tree_cache =
                FileTreeCache::open(db.clone(), &folder_cfg.id, &folder_cfg.devices).await?;

            let mut pinned_paths = folder_cfg.pinned_files.clone();
            pinned_paths.sort();

            info!(folder = %folder_cfg.id, max_bytes, pinned = pinned_paths.len(), "folder configured");
            folders.insert(
                folder_cfg.id.clone(),
                FolderState {
                    devices: folder_cfg.devices.clone(),
                    pinned_paths,
                    block_cache,
                    tree_cache,
                    pulls: HashMap::new(),
                },
            );
        }

        // folders removed from configuration leave no state behind; a
        // folder that is merely skipped this run keeps its state
        let configured: std::collections::HashSet<&str> =
            config.folders.iter().map(|f| f.id.as_str()).collect();
        for stale in db.folder_ids().await? {
            if !configured.contains(stale.as_str()) {
                info!(folder = %stale, "cleaning up unconfigured folder");
                blobs::remove_folder_blobs(db.root(), &stale).await?;
                db.remove_folder(&stale).await?;
            }
        }

        for state in folders.values_mut() {
            unpin_unnecessary_blocks(state).await?;
        }

        let (pin_tx, pin_rx) = flume::unbounded();
        Ok(Self {
            inner: Arc::new(ModelInner {
                block_size: config.block_size as u64,
                config: Mutex::new(config),
                persister,
                folders: RwLock::new(folders),
                connections: RwLock::new(HashMap::new()),
                pin_tx,
                pin_rx,
            }),
        })
    }

    /// Start the background pinner pool; workers exit on the shutdown
    /// signal.
    pub fn spawn_pinner_workers(&self, shutdown: watch::Receiver<()>) {
        for _ in 0..PINNER_WORKERS {
            tokio::spawn(self.clone().pinner_worker(shutdown.clone()));
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    // ------------------------------------------------------------------
    // connections
    // ------------------------------------------------------------------

    /// Register a freshly established peer connection and advertise the
    /// cluster topology to it. A duplicate registration drops the new
    /// connection instead of the process.
    pub async fn add_connection(&self, conn: Arc<dyn Connection>) {
        let peer = conn.device_id();
        let msg = {
            let folders = self.folders.read().await;
            let mut connections = self.connections.write().await;

            if connections.contains_key(&peer) {
                error!(peer = %peer.short(), "duplicate connection, tearing it down");
                return;
            }
            connections.insert(peer, Arc::clone(&conn));
            conn.start();

            self.build_cluster_config(&folders, &peer)
        };
        debug!(peer = %peer.short(), folders = msg.folders.len(), "sending cluster config");
        conn.send_cluster_config(msg).await;
    }

    /// The peer closed its connection.
    pub async fn close(&self, peer: &DeviceId, reason: Option<String>) {
        debug!(peer = %peer.short(), reason = reason.as_deref().unwrap_or("none"), "connection closed");
        self.connections.write().await.remove(peer);
    }

    pub async fn connected_to(&self, peer: &DeviceId) -> bool {
        self.connections.read().await.contains_key(peer)
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .await
            .values()
            .map(|conn| ConnectionInfo {
                device_id: conn.device_id(),
                address: conn.remote_addr(),
            })
            .collect()
    }

    fn build_cluster_config(
        &self,
        folders: &HashMap<String, FolderState>,
        peer: &DeviceId,
    ) -> ClusterConfig {
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        let mut announced = Vec::new();

        for (folder_id, state) in folders {
            if !state.devices.contains(peer) {
                continue;
            }
            let devices = state
                .devices
                .iter()
                .map(|id| {
                    let device_cfg = config.device(id);
                    DeviceAnnouncement {
                        id: *id,
                        name: device_cfg.map(|d| d.name.clone()).unwrap_or_default(),
                        addresses: device_cfg.map(|d| d.addresses.clone()).unwrap_or_default(),
                        compression: device_cfg.map(|d| d.compression).unwrap_or(false),
                        cert_name: device_cfg.map(|d| d.cert_name.clone()).unwrap_or_default(),
                    }
                })
                .collect();
            announced.push(FolderAnnouncement {
                id: folder_id.clone(),
                devices,
            });
        }

        ClusterConfig {
            device_name: config.device_name.clone(),
            client_name: CLIENT_NAME.to_string(),
            client_version: CLIENT_VERSION.to_string(),
            folders: announced,
        }
    }

    /// Inbound cluster config: adopt the peer's self-reported name if we
    /// have none configured for it, persisting the change. Otherwise
    /// informational.
    pub fn cluster_config(&self, peer: &DeviceId, msg: &ClusterConfig) {
        let snapshot = {
            let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
            match config.device_mut(peer) {
                Some(device) if device.name.is_empty() && !msg.device_name.is_empty() => {
                    debug!(peer = %peer.short(), name = %msg.device_name, "adopting peer name");
                    device.name = msg.device_name.clone();
                    Some(config.clone())
                }
                _ => None,
            }
        };
        if let Some(snapshot) = snapshot {
            if let Some(persister) = &self.persister {
                if let Err(e) = persister.persist(&snapshot) {
                    warn!(error = %e, "failed to persist adopted peer name");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // index ingestion
    // ------------------------------------------------------------------

    /// A full index was received from `peer`.
    pub async fn index(
        &self,
        peer: &DeviceId,
        folder: &str,
        files: &[FileInfo],
    ) -> Result<(), ModelError> {
        debug!(peer = %peer.short(), folder, files = files.len(), "receiving index");
        self.update_index(peer, folder, files).await
    }

    /// An incremental index update was received from `peer`. Deltas and
    /// full indexes reconcile identically; replays are idempotent.
    pub async fn index_update(
        &self,
        peer: &DeviceId,
        folder: &str,
        files: &[FileInfo],
    ) -> Result<(), ModelError> {
        debug!(peer = %peer.short(), folder, files = files.len(), "receiving index update");
        self.update_index(peer, folder, files).await
    }

    async fn update_index(
        &self,
        peer: &DeviceId,
        folder: &str,
        files: &[FileInfo],
    ) -> Result<(), ModelError> {
        let mut folders = self.folders.write().await;
        let Some(state) = folders.get_mut(folder) else {
            debug!(folder, "index for unconfigured folder, ignoring");
            return Ok(());
        };
        if !state.devices.contains(peer) {
            debug!(peer = %peer.short(), folder, "folder not shared with peer, ignoring");
            return Ok(());
        }

        for file in files {
            let local = state.tree_cache.get_entry(&file.name).await?;

            let mut removed = false;
            let mut comparison = None;
            if let Some(local_entry) = &local {
                let cmp = file.version.compare(&local_entry.version);
                comparison = Some(cmp);

                let replaces = cmp == Ordering::Greater
                    || (cmp.is_concurrent() && file.wins_conflict(local_entry));
                if replaces {
                    debug!(peer = %peer.short(), path = %file.name, "replacing entry");
                    state.tree_cache.remove_entry(&file.name).await?;
                    if is_path_pinned(&state.pinned_paths, &file.name) {
                        for block in &local_entry.blocks {
                            state.block_cache.unpin(&block.hash).await?;
                        }
                    }
                    removed = true;
                }
            }

            let equal = comparison == Some(Ordering::Equal);
            if local.is_none() || removed || equal {
                if file.deleted || file.invalid || file.is_symlink() {
                    debug!(peer = %peer.short(), path = %file.name, "ignoring deleted/invalid/symlink entry");
                    continue;
                }

                if equal && !removed {
                    // same version from another peer: only grow the
                    // device set, the stored entry stands
                    state.tree_cache.add_peer(&file.name, peer).await?;
                } else {
                    state.tree_cache.add_entry(file, peer).await?;
                }

                if is_path_pinned(&state.pinned_paths, &file.name) {
                    for (i, block) in file.blocks.iter().enumerate() {
                        if !state.block_cache.has_pinned(&block.hash).await? {
                            let offset = i as u64 * self.block_size;
                            self.get_or_create_pull(
                                state,
                                "pin fetch",
                                folder,
                                &file.name,
                                block,
                                offset,
                                PullState::Queued,
                            );
                        }
                    }
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // lookups
    // ------------------------------------------------------------------

    pub async fn list_folders(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.folders.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn has_folder(&self, folder: &str) -> bool {
        self.folders.read().await.contains_key(folder)
    }

    pub async fn get_entry(&self, folder: &str, path: &str) -> Result<Option<FileInfo>, ModelError> {
        let folders = self.folders.read().await;
        match folders.get(folder) {
            Some(state) => Ok(state.tree_cache.get_entry(path).await?),
            None => Ok(None),
        }
    }

    pub async fn get_children(&self, folder: &str, path: &str) -> Result<Vec<FileInfo>, ModelError> {
        let folders = self.folders.read().await;
        let Some(state) = folders.get(folder) else {
            return Ok(Vec::new());
        };
        let mut result = Vec::new();
        for child in state.tree_cache.get_children(path).await? {
            if let Some(entry) = state.tree_cache.get_entry(&child).await? {
                result.push(entry);
            }
        }
        Ok(result)
    }

    pub async fn paths_matching_prefix(
        &self,
        folder: &str,
        prefix: &str,
    ) -> Result<Vec<String>, ModelError> {
        let folders = self.folders.read().await;
        match folders.get(folder) {
            Some(state) => Ok(state.tree_cache.get_paths_matching_prefix(prefix).await?),
            None => {
                debug!(folder, "no tree cache for folder");
                Ok(Vec::new())
            }
        }
    }

    /// Inbound block request from a peer: this side serves no files.
    pub fn request(
        &self,
        _peer: &DeviceId,
        _folder: &str,
        _path: &str,
        _offset: u64,
        _size: u32,
    ) -> Result<bytes::Bytes, ModelError> {
        Err(ModelError::NoSuchFile)
    }

    // ------------------------------------------------------------------
    // the read path
    // ------------------------------------------------------------------

    /// Serve `read_size` bytes of `path` starting at `read_start`,
    /// assembling the range from cached blocks and coalesced fetches, and
    /// warming the cache one block past the end of the range.
    pub async fn read(
        &self,
        folder: &str,
        path: &str,
        read_start: u64,
        read_size: usize,
    ) -> Result<Vec<u8>, ModelError> {
        let read_end = read_start + read_size as u64;
        let mut data = vec![0u8; read_size];
        let mut pending = Vec::new();

        {
            let mut folders = self.folders.write().await;
            let _connections = self.connections.read().await;
            let state = folders.get_mut(folder).ok_or(ModelError::NoSuchFile)?;

            let entry = state
                .tree_cache
                .get_entry(path)
                .await?
                .ok_or(ModelError::NoSuchFile)?;

            for (i, block) in entry.blocks.iter().enumerate() {
                let block_start = i as u64 * self.block_size;
                let block_end = block_start + block.size as u64;
                if block_end <= read_start {
                    continue;
                }

                if block_start < read_end {
                    match state.block_cache.get(&block.hash).await? {
                        Some(payload) => {
                            copy_block(&payload, read_start, block_start, read_end, &mut data);
                        }
                        None => {
                            let pull = self.get_or_create_pull(
                                state,
                                "fetch",
                                folder,
                                path,
                                block,
                                block_start,
                                PullState::Assigned,
                            );
                            pending.push((block_start, pull));
                        }
                    }
                } else if block_start < read_end + self.block_size {
                    // the next sequential block: warm the cache for the
                    // read that is probably coming
                    if !state.block_cache.has_cached(&block.hash).await?
                        && !state.block_cache.has_pinned(&block.hash).await?
                    {
                        self.get_or_create_pull(
                            state,
                            "prefetch",
                            folder,
                            path,
                            block,
                            block_start,
                            PullState::Assigned,
                        );
                    }
                }
            }
        }

        for (block_start, pull) in pending {
            let payload = pull.wait().await?;
            copy_block(&payload, read_start, block_start, read_end, &mut data);
        }

        Ok(data)
    }

    /// Join the in-flight pull for this block, or create one. `Assigned`
    /// pulls start fetching immediately; `Queued` pulls go to the pinner
    /// queue. Caller must hold the folder lock for writing.
    fn get_or_create_pull(
        &self,
        state: &mut FolderState,
        comment: &'static str,
        folder: &str,
        path: &str,
        block: &BlockInfo,
        offset: u64,
        pull_state: PullState,
    ) -> Arc<BlockPull> {
        let key = block.hash.to_base64();
        if let Some(existing) = state.pulls.get(&key) {
            return Arc::clone(existing);
        }

        let assigned = matches!(pull_state, PullState::Assigned);
        let pull = BlockPull::new(
            comment,
            folder.to_string(),
            path.to_string(),
            *block,
            offset,
            pull_state,
        );
        state.pulls.insert(key, Arc::clone(&pull));

        if assigned {
            let model = self.clone();
            let spawned = Arc::clone(&pull);
            tokio::spawn(async move {
                model.pull_block(spawned, true).await;
            });
        } else if self.pin_tx.send(Arc::clone(&pull)).is_err() {
            warn!(folder, "pinner queue is gone, dropping pin fetch");
        }

        pull
    }

    // ------------------------------------------------------------------
    // pin reporting
    // ------------------------------------------------------------------

    /// Per-folder progress of the pinned set.
    pub async fn pin_status(&self) -> Result<HashMap<String, PinStatus>, ModelError> {
        let folders = self.folders.read().await;
        let mut result = HashMap::new();

        for (folder_id, state) in folders.iter() {
            let mut status = PinStatus::default();
            for path in &state.pinned_paths {
                let Some(entry) = state.tree_cache.get_entry(path).await? else {
                    continue;
                };
                let mut pending = false;
                for block in &entry.blocks {
                    if state.block_cache.has_pinned(&block.hash).await? {
                        status.pinned_bytes += block.size as u64;
                    } else {
                        pending = true;
                        status.pending_bytes += block.size as u64;
                    }
                }
                if pending {
                    status.pending_files += 1;
                } else {
                    status.pinned_files += 1;
                }
            }
            result.insert(folder_id.clone(), status);
        }

        Ok(result)
    }
}

/// Splice the overlap of a block payload into the read buffer.
fn copy_block(payload: &[u8], read_start: u64, block_start: u64, read_end: u64, out: &mut [u8]) {
    let block_end = block_start + payload.len() as u64;
    let from = read_start.max(block_start);
    let to = read_end.min(block_end);
    if from >= to {
        return;
    }
    out[(from - read_start) as usize..(to - read_start) as usize]
        .copy_from_slice(&payload[(from - block_start) as usize..(to - block_start) as usize]);
}

fn is_path_pinned(pinned_paths: &[String], path: &str) -> bool {
    pinned_paths.binary_search_by(|p| p.as_str().cmp(path)).is_ok()
}

/// Walk the folder's tree and unpin blocks of files that are no longer in
/// its pinned list. Runs once at startup, before any index traffic.
async fn unpin_unnecessary_blocks(state: &mut FolderState) -> Result<(), ModelError> {
    let mut queue = vec![String::new()];
    while let Some(path) = queue.pop() {
        if let Some(entry) = state.tree_cache.get_entry(&path).await? {
            if !is_path_pinned(&state.pinned_paths, &path) {
                for block in &entry.blocks {
                    state.block_cache.unpin(&block.hash).await?;
                }
            }
            if entry.is_directory() {
                queue.extend(state.tree_cache.get_children(&path).await?);
            }
        } else if path.is_empty() {
            // the root has no entry of its own
            queue.extend(state.tree_cache.get_children("").await?);
        }
    }
    Ok(())
}
