//! Block fetching: in-flight pull tracking, peer fallback, and the
//! background pinner workers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::seq::SliceRandom;
use rand::thread_rng;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::protocol::{BlockHash, BlockInfo, Connection};

use super::{FolderState, Model};

/// How long a single peer gets to answer one block request before the
/// fetch falls through to the next peer.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Terminal error of a block fetch, shared verbatim by every waiter.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Every peer advertising the file failed to respond or returned
    /// content that did not match the block hash.
    #[error("can't get block from any devices")]
    Exhausted,
    /// The file changed before a queued fetch ran; the block at this
    /// offset is no longer wanted.
    #[error("block no longer referenced by its file")]
    Superseded,
}

#[derive(Debug)]
pub(crate) enum PullState {
    Queued,
    Assigned,
    Done(Result<Bytes, FetchError>),
}

/// One in-flight or queued block fetch. At most one exists per
/// `(folder, hash)`; readers needing the same block join it and observe
/// the same outcome. Completion is broadcast exactly once.
pub(crate) struct BlockPull {
    pub comment: &'static str,
    pub folder: String,
    pub path: String,
    pub block: BlockInfo,
    /// Offset of the block within the file.
    pub offset: u64,
    state: Mutex<PullState>,
    done_tx: watch::Sender<bool>,
}

impl BlockPull {
    pub fn new(
        comment: &'static str,
        folder: String,
        path: String,
        block: BlockInfo,
        offset: u64,
        state: PullState,
    ) -> Arc<Self> {
        let (done_tx, _) = watch::channel(false);
        Arc::new(Self {
            comment,
            folder,
            path,
            block,
            offset,
            state: Mutex::new(state),
            done_tx,
        })
    }

    /// Store key of the block being pulled.
    pub fn key(&self) -> String {
        self.block.hash.to_base64()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PullState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn outcome(&self) -> Option<Result<Bytes, FetchError>> {
        match &*self.lock_state() {
            PullState::Done(result) => Some(result.clone()),
            _ => None,
        }
    }

    /// Move to `Assigned` unless already terminal.
    fn assign(&self) -> bool {
        let mut state = self.lock_state();
        match *state {
            PullState::Done(_) => false,
            _ => {
                *state = PullState::Assigned;
                true
            }
        }
    }

    /// Flip to `Done` and wake every waiter. Returns false if the pull was
    /// already terminal (the first outcome stands).
    pub fn complete(&self, result: Result<Bytes, FetchError>) -> bool {
        {
            let mut state = self.lock_state();
            if matches!(*state, PullState::Done(_)) {
                return false;
            }
            *state = PullState::Done(result);
        }
        self.done_tx.send_replace(true);
        true
    }

    /// Wait until the pull is terminal and return its outcome.
    pub async fn wait(&self) -> Result<Bytes, FetchError> {
        let mut rx = self.done_tx.subscribe();
        loop {
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // sender lives in self, so this cannot fire before Done
                return self.outcome().unwrap_or(Err(FetchError::Exhausted));
            }
        }
    }
}

/// Whether `state`'s tree still references the pulled block at the same
/// offset. A changed file drops queued pin fetches on the floor.
pub(crate) async fn block_still_needed(
    state: &FolderState,
    pull: &BlockPull,
    block_size: u64,
) -> bool {
    let entry = match state.tree_cache.get_entry(&pull.path).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return false,
        Err(e) => {
            warn!(folder = %pull.folder, path = %pull.path, error = %e, "tree lookup failed");
            return false;
        }
    };
    entry
        .blocks
        .iter()
        .enumerate()
        .any(|(i, b)| i as u64 * block_size == pull.offset && b.hash == pull.block.hash)
}

impl Model {
    /// Fetch one block from whichever advertising peer answers first with
    /// content matching the hash, then complete the pull, optionally add
    /// the payload to the folder's cache, and retire the pull record.
    ///
    /// The folder and connection locks are held only while snapshotting the
    /// candidate peers, never across the network.
    pub(crate) async fn pull_block(&self, pull: Arc<BlockPull>, add_to_cache: bool) {
        let conns: Vec<Arc<dyn Connection>> = {
            let folders = self.folders.read().await;
            let connections = self.connections.read().await;

            if !pull.assign() {
                return;
            }
            let Some(state) = folders.get(&pull.folder) else {
                drop(connections);
                drop(folders);
                self.retire_pull(&pull, Err(FetchError::Superseded), false).await;
                return;
            };

            let devices = match state.tree_cache.get_entry_devices(&pull.path).await {
                Ok(devices) => devices,
                Err(e) => {
                    warn!(folder = %pull.folder, path = %pull.path, error = %e, "device lookup failed");
                    Vec::new()
                }
            };
            let mut conns: Vec<Arc<dyn Connection>> = devices
                .iter()
                .filter_map(|d| connections.get(d).cloned())
                .collect();
            conns.shuffle(&mut thread_rng());
            conns
        };

        debug!(
            comment = pull.comment,
            folder = %pull.folder,
            path = %pull.path,
            offset = pull.offset,
            size = pull.block.size,
            peers = conns.len(),
            "pulling block"
        );

        let mut result: Result<Bytes, FetchError> = Err(FetchError::Exhausted);
        for conn in conns {
            let peer = conn.device_id();
            let request = conn.request(
                &pull.folder,
                &pull.path,
                pull.offset,
                pull.block.size,
                &pull.block.hash,
            );
            match tokio::time::timeout(REQUEST_TIMEOUT, request).await {
                Ok(Ok(payload)) => {
                    if BlockHash::of_data(&payload) == pull.block.hash {
                        result = Ok(payload);
                        break;
                    }
                    warn!(
                        folder = %pull.folder,
                        path = %pull.path,
                        peer = %peer.short(),
                        "block content does not match its hash, trying next device"
                    );
                }
                Ok(Err(e)) => {
                    debug!(folder = %pull.folder, peer = %peer.short(), error = %e, "block request failed");
                }
                Err(_) => {
                    debug!(folder = %pull.folder, peer = %peer.short(), "block request timed out");
                }
            }
        }

        self.retire_pull(&pull, result, add_to_cache).await;
    }

    /// Complete `pull`, write a successful payload into the cache when
    /// asked, and drop the record from the folder's pull table.
    pub(crate) async fn retire_pull(
        &self,
        pull: &BlockPull,
        result: Result<Bytes, FetchError>,
        add_to_cache: bool,
    ) {
        let completed = pull.complete(result);

        let mut folders = self.folders.write().await;
        if let Some(state) = folders.get_mut(&pull.folder) {
            if completed && add_to_cache {
                if let Some(Ok(data)) = pull.outcome() {
                    if let Err(e) = state.block_cache.put(&pull.block, &data).await {
                        warn!(folder = %pull.folder, hash = %pull.key(), error = %e, "failed to cache pulled block");
                    }
                }
            }
            state.pulls.remove(&pull.key());
        }
    }

    /// One background pinner: drains queued pin fetches until shutdown.
    pub(crate) async fn pinner_worker(self, mut shutdown: watch::Receiver<()>) {
        loop {
            let pull = tokio::select! {
                _ = shutdown.changed() => return,
                recv = self.pin_rx.recv_async() => match recv {
                    Ok(pull) => pull,
                    Err(_) => return,
                },
            };
            self.process_pin(pull).await;
        }
    }

    async fn process_pin(&self, pull: Arc<BlockPull>) {
        // decide, atomically with the tree, whether the block is still
        // wanted and whether it only needs upgrading
        let needs_fetch = {
            let mut folders = self.folders.write().await;
            let Some(state) = folders.get_mut(&pull.folder) else {
                drop(folders);
                self.retire_pull(&pull, Err(FetchError::Superseded), false).await;
                return;
            };

            if !block_still_needed(state, &pull, self.block_size).await {
                debug!(folder = %pull.folder, path = %pull.path, "queued pin fetch superseded");
                pull.complete(Err(FetchError::Superseded));
                state.pulls.remove(&pull.key());
                return;
            }

            match state.block_cache.has_cached(&pull.block.hash).await {
                Ok(true) => {
                    if let Err(e) = state.block_cache.pin_existing(&pull.block).await {
                        warn!(folder = %pull.folder, hash = %pull.key(), error = %e, "failed to pin cached block");
                    }
                    // serve joined readers from the cache while we are here
                    let outcome = match state.block_cache.get(&pull.block.hash).await {
                        Ok(Some(data)) => Ok(data),
                        _ => Err(FetchError::Exhausted),
                    };
                    pull.complete(outcome);
                    state.pulls.remove(&pull.key());
                    false
                }
                Ok(false) => true,
                Err(e) => {
                    warn!(folder = %pull.folder, hash = %pull.key(), error = %e, "cache lookup failed");
                    true
                }
            }
        };

        if !needs_fetch {
            return;
        }

        self.pull_block(pull.clone(), false).await;

        if let Some(Ok(data)) = pull.outcome() {
            let mut folders = self.folders.write().await;
            if let Some(state) = folders.get_mut(&pull.folder) {
                if block_still_needed(state, &pull, self.block_size).await {
                    if let Err(e) = state.block_cache.pin_new(&pull.block, &data).await {
                        warn!(folder = %pull.folder, hash = %pull.key(), error = %e, "failed to pin fetched block");
                    }
                }
            }
        }
    }
}
