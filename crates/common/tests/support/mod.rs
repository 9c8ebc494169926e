//! Shared fixtures for model tests: a programmable in-memory transport and
//! config builders.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use driftfs_common::config::{Config, ConfigError, ConfigPersister, DeviceConfig, FolderConfig};
use driftfs_common::protocol::{
    BlockHash, BlockInfo, ClusterConfig, Connection, DeviceId, FileInfo, FileKind, RequestError,
    VersionVector,
};

/// Block size every test config uses; small enough to build multi-block
/// files by hand.
pub const TEST_BLOCK_SIZE: u32 = 8;

pub fn device(tag: u8) -> DeviceId {
    DeviceId::from_bytes([tag; 32])
}

pub fn test_config(folders: Vec<FolderConfig>, devices: Vec<DeviceConfig>) -> Config {
    Config {
        device_name: "local".to_string(),
        mount_point: PathBuf::from("/tmp/driftfs-test-mount"),
        listen_address: String::new(),
        local_announce_enabled: true,
        global_announce_enabled: true,
        block_size: TEST_BLOCK_SIZE,
        devices,
        folders,
    }
}

pub fn folder_config(id: &str, devices: &[DeviceId], pinned: &[&str]) -> FolderConfig {
    FolderConfig {
        id: id.to_string(),
        devices: devices.to_vec(),
        cache_size: "1 MiB".to_string(),
        pinned_files: pinned.iter().map(|p| p.to_string()).collect(),
    }
}

pub fn block_of(data: &[u8]) -> BlockInfo {
    BlockInfo {
        hash: BlockHash::of_data(data),
        size: data.len() as u32,
    }
}

pub fn file_entry(name: &str, version: Vec<(u64, u64)>, payloads: &[&[u8]]) -> FileInfo {
    let blocks: Vec<BlockInfo> = payloads.iter().map(|p| block_of(p)).collect();
    FileInfo {
        name: name.to_string(),
        kind: FileKind::File,
        deleted: false,
        invalid: false,
        modified: 1_700_000_000,
        size: payloads.iter().map(|p| p.len() as u64).sum(),
        version: VersionVector::from(version),
        blocks,
    }
}

pub fn dir_entry(name: &str, version: Vec<(u64, u64)>) -> FileInfo {
    FileInfo {
        kind: FileKind::Directory,
        ..file_entry(name, version, &[])
    }
}

type ResponseKey = (String, String, u64);

struct Response {
    result: Result<Bytes, RequestError>,
    delay: Duration,
}

/// In-memory [`Connection`] programmable with per-(folder, path, offset)
/// responses and delays. Counts requests for at-most-once assertions.
pub struct MockConnection {
    id: DeviceId,
    started: AtomicBool,
    requests: AtomicUsize,
    responses: Mutex<HashMap<ResponseKey, Response>>,
    cluster_configs: Mutex<Vec<ClusterConfig>>,
}

impl MockConnection {
    pub fn new(id: DeviceId) -> Arc<Self> {
        Arc::new(Self {
            id,
            started: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
            responses: Mutex::new(HashMap::new()),
            cluster_configs: Mutex::new(Vec::new()),
        })
    }

    pub fn program(&self, folder: &str, path: &str, offset: u64, data: &[u8]) {
        self.program_with_delay(folder, path, offset, data, Duration::ZERO);
    }

    pub fn program_with_delay(
        &self,
        folder: &str,
        path: &str,
        offset: u64,
        data: &[u8],
        delay: Duration,
    ) {
        self.responses.lock().unwrap().insert(
            (folder.to_string(), path.to_string(), offset),
            Response {
                result: Ok(Bytes::copy_from_slice(data)),
                delay,
            },
        );
    }

    pub fn program_error(&self, folder: &str, path: &str, offset: u64, error: RequestError) {
        self.responses.lock().unwrap().insert(
            (folder.to_string(), path.to_string(), offset),
            Response {
                result: Err(error),
                delay: Duration::ZERO,
            },
        );
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn was_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn received_cluster_configs(&self) -> Vec<ClusterConfig> {
        self.cluster_configs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn remote_addr(&self) -> String {
        format!("mock://{}", self.id.short())
    }

    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    async fn send_cluster_config(&self, config: ClusterConfig) {
        self.cluster_configs.lock().unwrap().push(config);
    }

    async fn request(
        &self,
        folder: &str,
        path: &str,
        offset: u64,
        _size: u32,
        _hash: &BlockHash,
    ) -> Result<Bytes, RequestError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let (result, delay) = {
            let responses = self.responses.lock().unwrap();
            match responses.get(&(folder.to_string(), path.to_string(), offset)) {
                Some(response) => (response.result.clone(), response.delay),
                None => (Err(RequestError::NoSuchFile), Duration::ZERO),
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

/// Records the configs handed to it, standing in for the daemon's file
/// write-back.
#[derive(Default)]
pub struct RecordingPersister {
    pub saved: Mutex<Vec<Config>>,
}

impl ConfigPersister for RecordingPersister {
    fn persist(&self, config: &Config) -> Result<(), ConfigError> {
        self.saved.lock().unwrap().push(config.clone());
        Ok(())
    }
}

/// Poll `check` until it returns true or the deadline passes.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
