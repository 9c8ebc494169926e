use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use super::device_id::DeviceId;
use super::file_info::BlockHash;
use super::messages::ClusterConfig;

/// Error from a single block request against one peer.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    #[error("peer has no such file")]
    NoSuchFile,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
}

/// Capability the model drives on an established peer connection.
///
/// Concrete transports (and the in-memory mock used in tests) implement
/// this; the core never reaches into their types. Implementations must be
/// safe to call from multiple tasks.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The remote peer's identifier.
    fn device_id(&self) -> DeviceId;

    /// Human-readable remote address, for status reporting.
    fn remote_addr(&self) -> String;

    /// Begin servicing the connection (reader loop, keepalives).
    fn start(&self);

    /// Advertise the cluster topology to the remote peer.
    async fn send_cluster_config(&self, config: ClusterConfig);

    /// Request `size` bytes of `path` in `folder` starting at `offset`.
    /// `hash` identifies the expected block; the returned payload is
    /// verified against it by the caller.
    async fn request(
        &self,
        folder: &str,
        path: &str,
        offset: u64,
        size: u32,
        hash: &BlockHash,
    ) -> Result<Bytes, RequestError>;
}
