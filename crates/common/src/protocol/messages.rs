use serde::{Deserialize, Serialize};

use super::device_id::DeviceId;

/// Topology announcement sent to a peer right after its connection is
/// registered: every folder the peer is authorized for, with the full
/// device list of each. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub device_name: String,
    pub client_name: String,
    pub client_version: String,
    pub folders: Vec<FolderAnnouncement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderAnnouncement {
    pub id: String,
    pub devices: Vec<DeviceAnnouncement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAnnouncement {
    pub id: DeviceId,
    pub name: String,
    pub addresses: Vec<String>,
    pub compression: bool,
    pub cert_name: String,
}
