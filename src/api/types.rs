use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Body of `POST /1.0/instances/{name}`: rename or one of the move flows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstancePost {
    #[serde(default)]
    pub name:               Option<String>,
    #[serde(default)]
    pub migration:          bool,
    /// Defaults to false when omitted; a stateless move stops the instance.
    #[serde(default)]
    pub live:               bool,
    #[serde(default)]
    pub instance_only:      bool,
    #[serde(default)]
    pub allow_inconsistent: bool,
    #[serde(default)]
    pub pool:               Option<String>,
    #[serde(default)]
    pub project:            Option<String>,
    /// Push target: the URL of a foreign server, not a cluster member name.
    #[serde(default)]
    pub target:             Option<String>,
}

/// Source block of `POST /1.0/instances` as the migration sink consumes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceSource {
    #[serde(rename = "type")]
    pub kind:       String, // only "migration" is accepted by this daemon
    #[serde(default)]
    pub mode:       String, // only "pull"
    #[serde(default)]
    pub operation:  String, // source operation URL
    #[serde(default)]
    pub websockets: HashMap<String, String>, // channel name -> secret
    #[serde(default)]
    pub live:       bool,
    #[serde(default)]
    pub refresh:    bool,
}

/// Body of `POST /1.0/instances` for the migration sink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub name:         String,
    #[serde(rename = "type", default)]
    pub kind:         String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub ephemeral:    bool,
    #[serde(default)]
    pub stateful:     bool,
    #[serde(default)]
    pub config:       HashMap<String, String>,
    #[serde(default)]
    pub devices:      HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub profiles:     Vec<String>,
    #[serde(default)]
    pub pool:         Option<String>,
    pub source:       InstanceSource,
    /// Marks instance-only transfers so the sink skips snapshot volumes.
    #[serde(default)]
    pub instance_only: bool,
}

/// Body of `PUT /1.0/instances/{name}/state`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceStatePut {
    pub action:   String, // "start" or "stop"
    #[serde(default)]
    pub stateful: bool,
    #[serde(default)]
    pub timeout:  Option<u64>,
}

/// Body of `POST /1.0/storage-pools/{p}/volumes/custom/{v}/snapshots`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeSnapshotPost {
    #[serde(default)]
    pub name:       Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Body of `PUT`/`PATCH` on a single volume snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeSnapshotPut {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub expires_at:  Option<DateTime<Utc>>,
    #[serde(default)]
    pub config:      Option<HashMap<String, String>>,
}

/// Rename body of `POST` on a single volume snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeSnapshotRename {
    pub name: String,
}

/// Body of `POST /internal/cluster/instance-moved/{name}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceMovedPost {
    pub action: String, // "create"
}
