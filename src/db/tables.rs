use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::Json;
use std::collections::HashMap;

/// Instance-carrying volume types plus the custom/image kinds.
pub const VOLUME_TYPE_CONTAINER: &str = "container";
pub const VOLUME_TYPE_VM: &str = "virtual-machine";
pub const VOLUME_TYPE_IMAGE: &str = "image";
pub const VOLUME_TYPE_CUSTOM: &str = "custom";

pub const INSTANCE_TYPE_CONTAINER: &str = "container";
pub const INSTANCE_TYPE_VM: &str = "virtual-machine";

pub const INSTANCE_STATUS_STOPPED: &str = "stopped";
pub const INSTANCE_STATUS_RUNNING: &str = "running";
pub const INSTANCE_STATUS_FROZEN: &str = "frozen";

/// Separator between a parent volume name and a snapshot name.
pub const SNAPSHOT_SEPARATOR: char = '/';

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ClusterMember {
    pub id:           i64,
    pub name:         String,
    pub address:      String,
    pub architecture: String,
    pub member_group: String,
    pub status:       String,
    pub heartbeat:    DateTime<Utc>,
}

impl ClusterMember {
    /// A member is offline once its heartbeat row has not been refreshed
    /// within the configured threshold.
    pub fn is_offline(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.heartbeat > threshold
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Instance {
    pub id:               i64,
    pub project:          String,
    pub name:             String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind:             String, // 'container' or 'virtual-machine'
    pub architecture:     String,
    pub node_id:          i64,
    pub location:         String, // joined member name
    pub pool_id:          i64,
    pub ephemeral:        bool,
    pub stateful:         bool,
    pub status:           String, // 'stopped', 'running', 'frozen'
    pub local_config:     Json<HashMap<String, String>>,
    pub devices:          Json<HashMap<String, HashMap<String, String>>>,
    pub expanded_devices: Json<HashMap<String, HashMap<String, String>>>,
    pub profiles:         Json<Vec<String>>,
    pub created_at:       DateTime<Utc>,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.status == INSTANCE_STATUS_RUNNING || self.status == INSTANCE_STATUS_FROZEN
    }

    /// Volume type string backing this instance's root volume row.
    pub fn volume_type(&self) -> &'static str {
        if self.kind == INSTANCE_TYPE_VM {
            VOLUME_TYPE_VM
        } else {
            VOLUME_TYPE_CONTAINER
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct StorageVolume {
    pub id:           i64,
    pub project:      String,
    pub name:         String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind:         String, // 'container', 'virtual-machine', 'image', 'custom'
    pub pool_id:      i64,
    pub node_id:      Option<i64>, // NULL or <= 0 means remote-shared
    pub content_type: String,
    pub description:  String,
    pub config:       Json<HashMap<String, String>>,
    pub expiry:       Option<DateTime<Utc>>, // snapshots only, NULL means never
    pub created_at:   DateTime<Utc>,
}

impl StorageVolume {
    /// Remote-shared volumes are visible from every member.
    pub fn is_remote(&self) -> bool {
        match self.node_id {
            None => true,
            Some(id) => id <= 0,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.name.contains(SNAPSHOT_SEPARATOR)
    }

    /// Splits `"parent/snap"` into its parts. Returns `None` for non-snapshot
    /// volume names.
    pub fn split_snapshot_name(&self) -> Option<(&str, &str)> {
        split_snapshot_name(&self.name)
    }
}

/// Splits a composite snapshot name into `(parent, snapshot)`.
pub fn split_snapshot_name(name: &str) -> Option<(&str, &str)> {
    name.split_once(SNAPSHOT_SEPARATOR)
}

/// Joins a parent volume name and a snapshot name into the composite form.
pub fn join_snapshot_name(parent: &str, snap: &str) -> String {
    format!("{}{}{}", parent, SNAPSHOT_SEPARATOR, snap)
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct StoragePoolRow {
    pub id:     i64,
    pub name:   String,
    pub driver: String,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Project {
    pub id:     i64,
    pub name:   String,
    pub config: Json<HashMap<String, String>>,
}

impl Project {
    fn config_bool(&self, key: &str) -> bool {
        matches!(self.config.get(key).map(String::as_str), Some("true") | Some("1"))
    }

    pub fn restricted(&self) -> bool {
        self.config_bool("restricted")
    }

    pub fn restricted_cluster_target(&self) -> bool {
        self.restricted() && self.config_bool("restricted.cluster.target")
    }

    /// Comma-separated failover groups this project may place instances on.
    pub fn restricted_cluster_groups(&self) -> Option<Vec<String>> {
        if !self.restricted() {
            return None;
        }
        self.config.get("restricted.cluster.groups").map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }

    pub fn restricted_snapshots(&self) -> bool {
        self.restricted() && self.config_bool("restricted.snapshots")
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct InstanceBackup {
    pub id:          i64,
    pub instance_id: i64,
    pub name:        String,
    pub created_at:  DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_name_split_and_join() {
        assert_eq!(split_snapshot_name("vol1/snap0"), Some(("vol1", "snap0")));
        assert_eq!(split_snapshot_name("vol1"), None);
        assert_eq!(join_snapshot_name("vol1", "snap0"), "vol1/snap0");
    }

    #[test]
    fn remote_volume_detection() {
        let mut vol = StorageVolume {
            id: 1,
            project: "default".into(),
            name: "vol1".into(),
            kind: VOLUME_TYPE_CUSTOM.into(),
            pool_id: 1,
            node_id: Some(3),
            content_type: "filesystem".into(),
            description: String::new(),
            config: Json(Default::default()),
            expiry: None,
            created_at: Utc::now(),
        };
        assert!(!vol.is_remote());
        vol.node_id = Some(0);
        assert!(vol.is_remote());
        vol.node_id = None;
        assert!(vol.is_remote());
    }

    #[test]
    fn project_restrictions() {
        let mut config = HashMap::new();
        config.insert("restricted".to_string(), "true".to_string());
        config.insert(
            "restricted.cluster.groups".to_string(),
            "fast, slow".to_string(),
        );
        let project = Project {
            id: 1,
            name: "default".into(),
            config: Json(config),
        };
        assert!(project.restricted());
        assert_eq!(
            project.restricted_cluster_groups(),
            Some(vec!["fast".to_string(), "slow".to_string()])
        );
        assert!(!project.restricted_snapshots());
    }
}
