use crate::storage::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Longest name accepted for pools, volumes and snapshots.
const NAME_MAX: usize = 255;

/// Validates a pool, volume or snapshot name: one path segment, no
/// separators, bounded length. The same rule pools apply to their own names.
pub fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() {
        return Err(StorageError::InvalidName("name is empty".to_string()));
    }
    if name.len() > NAME_MAX {
        return Err(StorageError::InvalidName(format!(
            "name exceeds {} characters",
            NAME_MAX
        )));
    }
    if name == "." || name == ".." {
        return Err(StorageError::InvalidName(format!(
            "\"{}\" is reserved",
            name
        )));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(StorageError::InvalidName(format!(
            "\"{}\" contains path separators",
            name
        )));
    }
    Ok(())
}

/// Structured descriptor the migration sink needs before receiving any data.
///
/// The source generates it from its DB rows; the sink uses it to pre-create
/// volumes and to re-apply instance configuration after the transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceBackupConfig {
    pub instance:  BackupInstanceInfo,
    pub volume:    BackupVolumeInfo,
    pub snapshots: Vec<BackupSnapshotInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInstanceInfo {
    pub name:         String,
    pub project:      String,
    #[serde(rename = "type")]
    pub kind:         String,
    pub architecture: String,
    pub ephemeral:    bool,
    pub stateful:     bool,
    pub config:       HashMap<String, String>,
    pub devices:      HashMap<String, HashMap<String, String>>,
    pub profiles:     Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupVolumeInfo {
    pub name:         String,
    #[serde(rename = "type")]
    pub kind:         String,
    pub content_type: String,
    pub config:       HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSnapshotInfo {
    pub name:       String,
    pub created_at: DateTime<Utc>,
    pub expiry:     Option<DateTime<Utc>>,
    pub config:     HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(validate_name("vol1").is_ok());
        assert!(validate_name("snap-2026_01").is_ok());
    }

    #[test]
    fn rejects_separators_and_reserved() {
        assert!(validate_name("").is_err());
        assert!(validate_name(".").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
    }

    #[test]
    fn rejects_overlong_names() {
        let long = "x".repeat(256);
        assert!(validate_name(&long).is_err());
        let ok = "x".repeat(255);
        assert!(validate_name(&ok).is_ok());
    }
}
