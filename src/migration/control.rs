//! Control-channel frames of a migration session.
//!
//! Both ends exchange one `MigrationHeader` during negotiation, then the
//! session finishes with a `MigrationControl` in each direction. Frames are
//! protobuf-encoded.

use prost::Message;
use std::collections::HashMap;

/// Filesystem transfer protocol everyone can fall back to.
pub const FS_RSYNC: &str = "rsync";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MigrationHeader {
    /// Driver-native transfer protocol offered, empty when only rsync works.
    #[prost(string, tag = "1")]
    pub fs: ::prost::alloc::string::String,

    /// Whether this end can checkpoint/restore live state.
    #[prost(bool, tag = "2")]
    pub criu: bool,

    #[prost(string, repeated, tag = "3")]
    pub rsync_features: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,

    #[prost(string, repeated, tag = "4")]
    pub zfs_features: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,

    /// Snapshot names in creation order, oldest first.
    #[prost(string, repeated, tag = "5")]
    pub snapshots: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,

    /// JSON-encoded per-snapshot config, keyed by snapshot name.
    #[prost(string, tag = "6")]
    pub snapshot_config: ::prost::alloc::string::String,

    #[prost(int64, tag = "7")]
    pub volume_size: i64,

    #[prost(bool, tag = "8")]
    pub refresh: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MigrationControl {
    #[prost(bool, tag = "1")]
    pub success: bool,

    #[prost(string, optional, tag = "2")]
    pub message: ::core::option::Option<::prost::alloc::string::String>,

    #[prost(map = "string, int64", tag = "3")]
    pub statistics: HashMap<::prost::alloc::string::String, i64>,
}

pub fn encode<M: Message>(msg: &M) -> Vec<u8> {
    let mut buf = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut buf).expect("vec grows on demand");
    buf
}

pub fn decode_header(frame: &[u8]) -> Result<MigrationHeader, prost::DecodeError> {
    MigrationHeader::decode(frame)
}

pub fn decode_control(frame: &[u8]) -> Result<MigrationControl, prost::DecodeError> {
    MigrationControl::decode(frame)
}

/// Filesystem protocol tie-break: a side offering no driver-native protocol
/// forces rsync; otherwise the intersection is taken and driver-native wins.
pub fn negotiate_fs(local: &MigrationHeader, remote: &MigrationHeader) -> String {
    if local.fs.is_empty() || remote.fs.is_empty() {
        return FS_RSYNC.to_string();
    }
    if local.fs == remote.fs && local.fs != FS_RSYNC {
        return local.fs.clone();
    }
    FS_RSYNC.to_string()
}

/// Live downgrade rule: live transfer needs criu on both ends. Without it the
/// session degrades to stateless unless the caller demanded live.
pub fn negotiate_live(
    live: bool,
    peer_criu: bool,
    required: bool,
) -> Result<bool, &'static str> {
    if !live {
        return Ok(false);
    }
    if peer_criu {
        return Ok(true);
    }
    if required {
        return Err("peer does not support live migration");
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(fs: &str, criu: bool) -> MigrationHeader {
        MigrationHeader {
            fs: fs.to_string(),
            criu,
            ..Default::default()
        }
    }

    #[test]
    fn header_round_trips_through_protobuf() {
        let mut original = header("dir", true);
        original.snapshots = vec!["snap0".to_string(), "snap1".to_string()];
        original.volume_size = 4096;
        let decoded = decode_header(&encode(&original)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn rsync_only_side_forces_rsync() {
        assert_eq!(negotiate_fs(&header("", false), &header("dir", false)), FS_RSYNC);
        assert_eq!(negotiate_fs(&header("dir", false), &header("", false)), FS_RSYNC);
    }

    #[test]
    fn matching_native_protocol_wins() {
        assert_eq!(negotiate_fs(&header("dir", false), &header("dir", false)), "dir");
    }

    #[test]
    fn mismatched_native_protocols_intersect_to_rsync() {
        assert_eq!(negotiate_fs(&header("dir", false), &header("zfs", false)), FS_RSYNC);
    }

    #[test]
    fn live_downgrades_without_peer_criu() {
        assert_eq!(negotiate_live(true, false, false), Ok(false));
        assert_eq!(negotiate_live(true, true, true), Ok(true));
        assert!(negotiate_live(true, false, true).is_err());
        assert_eq!(negotiate_live(false, true, false), Ok(false));
    }
}
