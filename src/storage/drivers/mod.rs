pub mod dir;
pub mod shared;

use crate::migration::channel::Channel;
use crate::ops::OpContext;
use crate::storage::StorageError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// On-disk verbs a pool backend provides. Drivers never touch the cluster
/// database; row bookkeeping belongs to the pool wrapper.
#[async_trait]
pub trait PoolDriver: Send + Sync {
    /// Driver name, e.g. `dir`.
    fn driver_name(&self) -> &'static str;

    /// Remote drivers expose identical content from every member.
    fn remote(&self) -> bool;

    /// Local filesystem path of a volume's root.
    fn volume_path(&self, project: &str, vol_type: &str, name: &str) -> PathBuf;

    async fn create_volume(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
    ) -> Result<(), StorageError>;

    /// Removes the volume and all of its snapshots.
    async fn delete_volume(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
    ) -> Result<(), StorageError>;

    async fn rename_volume(
        &self,
        project: &str,
        vol_type: &str,
        old: &str,
        new: &str,
    ) -> Result<(), StorageError>;

    async fn create_snapshot(
        &self,
        project: &str,
        vol_type: &str,
        parent: &str,
        snap: &str,
    ) -> Result<(), StorageError>;

    async fn delete_snapshot(
        &self,
        project: &str,
        vol_type: &str,
        parent: &str,
        snap: &str,
    ) -> Result<(), StorageError>;

    async fn rename_snapshot(
        &self,
        project: &str,
        vol_type: &str,
        parent: &str,
        old_snap: &str,
        new_snap: &str,
    ) -> Result<(), StorageError>;

    /// Restores a volume's content from one of its snapshots into a fresh
    /// volume, used by local copies.
    async fn copy_volume(
        &self,
        project: &str,
        vol_type: &str,
        src: &str,
        dst_project: &str,
        dst: &str,
        snapshots: &[String],
    ) -> Result<(), StorageError>;

    /// Creates the local mountpoint records for a volume whose data already
    /// exists (remote-shared relocation target).
    async fn import_volume(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
    ) -> Result<(), StorageError>;

    /// Tears down local mountpoint records without touching shared data.
    async fn cleanup_paths(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
    ) -> Result<(), StorageError>;

    /// Streams one item into `conn`: a snapshot when `snapshot` is set, else
    /// the volume itself. Remote drivers transfer nothing.
    async fn send_volume(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
        snapshot: Option<&str>,
        conn: &mut dyn Channel,
        ctx: &OpContext,
    ) -> Result<(), StorageError>;

    /// Mirror of `send_volume` on the receiving side.
    async fn recv_volume(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
        snapshot: Option<&str>,
        conn: &mut dyn Channel,
        ctx: &OpContext,
    ) -> Result<(), StorageError>;
}

/// Instantiates a driver from its configured name.
pub fn load(
    driver: &str,
    source: &str,
    member: &str,
) -> Result<Arc<dyn PoolDriver>, StorageError> {
    match driver {
        "dir" => Ok(Arc::new(dir::DirDriver::new(source))),
        "shared" => Ok(Arc::new(shared::SharedDriver::new(source, member))),
        other => Err(StorageError::Driver(format!(
            "unknown storage driver \"{}\"",
            other
        ))),
    }
}
