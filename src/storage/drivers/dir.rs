use crate::migration::channel::Channel;
use crate::ops::OpContext;
use crate::storage::drivers::PoolDriver;
use crate::storage::{stream, StorageError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Plain directory-backed local driver.
///
/// Layout under the pool source:
///   `<source>/<type>/<project>_<name>`                volume root
///   `<source>/<type>-snapshots/<project>_<name>/<snap>` snapshot roots
pub struct DirDriver {
    source: PathBuf,
}

impl DirDriver {
    pub fn new(source: &str) -> Self {
        Self {
            source: PathBuf::from(source),
        }
    }

    fn vol_dir(&self, project: &str, vol_type: &str, name: &str) -> PathBuf {
        self.source
            .join(vol_type)
            .join(format!("{}_{}", project, name))
    }

    fn snap_parent_dir(&self, project: &str, vol_type: &str, name: &str) -> PathBuf {
        self.source
            .join(format!("{}-snapshots", vol_type))
            .join(format!("{}_{}", project, name))
    }

    fn snap_dir(&self, project: &str, vol_type: &str, parent: &str, snap: &str) -> PathBuf {
        self.snap_parent_dir(project, vol_type, parent).join(snap)
    }
}

/// Recursive tree copy on a blocking thread.
async fn copy_tree(src: PathBuf, dst: PathBuf) -> Result<(), StorageError> {
    tokio::task::spawn_blocking(move || copy_tree_blocking(&src, &dst))
        .await
        .map_err(|e| StorageError::Driver(e.to_string()))?
}

fn copy_tree_blocking(src: &Path, dst: &Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = std::fs::symlink_metadata(&from)?;
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&from)?;
            std::os::unix::fs::symlink(target, &to)?;
        } else if meta.is_dir() {
            copy_tree_blocking(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

async fn remove_tree(path: PathBuf) -> Result<(), StorageError> {
    match tokio::fs::remove_dir_all(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl PoolDriver for DirDriver {
    fn driver_name(&self) -> &'static str {
        "dir"
    }

    fn remote(&self) -> bool {
        false
    }

    fn volume_path(&self, project: &str, vol_type: &str, name: &str) -> PathBuf {
        self.vol_dir(project, vol_type, name)
    }

    async fn create_volume(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        let dir = self.vol_dir(project, vol_type, name);
        if dir.exists() {
            return Err(StorageError::AlreadyExists(name.to_string()));
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(())
    }

    async fn delete_volume(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        remove_tree(self.vol_dir(project, vol_type, name)).await?;
        remove_tree(self.snap_parent_dir(project, vol_type, name)).await?;
        Ok(())
    }

    async fn rename_volume(
        &self,
        project: &str,
        vol_type: &str,
        old: &str,
        new: &str,
    ) -> Result<(), StorageError> {
        let from = self.vol_dir(project, vol_type, old);
        let to = self.vol_dir(project, vol_type, new);
        if to.exists() {
            return Err(StorageError::AlreadyExists(new.to_string()));
        }
        tokio::fs::rename(&from, &to).await?;

        let snap_from = self.snap_parent_dir(project, vol_type, old);
        if snap_from.exists() {
            let snap_to = self.snap_parent_dir(project, vol_type, new);
            tokio::fs::rename(&snap_from, &snap_to).await?;
        }
        Ok(())
    }

    async fn create_snapshot(
        &self,
        project: &str,
        vol_type: &str,
        parent: &str,
        snap: &str,
    ) -> Result<(), StorageError> {
        let vol = self.vol_dir(project, vol_type, parent);
        if !vol.exists() {
            return Err(StorageError::NotFound);
        }
        let dst = self.snap_dir(project, vol_type, parent, snap);
        if dst.exists() {
            return Err(StorageError::AlreadyExists(snap.to_string()));
        }
        copy_tree(vol, dst).await
    }

    async fn delete_snapshot(
        &self,
        project: &str,
        vol_type: &str,
        parent: &str,
        snap: &str,
    ) -> Result<(), StorageError> {
        remove_tree(self.snap_dir(project, vol_type, parent, snap)).await
    }

    async fn rename_snapshot(
        &self,
        project: &str,
        vol_type: &str,
        parent: &str,
        old_snap: &str,
        new_snap: &str,
    ) -> Result<(), StorageError> {
        let from = self.snap_dir(project, vol_type, parent, old_snap);
        let to = self.snap_dir(project, vol_type, parent, new_snap);
        if to.exists() {
            return Err(StorageError::AlreadyExists(new_snap.to_string()));
        }
        tokio::fs::rename(&from, &to).await?;
        Ok(())
    }

    async fn copy_volume(
        &self,
        project: &str,
        vol_type: &str,
        src: &str,
        dst_project: &str,
        dst: &str,
        snapshots: &[String],
    ) -> Result<(), StorageError> {
        copy_tree(
            self.vol_dir(project, vol_type, src),
            self.vol_dir(dst_project, vol_type, dst),
        )
        .await?;
        for snap in snapshots {
            copy_tree(
                self.snap_dir(project, vol_type, src, snap),
                self.snap_dir(dst_project, vol_type, dst, snap),
            )
            .await?;
        }
        Ok(())
    }

    async fn import_volume(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        // Local driver: importing just makes sure the tree exists.
        tokio::fs::create_dir_all(self.vol_dir(project, vol_type, name)).await?;
        Ok(())
    }

    async fn cleanup_paths(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        // Local driver owns its data, so path cleanup is full removal.
        self.delete_volume(project, vol_type, name).await
    }

    async fn send_volume(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
        snapshot: Option<&str>,
        conn: &mut dyn Channel,
        ctx: &OpContext,
    ) -> Result<(), StorageError> {
        let root = match snapshot {
            Some(snap) => self.snap_dir(project, vol_type, name, snap),
            None => self.vol_dir(project, vol_type, name),
        };
        stream::send_tree(&root, conn, ctx).await
    }

    async fn recv_volume(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
        snapshot: Option<&str>,
        conn: &mut dyn Channel,
        ctx: &OpContext,
    ) -> Result<(), StorageError> {
        let root = match snapshot {
            Some(snap) => self.snap_dir(project, vol_type, name, snap),
            None => self.vol_dir(project, vol_type, name),
        };
        stream::recv_tree(&root, conn, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::channel::MemChannel;
    use crate::ops::{Operation, OperationClass, OperationType};

    fn test_ctx() -> OpContext {
        Operation::new(
            "default",
            OperationClass::Task,
            OperationType::InstanceMigrate,
            Default::default(),
        )
        .context()
    }

    fn temp_driver(tag: &str) -> (DirDriver, PathBuf) {
        let root = std::env::temp_dir().join(format!("corral-dir-{}-{}", tag, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();
        (DirDriver::new(root.to_str().unwrap()), root)
    }

    #[tokio::test]
    async fn snapshot_copies_and_deletes() {
        let (driver, root) = temp_driver("snap");
        driver.create_volume("default", "custom", "vol1").await.unwrap();
        std::fs::write(
            driver.volume_path("default", "custom", "vol1").join("data"),
            b"v1",
        )
        .unwrap();

        driver
            .create_snapshot("default", "custom", "vol1", "snap0")
            .await
            .unwrap();
        let snap_data = root.join("custom-snapshots/default_vol1/snap0/data");
        assert_eq!(std::fs::read(&snap_data).unwrap(), b"v1");

        // Parent mutates, snapshot stays frozen.
        std::fs::write(
            driver.volume_path("default", "custom", "vol1").join("data"),
            b"v2",
        )
        .unwrap();
        assert_eq!(std::fs::read(&snap_data).unwrap(), b"v1");

        driver
            .delete_snapshot("default", "custom", "vol1", "snap0")
            .await
            .unwrap();
        assert!(!snap_data.exists());

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn migrate_transfers_snapshots_then_volume() {
        let (src, src_root) = temp_driver("mig-src");
        let (dst, dst_root) = temp_driver("mig-dst");

        src.create_volume("default", "container", "web01").await.unwrap();
        std::fs::write(
            src.volume_path("default", "container", "web01").join("rootfs"),
            b"latest",
        )
        .unwrap();
        src.create_snapshot("default", "container", "web01", "snap0")
            .await
            .unwrap();

        let (mut a, mut b) = MemChannel::pair();
        let sender = tokio::spawn(async move {
            let ctx = test_ctx();
            src.send_volume("default", "container", "web01", Some("snap0"), &mut a, &ctx)
                .await?;
            src.send_volume("default", "container", "web01", None, &mut a, &ctx)
                .await
        });
        let ctx = test_ctx();
        dst.recv_volume("default", "container", "web01", Some("snap0"), &mut b, &ctx)
            .await
            .unwrap();
        dst.recv_volume("default", "container", "web01", None, &mut b, &ctx)
            .await
            .unwrap();
        sender.await.unwrap().unwrap();

        assert_eq!(
            std::fs::read(dst_root.join("container/default_web01/rootfs")).unwrap(),
            b"latest"
        );
        assert_eq!(
            std::fs::read(dst_root.join("container-snapshots/default_web01/snap0/rootfs")).unwrap(),
            b"latest"
        );

        std::fs::remove_dir_all(&src_root).ok();
        std::fs::remove_dir_all(&dst_root).ok();
    }
}
