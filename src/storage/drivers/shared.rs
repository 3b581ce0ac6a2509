use crate::migration::channel::Channel;
use crate::ops::OpContext;
use crate::storage::drivers::PoolDriver;
use crate::storage::StorageError;
use async_trait::async_trait;
use std::path::PathBuf;

/// Remote-shared driver: every member sees the same volume content, in the
/// way a ceph-backed pool would. Relocation therefore never moves data, only
/// per-member mountpoint records.
///
/// Volumes live under the shared source; mountpoint records are plain marker
/// directories scoped by member name.
pub struct SharedDriver {
    source: PathBuf,
    member: String,
}

impl SharedDriver {
    pub fn new(source: &str, member: &str) -> Self {
        Self {
            source: PathBuf::from(source),
            member: member.to_string(),
        }
    }

    fn vol_dir(&self, project: &str, vol_type: &str, name: &str) -> PathBuf {
        self.source
            .join(vol_type)
            .join(format!("{}_{}", project, name))
    }

    fn snap_dir(&self, project: &str, vol_type: &str, parent: &str, snap: &str) -> PathBuf {
        self.source
            .join(format!("{}-snapshots", vol_type))
            .join(format!("{}_{}", project, parent))
            .join(snap)
    }

    fn mount_marker(&self, project: &str, vol_type: &str, name: &str) -> PathBuf {
        self.source
            .join(".mountpoints")
            .join(&self.member)
            .join(vol_type)
            .join(format!("{}_{}", project, name))
    }
}

async fn remove_tree(path: PathBuf) -> Result<(), StorageError> {
    match tokio::fs::remove_dir_all(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl PoolDriver for SharedDriver {
    fn driver_name(&self) -> &'static str {
        "shared"
    }

    fn remote(&self) -> bool {
        true
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
        self.import_volume(project, vol_type, name).await
    }

    async fn delete_volume(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        remove_tree(self.vol_dir(project, vol_type, name)).await?;
        remove_tree(
            self.source
                .join(format!("{}-snapshots", vol_type))
                .join(format!("{}_{}", project, name)),
        )
        .await?;
        self.cleanup_paths(project, vol_type, name).await
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

        let snap_from = self
            .source
            .join(format!("{}-snapshots", vol_type))
            .join(format!("{}_{}", project, old));
        if snap_from.exists() {
            let snap_to = self
                .source
                .join(format!("{}-snapshots", vol_type))
                .join(format!("{}_{}", project, new));
            tokio::fs::rename(&snap_from, &snap_to).await?;
        }

        self.cleanup_paths(project, vol_type, old).await?;
        self.import_volume(project, vol_type, new).await
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
        let src = vol.clone();
        tokio::task::spawn_blocking(move || copy_tree_blocking(&src, &dst))
            .await
            .map_err(|e| StorageError::Driver(e.to_string()))?
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
        let from = self.vol_dir(project, vol_type, src);
        let to = self.vol_dir(dst_project, vol_type, dst);
        tokio::task::spawn_blocking(move || copy_tree_blocking(&from, &to))
            .await
            .map_err(|e| StorageError::Driver(e.to_string()))??;
        for snap in snapshots {
            let from = self.snap_dir(project, vol_type, src, snap);
            let to = self.snap_dir(dst_project, vol_type, dst, snap);
            tokio::task::spawn_blocking(move || copy_tree_blocking(&from, &to))
                .await
                .map_err(|e| StorageError::Driver(e.to_string()))??;
        }
        self.import_volume(dst_project, vol_type, dst).await
    }

    async fn import_volume(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(self.mount_marker(project, vol_type, name)).await?;
        Ok(())
    }

    async fn cleanup_paths(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        remove_tree(self.mount_marker(project, vol_type, name)).await
    }

    async fn send_volume(
        &self,
        _project: &str,
        _vol_type: &str,
        _name: &str,
        _snapshot: Option<&str>,
        _conn: &mut dyn Channel,
        _ctx: &OpContext,
    ) -> Result<(), StorageError> {
        // Content is already visible on the target; the move is pure metadata.
        Ok(())
    }

    async fn recv_volume(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
        snapshot: Option<&str>,
        _conn: &mut dyn Channel,
        _ctx: &OpContext,
    ) -> Result<(), StorageError> {
        if snapshot.is_none() {
            self.import_volume(project, vol_type, name).await?;
        }
        Ok(())
    }
}

fn copy_tree_blocking(src: &std::path::Path, dst: &std::path::Path) -> Result<(), StorageError> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mount_markers_follow_import_and_cleanup() {
        let root =
            std::env::temp_dir().join(format!("corral-shared-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();
        let a = SharedDriver::new(root.to_str().unwrap(), "node-a");
        let b = SharedDriver::new(root.to_str().unwrap(), "node-b");

        a.create_volume("default", "container", "db01").await.unwrap();
        assert!(root.join(".mountpoints/node-a/container/default_db01").exists());

        // Relocation: target imports, source cleans up, data untouched.
        b.import_volume("default", "container", "db01").await.unwrap();
        a.cleanup_paths("default", "container", "db01").await.unwrap();
        assert!(!root.join(".mountpoints/node-a/container/default_db01").exists());
        assert!(root.join(".mountpoints/node-b/container/default_db01").exists());
        assert!(root.join("container/default_db01").exists());

        std::fs::remove_dir_all(&root).ok();
    }
}
