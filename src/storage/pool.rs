use crate::config::MemberConfig;
use crate::db::queries as db;
use crate::db::tables::{
    join_snapshot_name, split_snapshot_name, Instance, StorageVolume, VOLUME_TYPE_CUSTOM,
};
use crate::db::{ClusterDb, DbError};
use crate::migration::channel::Channel;
use crate::ops::OpContext;
use crate::storage::drivers::{self, PoolDriver};
use crate::storage::volume::{
    validate_name, BackupInstanceInfo, BackupSnapshotInfo, BackupVolumeInfo, InstanceBackupConfig,
};
use crate::storage::StorageError;
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Pool facts the orchestrator bases its flow decisions on.
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub name:   String,
    pub driver: String,
    pub remote: bool,
}

/// Arguments of a driver-native instance transfer.
pub struct MigrateArgs {
    /// Project-qualified target name, `project/name`.
    pub data:          String,
    /// Descriptor generated by the source, carrying the snapshot list.
    pub info:          Option<InstanceBackupConfig>,
    pub live:          bool,
    pub instance_only: bool,
}

impl MigrateArgs {
    pub fn snapshot_names(&self) -> Vec<String> {
        if self.instance_only {
            return Vec::new();
        }
        self.info
            .as_ref()
            .map(|info| info.snapshots.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }
}

/// A storage pool: driver verbs plus the volume-row bookkeeping that goes
/// with them. The pool is the sole mutator of its on-disk layout.
pub struct StoragePool {
    pub id:   i64,
    pub name: String,
    driver:   Arc<dyn PoolDriver>,
    db:       Arc<ClusterDb>,
}

impl StoragePool {
    /// Pool over an explicit driver and a stub facade, for driver-only tests.
    #[cfg(test)]
    pub(crate) fn for_tests(
        id: i64,
        name: &str,
        driver: Arc<dyn PoolDriver>,
        db: Arc<ClusterDb>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_string(),
            driver,
            db,
        })
    }

    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            name: self.name.clone(),
            driver: self.driver.driver_name().to_string(),
            remote: self.driver.remote(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.driver.remote()
    }

    /// Same rule as pool names: single path segment, bounded length.
    pub fn validate_name(&self, name: &str) -> Result<(), StorageError> {
        validate_name(name)
    }

    /// Local filesystem root of an instance's volume, for the file service.
    pub fn instance_path(&self, inst: &Instance) -> std::path::PathBuf {
        self.driver
            .volume_path(&inst.project, inst.volume_type(), &inst.name)
    }

    async fn custom_volume(
        &self,
        project: &str,
        name: &str,
    ) -> Result<StorageVolume, DbError> {
        db::volume::get_storage_pool_volume(
            self.db.pool(),
            self.id,
            project,
            VOLUME_TYPE_CUSTOM,
            name,
        )
        .await
    }

    /// Creates a snapshot of a custom volume. The snapshot's config is fully
    /// inherited from the parent at this point and never mutates afterwards,
    /// apart from description and expiry.
    pub async fn create_custom_volume_snapshot(
        &self,
        project: &str,
        parent: &str,
        snap: &str,
        description: &str,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<i64, StorageError> {
        self.validate_name(snap)?;
        let parent_vol = self.custom_volume(project, parent).await?;

        let full_name = join_snapshot_name(parent, snap);
        match self.custom_volume(project, &full_name).await {
            Ok(_) => return Err(StorageError::AlreadyExists(full_name)),
            Err(DbError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        self.driver
            .create_snapshot(project, VOLUME_TYPE_CUSTOM, parent, snap)
            .await?;

        match db::volume::create_volume_snapshot(
            self.db.pool(),
            &parent_vol,
            snap,
            description,
            expiry,
        )
        .await
        {
            Ok(id) => Ok(id),
            Err(e) => {
                // Roll the on-disk snapshot back so disk and DB stay aligned.
                let _ = self
                    .driver
                    .delete_snapshot(project, VOLUME_TYPE_CUSTOM, parent, snap)
                    .await;
                Err(e.into())
            }
        }
    }

    pub async fn delete_custom_volume_snapshot(
        &self,
        project: &str,
        full_name: &str,
    ) -> Result<(), StorageError> {
        let (parent, snap) =
            split_snapshot_name(full_name).ok_or(StorageError::NotFound)?;
        let row = self.custom_volume(project, full_name).await?;

        self.driver
            .delete_snapshot(project, VOLUME_TYPE_CUSTOM, parent, snap)
            .await?;
        db::volume::delete_volume(self.db.pool(), row.id).await?;
        Ok(())
    }

    pub async fn rename_custom_volume_snapshot(
        &self,
        project: &str,
        full_name: &str,
        new_snap: &str,
    ) -> Result<(), StorageError> {
        self.validate_name(new_snap)?;
        let (parent, snap) =
            split_snapshot_name(full_name).ok_or(StorageError::NotFound)?;
        let row = self.custom_volume(project, full_name).await?;

        let new_full = join_snapshot_name(parent, new_snap);
        match self.custom_volume(project, &new_full).await {
            Ok(_) => return Err(StorageError::AlreadyExists(new_full)),
            Err(DbError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        self.driver
            .rename_snapshot(project, VOLUME_TYPE_CUSTOM, parent, snap, new_snap)
            .await?;
        db::volume::rename_volume_snapshot(self.db.pool(), row.id, &new_full).await?;
        Ok(())
    }

    /// Updates the mutable snapshot fields. Any attempt to change the
    /// inherited config is refused.
    pub async fn update_custom_volume_snapshot(
        &self,
        project: &str,
        full_name: &str,
        description: &str,
        config: Option<&HashMap<String, String>>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let row = self.custom_volume(project, full_name).await?;

        if let Some(config) = config {
            if *config != *row.config {
                return Err(StorageError::SnapshotImmutable);
            }
        }

        db::volume::update_volume_snapshot(self.db.pool(), row.id, description, expiry).await?;
        Ok(())
    }

    /// Copies a custom volume (optionally with snapshots) into a new one on
    /// this pool.
    pub async fn create_custom_volume_from_copy(
        &self,
        project: &str,
        new_name: &str,
        src_project: &str,
        src_name: &str,
        with_snapshots: bool,
    ) -> Result<(), StorageError> {
        self.validate_name(new_name)?;
        let src = self.custom_volume(src_project, src_name).await?;

        let snapshots = if with_snapshots {
            db::volume::get_local_storage_pool_volume_snapshots_with_type(
                self.db.pool(),
                src_project,
                src_name,
                VOLUME_TYPE_CUSTOM,
                self.id,
            )
            .await?
        } else {
            Vec::new()
        };
        let snap_names: Vec<String> = snapshots
            .iter()
            .filter_map(|s| s.split_snapshot_name().map(|(_, snap)| snap.to_string()))
            .collect();

        self.driver
            .copy_volume(
                src_project,
                VOLUME_TYPE_CUSTOM,
                src_name,
                project,
                new_name,
                &snap_names,
            )
            .await?;

        db::volume::create_volume(
            self.db.pool(),
            &db::volume::NewVolume {
                project,
                name: new_name,
                vol_type: VOLUME_TYPE_CUSTOM,
                pool_id: self.id,
                node_id: src.node_id,
                content_type: &src.content_type,
                description: &src.description,
                config: &src.config,
                expiry: None,
            },
        )
        .await?;

        for snap in &snapshots {
            let Some((_, snap_name)) = snap.split_snapshot_name() else {
                continue;
            };
            let mut copy = snap.clone();
            copy.name = join_snapshot_name(new_name, snap_name);
            db::volume::create_volume(
                self.db.pool(),
                &db::volume::NewVolume {
                    project,
                    name: &copy.name,
                    vol_type: VOLUME_TYPE_CUSTOM,
                    pool_id: self.id,
                    node_id: copy.node_id,
                    content_type: &copy.content_type,
                    description: &copy.description,
                    config: &copy.config,
                    expiry: copy.expiry,
                },
            )
            .await?;
        }

        Ok(())
    }

    /// Removes an instance's volume, snapshots and rows from this pool.
    pub async fn delete_instance(&self, inst: &Instance) -> Result<(), StorageError> {
        self.driver
            .delete_volume(&inst.project, inst.volume_type(), &inst.name)
            .await?;
        self.delete_instance_volume_rows(&inst.project, inst.volume_type(), &inst.name)
            .await
    }

    /// Removes only the local on-disk data of an instance. Used by the source
    /// after a cross-member move, once the rows already point at the target.
    pub async fn delete_instance_data(&self, inst: &Instance) -> Result<(), StorageError> {
        self.driver
            .delete_volume(&inst.project, inst.volume_type(), &inst.name)
            .await
    }

    /// Row cleanup shared by delete and cancelled-transfer teardown, keyed by
    /// name because the instance row may never have existed on this side.
    pub async fn delete_instance_volume_rows(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        let volumes = db::volume::get_storage_pool_volumes_with_type(self.db.pool(), vol_type)
            .await?;
        for vol in volumes {
            let matches = vol.project == project
                && (vol.name == name
                    || vol
                        .split_snapshot_name()
                        .map_or(false, |(parent, _)| parent == name));
            if matches && vol.pool_id == self.id {
                db::volume::delete_volume(self.db.pool(), vol.id).await?;
            }
        }
        Ok(())
    }

    /// Removes on-disk data of a single instance snapshot and its row.
    pub async fn delete_instance_snapshot(
        &self,
        inst: &Instance,
        snap: &str,
    ) -> Result<(), StorageError> {
        let vol_type = inst.volume_type();
        self.driver
            .delete_snapshot(&inst.project, vol_type, &inst.name, snap)
            .await?;

        let full = join_snapshot_name(&inst.name, snap);
        match db::volume::get_storage_pool_volume(
            self.db.pool(),
            self.id,
            &inst.project,
            vol_type,
            &full,
        )
        .await
        {
            Ok(row) => db::volume::delete_volume(self.db.pool(), row.id).await?,
            Err(DbError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// After a remote-shared relocation: tear down the source member's
    /// mountpoint records, leaving the shared data alone.
    pub async fn cleanup_instance_paths(&self, inst: &Instance) -> Result<(), StorageError> {
        self.driver
            .cleanup_paths(&inst.project, inst.volume_type(), &inst.name)
            .await
    }

    /// Creates local mountpoints (and missing rows) for an instance whose
    /// storage already exists, as on the target of a remote-shared move.
    pub async fn import_instance(
        &self,
        inst: &Instance,
        src_config: &InstanceBackupConfig,
    ) -> Result<(), StorageError> {
        let vol_type = inst.volume_type();
        self.driver
            .import_volume(&inst.project, vol_type, &inst.name)
            .await?;

        match db::volume::get_storage_pool_volume(
            self.db.pool(),
            self.id,
            &inst.project,
            vol_type,
            &inst.name,
        )
        .await
        {
            Ok(_) => {}
            Err(DbError::NotFound) => {
                db::volume::create_volume(
                    self.db.pool(),
                    &db::volume::NewVolume {
                        project: &inst.project,
                        name: &inst.name,
                        vol_type,
                        pool_id: self.id,
                        node_id: if self.is_remote() { None } else { Some(inst.node_id) },
                        content_type: &src_config.volume.content_type,
                        description: "",
                        config: &src_config.volume.config,
                        expiry: None,
                    },
                )
                .await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Sink-side pre-creation: empty volume plus snapshot rows when this
    /// member's store has none yet (cross-server receives).
    pub async fn create_instance_for_receive(
        &self,
        project: &str,
        name: &str,
        info: &InstanceBackupConfig,
        node_id: i64,
    ) -> Result<(), StorageError> {
        let vol_type = info.volume.kind.as_str();
        self.driver.create_volume(project, vol_type, name).await?;

        match db::volume::get_storage_pool_volume(
            self.db.pool(),
            self.id,
            project,
            vol_type,
            name,
        )
        .await
        {
            Ok(_) => {}
            Err(DbError::NotFound) => {
                db::volume::create_volume(
                    self.db.pool(),
                    &db::volume::NewVolume {
                        project,
                        name,
                        vol_type,
                        pool_id: self.id,
                        node_id: if self.is_remote() { None } else { Some(node_id) },
                        content_type: &info.volume.content_type,
                        description: "",
                        config: &info.volume.config,
                        expiry: None,
                    },
                )
                .await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Makes sure the empty target volume exists ahead of a same-cluster
    /// receive; the rows already live in the shared store.
    pub async fn prepare_receive(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        match self.driver.create_volume(project, vol_type, name).await {
            Ok(()) | Err(StorageError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Removes whatever a cancelled or failed receive left behind. Rows are
    /// only touched when this member created them itself.
    pub async fn delete_partial_receive(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
        with_rows: bool,
    ) -> Result<(), StorageError> {
        self.driver.delete_volume(project, vol_type, name).await?;
        if with_rows {
            self.delete_instance_volume_rows(project, vol_type, name)
                .await?;
        }
        Ok(())
    }

    /// Inserts snapshot rows for a received instance from the source's
    /// descriptor. Used when this member's store does not know them yet.
    pub async fn create_snapshot_rows(
        &self,
        project: &str,
        name: &str,
        vol_type: &str,
        info: &InstanceBackupConfig,
        node_id: i64,
    ) -> Result<(), StorageError> {
        for snap in &info.snapshots {
            let full = join_snapshot_name(name, &snap.name);
            match db::volume::get_storage_pool_volume(
                self.db.pool(),
                self.id,
                project,
                vol_type,
                &full,
            )
            .await
            {
                Ok(_) => continue,
                Err(DbError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
            db::volume::create_volume(
                self.db.pool(),
                &db::volume::NewVolume {
                    project,
                    name: &full,
                    vol_type,
                    pool_id: self.id,
                    node_id: if self.is_remote() { None } else { Some(node_id) },
                    content_type: &info.volume.content_type,
                    description: "",
                    config: &snap.config,
                    expiry: snap.expiry,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Driver-native transfer of an instance towards `conn`: snapshots
    /// oldest-first, then the instance volume. For remote drivers every item
    /// is a metadata no-op and the channel stays idle. Cancellation is
    /// observed between items and inside each transfer.
    pub async fn migrate_instance(
        &self,
        inst: &Instance,
        conn: &mut dyn Channel,
        args: &MigrateArgs,
        ctx: &OpContext,
    ) -> Result<(), StorageError> {
        info!(
            "Migrating instance {}/{} towards {} (pool {}, live: {})",
            inst.project, inst.name, args.data, self.name, args.live
        );
        let vol_type = inst.volume_type();
        for snap in args.snapshot_names() {
            if ctx.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            self.driver
                .send_volume(&inst.project, vol_type, &inst.name, Some(&snap), conn, ctx)
                .await?;
        }
        if ctx.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        self.driver
            .send_volume(&inst.project, vol_type, &inst.name, None, conn, ctx)
            .await
    }

    /// Sink half of `migrate_instance`, same item order.
    pub async fn receive_instance(
        &self,
        project: &str,
        vol_type: &str,
        name: &str,
        snapshots: &[String],
        conn: &mut dyn Channel,
        ctx: &OpContext,
    ) -> Result<(), StorageError> {
        for snap in snapshots {
            if ctx.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            self.driver
                .recv_volume(project, vol_type, name, Some(snap), conn, ctx)
                .await?;
        }
        if ctx.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        self.driver
            .recv_volume(project, vol_type, name, None, conn, ctx)
            .await
    }

    /// On-disk rename of an instance volume; rows move inside the rename
    /// transaction run by the caller.
    pub async fn rename_instance(
        &self,
        inst: &Instance,
        new_name: &str,
    ) -> Result<(), StorageError> {
        self.validate_name(new_name)?;
        self.driver
            .rename_volume(&inst.project, inst.volume_type(), &inst.name, new_name)
            .await
    }

    /// Builds the descriptor the sink needs before receiving data.
    pub async fn generate_instance_backup_config(
        &self,
        inst: &Instance,
        with_snapshots: bool,
    ) -> Result<InstanceBackupConfig, StorageError> {
        let vol_type = inst.volume_type();
        let volume = db::volume::get_storage_pool_volume(
            self.db.pool(),
            self.id,
            &inst.project,
            vol_type,
            &inst.name,
        )
        .await?;

        let snapshots = if with_snapshots {
            db::volume::get_local_storage_pool_volume_snapshots_with_type(
                self.db.pool(),
                &inst.project,
                &inst.name,
                vol_type,
                self.id,
            )
            .await?
            .into_iter()
            .filter_map(|row| {
                row.split_snapshot_name().map(|(_, snap)| BackupSnapshotInfo {
                    name: snap.to_string(),
                    created_at: row.created_at,
                    expiry: row.expiry,
                    config: (*row.config).clone(),
                })
            })
            .collect()
        } else {
            Vec::new()
        };

        Ok(InstanceBackupConfig {
            instance: BackupInstanceInfo {
                name: inst.name.clone(),
                project: inst.project.clone(),
                kind: inst.kind.clone(),
                architecture: inst.architecture.clone(),
                ephemeral: inst.ephemeral,
                stateful: inst.stateful,
                config: (*inst.local_config).clone(),
                devices: (*inst.devices).clone(),
                profiles: (*inst.profiles).clone(),
            },
            volume: BackupVolumeInfo {
                name: volume.name.clone(),
                kind: volume.kind.clone(),
                content_type: volume.content_type.clone(),
                config: (*volume.config).clone(),
            },
            snapshots,
        })
    }
}

/// All pools configured on this member, keyed by name and DB id.
pub struct PoolRegistry {
    pools: Vec<Arc<StoragePool>>,
}

impl PoolRegistry {
    /// Registers configured pools in the DB and instantiates their drivers.
    pub async fn load(
        config: &MemberConfig,
        db: Arc<ClusterDb>,
    ) -> Result<Arc<Self>, StorageError> {
        let mut pools = Vec::new();
        for pool_cfg in &config.pools {
            validate_name(&pool_cfg.name)?;
            let id = db::pool::ensure_pool(db.pool(), &pool_cfg.name, &pool_cfg.driver).await?;
            let driver = drivers::load(&pool_cfg.driver, &pool_cfg.source, &config.name)?;
            info!(
                "Loaded storage pool {} (driver {}, id {})",
                pool_cfg.name, pool_cfg.driver, id
            );
            pools.push(Arc::new(StoragePool {
                id,
                name: pool_cfg.name.clone(),
                driver,
                db: db.clone(),
            }));
        }
        Ok(Arc::new(Self { pools }))
    }

    pub fn get(&self, name: &str) -> Option<Arc<StoragePool>> {
        self.pools.iter().find(|p| p.name == name).cloned()
    }

    pub fn get_by_id(&self, id: i64) -> Option<Arc<StoragePool>> {
        self.pools.iter().find(|p| p.id == id).cloned()
    }

    pub fn all(&self) -> &[Arc<StoragePool>] {
        &self.pools
    }
}
