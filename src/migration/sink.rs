use crate::migration::channel::Channel;
use crate::migration::control::{
    decode_control, decode_header, encode, MigrationControl, MigrationHeader,
};
use crate::migration::source::recv_frame;
use crate::migration::{ChannelSet, MigrationError};
use crate::ops::OpContext;
use crate::storage::volume::BackupSnapshotInfo;
use crate::storage::StoragePool;
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;

/// Consumes checkpoint images on the receiving end. The instance runtime
/// plugs in here.
#[async_trait]
pub trait CheckpointRestore: Send {
    async fn receive_pre_dump(&mut self, image: Vec<u8>) -> anyhow::Result<()>;
    async fn restore(&mut self, image: Vec<u8>) -> anyhow::Result<()>;
}

/// Placeholder consumer: drains the protocol phases, restores nothing.
pub struct NullRestore;

#[async_trait]
impl CheckpointRestore for NullRestore {
    async fn receive_pre_dump(&mut self, _image: Vec<u8>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn restore(&mut self, _image: Vec<u8>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Everything the sink side needs before the first frame arrives.
pub struct SinkSpec {
    pub pool:             Arc<StoragePool>,
    pub project:          String,
    pub name:             String,
    pub vol_type:         String,
    pub live:             bool,
    pub instance_only:    bool,
    /// Same-cluster pulls share the DB with the source; rows already exist
    /// and must not be created or torn down here.
    pub cluster_internal: bool,
    pub restore:          Box<dyn CheckpointRestore>,
}

#[derive(Debug)]
pub struct SinkOutcome {
    pub live_used: bool,
    pub snapshots: Vec<BackupSnapshotInfo>,
}

/// Runs the sink half of a session over already connected channels. On any
/// failure (including cancellation) the partial target is removed before the
/// error surfaces.
pub async fn run_sink(
    mut set: ChannelSet,
    mut spec: SinkSpec,
    ctx: OpContext,
) -> Result<SinkOutcome, MigrationError> {
    debug!(
        "Migration sink starting for {}/{}",
        spec.project, spec.name
    );

    let result = receive(&mut set, &mut spec, &ctx).await;
    set.close_all().await;

    if result.is_err() {
        // Leave no half-received volume behind; same-cluster rows stay with
        // their owner, the source.
        let _ = spec
            .pool
            .delete_partial_receive(
                &spec.project,
                &spec.vol_type,
                &spec.name,
                !spec.cluster_internal,
            )
            .await;
    }

    match &result {
        Ok(outcome) => info!(
            "Migration sink finished for {}/{} (live: {})",
            spec.project, spec.name, outcome.live_used
        ),
        Err(err) => info!(
            "Migration sink failed for {}/{}: {}",
            spec.project, spec.name, err
        ),
    }
    result
}

async fn receive(
    set: &mut ChannelSet,
    spec: &mut SinkSpec,
    ctx: &OpContext,
) -> Result<SinkOutcome, MigrationError> {
    // NEGOTIATE, mirror side: the source talks first.
    let frame = recv_frame(set.control.as_mut(), ctx).await?;
    let src_header = decode_header(&frame)
        .map_err(|e| MigrationError::Protocol(format!("bad header: {}", e)))?;

    let ours = MigrationHeader {
        fs: spec.pool.info().driver,
        criu: spec.live,
        rsync_features: vec!["xattrs".to_string(), "delete".to_string()],
        zfs_features: Vec::new(),
        snapshots: Vec::new(),
        snapshot_config: String::new(),
        volume_size: 0,
        refresh: false,
    };
    set.control.send(encode(&ours)).await?;

    if crate::migration::control::negotiate_fs(&ours, &src_header)
        == crate::migration::control::FS_RSYNC
    {
        return Err(MigrationError::Protocol(
            "no common filesystem transfer protocol with the peer".to_string(),
        ));
    }

    // Both ends derive the same answer from the exchanged headers.
    let live_used = spec.live && src_header.criu && set.state.is_some();

    let snapshots: Vec<String> = if spec.instance_only {
        Vec::new()
    } else {
        src_header.snapshots.clone()
    };
    let snapshot_info: Vec<BackupSnapshotInfo> = if src_header.snapshot_config.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&src_header.snapshot_config)
            .map_err(|e| MigrationError::Protocol(format!("bad snapshot config: {}", e)))?
    };

    // Pre-create the empty target volume, then read snapshots into it in the
    // order the source announced, then the final volume.
    spec.pool
        .prepare_receive(&spec.project, &spec.vol_type, &spec.name)
        .await?;
    spec.pool
        .receive_instance(
            &spec.project,
            &spec.vol_type,
            &spec.name,
            &snapshots,
            set.filesystem.as_mut(),
            ctx,
        )
        .await?;

    if live_used {
        let state_ch = set.state.as_mut().ok_or_else(|| {
            MigrationError::Protocol("live session without a state channel".to_string())
        })?;

        let pre = recv_frame(state_ch.as_mut(), ctx).await?;
        spec.restore
            .receive_pre_dump(pre)
            .await
            .map_err(|e| MigrationError::Protocol(format!("pre-dump restore failed: {}", e)))?;

        let fin = recv_frame(state_ch.as_mut(), ctx).await?;
        spec.restore
            .restore(fin)
            .await
            .map_err(|e| MigrationError::Protocol(format!("restore failed: {}", e)))?;

        // The source flushes by closing the state channel.
        if state_ch.recv().await?.is_some() {
            return Err(MigrationError::Protocol(
                "unexpected data after final state dump".to_string(),
            ));
        }
    }

    // The source declares the transfer complete, then we ack.
    let frame = recv_frame(set.control.as_mut(), ctx).await?;
    let done = decode_control(&frame)
        .map_err(|e| MigrationError::Protocol(format!("bad control frame: {}", e)))?;
    if !done.success {
        return Err(MigrationError::Remote(
            done.message.unwrap_or_else(|| "source aborted".to_string()),
        ));
    }

    let ack = MigrationControl {
        success: true,
        message: None,
        statistics: Default::default(),
    };
    set.control.send(encode(&ack)).await?;

    Ok(SinkOutcome {
        live_used,
        snapshots: snapshot_info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::channel::MemChannel;
    use crate::migration::source::{run_source, NullCheckpoint, SourceSpec};
    use crate::migration::{ChannelHub, SessionSecrets};
    use crate::ops::{Operation, OperationClass, OperationType};

    fn test_ctx() -> OpContext {
        Operation::new(
            "default",
            OperationClass::Websocket,
            OperationType::InstanceMigrate,
            Default::default(),
        )
        .context()
    }

    /// Wires a source hub and a sink channel set back to back in memory.
    pub(crate) fn wired_session(live: bool) -> (Arc<ChannelHub>, ChannelSet) {
        let secrets = SessionSecrets::new(live);
        let hub = ChannelHub::new(secrets.clone());

        let mut sink_channels = Vec::new();
        for secret in [
            Some(secrets.control.clone()),
            Some(secrets.filesystem.clone()),
            secrets.state.clone(),
        ] {
            let Some(secret) = secret else {
                sink_channels.push(None);
                continue;
            };
            let (ours, theirs) = MemChannel::pair();
            let hub = hub.clone();
            tokio::spawn(async move {
                let _ = hub.attach(&secret, Box::new(ours)).await;
            });
            sink_channels.push(Some(Box::new(theirs) as Box<dyn Channel>));
        }

        let set = ChannelSet {
            control: sink_channels[0].take().unwrap(),
            filesystem: sink_channels[1].take().unwrap(),
            state: sink_channels[2].take(),
        };
        (hub, set)
    }

    #[test]
    fn null_restore_accepts_images() {
        futures::executor::block_on(async {
            let mut restore = NullRestore;
            restore.receive_pre_dump(vec![1, 2, 3]).await.unwrap();
            restore.restore(Vec::new()).await.unwrap();
        });
    }

    use crate::db::tables::Instance;
    use crate::db::ClusterDb;
    use crate::storage::drivers::dir::DirDriver;
    use crate::storage::drivers::PoolDriver;
    use crate::storage::volume::{
        BackupInstanceInfo, BackupVolumeInfo, InstanceBackupConfig,
    };
    use crate::storage::StoragePool;
    use std::path::PathBuf;

    fn tempdir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("corral-sess-{}-{}", tag, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn dir_pool(id: i64, root: &PathBuf, member: &str) -> Arc<StoragePool> {
        StoragePool::for_tests(
            id,
            "local",
            Arc::new(DirDriver::new(root.to_str().unwrap())),
            ClusterDb::stub(member),
        )
    }

    fn fake_instance(name: &str) -> Instance {
        Instance {
            id: 1,
            project: "default".into(),
            name: name.into(),
            kind: "container".into(),
            architecture: "x86_64".into(),
            node_id: 1,
            location: "node-a".into(),
            pool_id: 1,
            ephemeral: false,
            stateful: false,
            status: "stopped".into(),
            local_config: sqlx::types::Json(Default::default()),
            devices: sqlx::types::Json(Default::default()),
            expanded_devices: sqlx::types::Json(Default::default()),
            profiles: sqlx::types::Json(Default::default()),
            created_at: chrono::Utc::now(),
        }
    }

    fn backup_with_snapshots(name: &str, snaps: &[&str]) -> InstanceBackupConfig {
        InstanceBackupConfig {
            instance: BackupInstanceInfo {
                name: name.into(),
                project: "default".into(),
                kind: "container".into(),
                architecture: "x86_64".into(),
                ephemeral: false,
                stateful: false,
                config: Default::default(),
                devices: Default::default(),
                profiles: Default::default(),
            },
            volume: BackupVolumeInfo {
                name: name.into(),
                kind: "container".into(),
                content_type: "filesystem".into(),
                config: Default::default(),
            },
            snapshots: snaps
                .iter()
                .enumerate()
                .map(|(i, s)| BackupSnapshotInfo {
                    name: s.to_string(),
                    created_at: chrono::Utc::now() + chrono::Duration::seconds(i as i64),
                    expiry: None,
                    config: Default::default(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn full_session_transfers_snapshots_in_order() {
        let src_root = tempdir("src");
        let dst_root = tempdir("dst");
        let src_pool = dir_pool(1, &src_root, "node-a");
        let dst_pool = dir_pool(2, &dst_root, "node-b");

        // Source volume with two snapshots taken at different content.
        let driver = DirDriver::new(src_root.to_str().unwrap());
        driver.create_volume("default", "container", "web01").await.unwrap();
        let vol = driver.volume_path("default", "container", "web01");
        std::fs::write(vol.join("state"), b"generation-0").unwrap();
        driver.create_snapshot("default", "container", "web01", "snap0").await.unwrap();
        std::fs::write(vol.join("state"), b"generation-1").unwrap();
        driver.create_snapshot("default", "container", "web01", "snap1").await.unwrap();
        std::fs::write(vol.join("state"), b"generation-2").unwrap();

        let (hub, set) = wired_session(false);
        let spec = SourceSpec {
            pool: src_pool,
            inst: fake_instance("web01"),
            backup: backup_with_snapshots("web01", &["snap0", "snap1"]),
            live: false,
            require_live: false,
            instance_only: false,
            allow_inconsistent: false,
            was_running: false,
            stop: None,
            checkpoint: Box::new(NullCheckpoint),
        };
        let source = tokio::spawn(run_source(hub, spec, test_ctx()));

        let outcome = run_sink(
            set,
            SinkSpec {
                pool: dst_pool,
                project: "default".into(),
                name: "web01".into(),
                vol_type: "container".into(),
                live: false,
                instance_only: false,
                cluster_internal: true,
                restore: Box::new(NullRestore),
            },
            test_ctx(),
        )
        .await
        .unwrap();

        let src_outcome = source.await.unwrap().unwrap();
        assert!(!src_outcome.live_used);
        assert_eq!(src_outcome.stats.get("snapshots"), Some(&2));
        assert!(!outcome.live_used);

        // Transfer order equals creation order on both sides.
        let names: Vec<_> = outcome.snapshots.iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["snap0".to_string(), "snap1".to_string()]);

        assert_eq!(
            std::fs::read(dst_root.join("container/default_web01/state")).unwrap(),
            b"generation-2"
        );
        assert_eq!(
            std::fs::read(dst_root.join("container-snapshots/default_web01/snap0/state")).unwrap(),
            b"generation-0"
        );
        assert_eq!(
            std::fs::read(dst_root.join("container-snapshots/default_web01/snap1/state")).unwrap(),
            b"generation-1"
        );

        std::fs::remove_dir_all(&src_root).ok();
        std::fs::remove_dir_all(&dst_root).ok();
    }

    #[tokio::test]
    async fn live_session_streams_state_channel() {
        let src_root = tempdir("live-src");
        let dst_root = tempdir("live-dst");
        let src_pool = dir_pool(1, &src_root, "node-a");
        let dst_pool = dir_pool(2, &dst_root, "node-b");

        let driver = DirDriver::new(src_root.to_str().unwrap());
        driver.create_volume("default", "container", "web01").await.unwrap();

        let (hub, set) = wired_session(true);
        let spec = SourceSpec {
            pool: src_pool,
            inst: fake_instance("web01"),
            backup: backup_with_snapshots("web01", &[]),
            live: true,
            require_live: true,
            instance_only: true,
            allow_inconsistent: false,
            was_running: true,
            stop: None,
            checkpoint: Box::new(NullCheckpoint),
        };
        let source = tokio::spawn(run_source(hub, spec, test_ctx()));

        let outcome = run_sink(
            set,
            SinkSpec {
                pool: dst_pool,
                project: "default".into(),
                name: "web01".into(),
                vol_type: "container".into(),
                live: true,
                instance_only: true,
                cluster_internal: true,
                restore: Box::new(NullRestore),
            },
            test_ctx(),
        )
        .await
        .unwrap();

        assert!(outcome.live_used);
        assert!(source.await.unwrap().unwrap().live_used);

        std::fs::remove_dir_all(&src_root).ok();
        std::fs::remove_dir_all(&dst_root).ok();
    }

    #[tokio::test]
    async fn cancelled_sink_removes_partial_target() {
        let dst_root = tempdir("cancel-dst");
        let dst_pool = dir_pool(2, &dst_root, "node-b");

        let (_hub, set) = wired_session(false);
        let op = Operation::new(
            "default",
            OperationClass::Websocket,
            OperationType::InstanceMigrate,
            Default::default(),
        );
        let ctx = op.context();
        op.cancel();

        let err = run_sink(
            set,
            SinkSpec {
                pool: dst_pool,
                project: "default".into(),
                name: "web01".into(),
                vol_type: "container".into(),
                live: false,
                instance_only: false,
                cluster_internal: true,
                restore: Box::new(NullRestore),
            },
            ctx,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, MigrationError::Cancelled));
        assert!(!dst_root.join("container/default_web01").exists());

        std::fs::remove_dir_all(&dst_root).ok();
    }
}
