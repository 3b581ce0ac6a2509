use crate::db::tables::Instance;
use crate::migration::channel::Channel;
use crate::migration::control::{
    decode_control, decode_header, encode, negotiate_fs, negotiate_live, MigrationControl,
    MigrationHeader,
};
use crate::migration::{ChannelHub, ChannelSet, MigrationError};
use crate::ops::OpContext;
use crate::storage::volume::InstanceBackupConfig;
use crate::storage::{MigrateArgs, StoragePool};
use async_trait::async_trait;
use futures::future::BoxFuture;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;

/// Phases of the live tail of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivePhase {
    PreDump,
    Final,
    Flush,
}

/// States the source steps through. One task drives the whole machine; there
/// is no concurrency inside a session beyond the pool transfer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Init,
    WaitConnect,
    Negotiate,
    Checkpoint,
    Stream,
    Live(LivePhase),
    Finalize,
    Cleanup,
}

/// Hook that stops the instance ahead of a stateless transfer.
pub type StopFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Produces checkpoint images for live transfers. The instance runtime plugs
/// in here; the migration engine only moves the images.
#[async_trait]
pub trait CheckpointSource: Send {
    async fn pre_dump(&mut self) -> anyhow::Result<Vec<u8>>;
    async fn freeze(&mut self) -> anyhow::Result<()>;
    async fn final_dump(&mut self) -> anyhow::Result<Vec<u8>>;
}

/// Placeholder provider used while the runtime integration is external to
/// this daemon: images are empty but the protocol phases are exercised.
pub struct NullCheckpoint;

#[async_trait]
impl CheckpointSource for NullCheckpoint {
    async fn pre_dump(&mut self) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn freeze(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn final_dump(&mut self) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Everything the source side needs, resolved at INIT by the orchestrator:
/// snapshots enumerated in creation order, live already derived from
/// `stateful && running`.
pub struct SourceSpec {
    pub pool:               Arc<StoragePool>,
    pub inst:               Instance,
    pub backup:             InstanceBackupConfig,
    pub live:               bool,
    pub require_live:       bool,
    pub instance_only:      bool,
    pub allow_inconsistent: bool,
    pub was_running:        bool,
    pub stop:               Option<StopFn>,
    pub checkpoint:         Box<dyn CheckpointSource>,
}

pub struct SourceOutcome {
    pub live_used: bool,
    pub stats:     HashMap<String, i64>,
}

/// Receives the next control frame, racing cancellation.
pub(crate) async fn recv_frame(
    ch: &mut dyn Channel,
    ctx: &OpContext,
) -> Result<Vec<u8>, MigrationError> {
    tokio::select! {
        _ = ctx.cancelled() => Err(MigrationError::Cancelled),
        frame = ch.recv() => frame?
            .ok_or_else(|| MigrationError::Protocol("channel closed mid-session".to_string())),
    }
}

/// Runs the source half of a migration session to completion. CLEANUP always
/// runs: channels are closed and parked HTTP handlers released whatever the
/// outcome was.
pub async fn run_source(
    hub: Arc<ChannelHub>,
    mut spec: SourceSpec,
    ctx: OpContext,
) -> Result<SourceOutcome, MigrationError> {
    debug!(
        "Migration source starting for {}/{}",
        spec.inst.project, spec.inst.name
    );

    let result = async {
        // WAIT_CONNECT
        let mut set = hub.wait_connected(&ctx).await?;
        let outcome = transfer(&mut set, &mut spec, &ctx).await;
        set.close_all().await;
        outcome
    }
    .await;

    hub.finish();

    match &result {
        Ok(outcome) => info!(
            "Migration source finished for {}/{} (live: {})",
            spec.inst.project, spec.inst.name, outcome.live_used
        ),
        Err(err) => info!(
            "Migration source failed for {}/{}: {}",
            spec.inst.project, spec.inst.name, err
        ),
    }
    result
}

async fn transfer(
    set: &mut ChannelSet,
    spec: &mut SourceSpec,
    ctx: &OpContext,
) -> Result<SourceOutcome, MigrationError> {
    let mut state = SourceState::Init;
    let mut live_used = false;
    let mut stats: HashMap<String, i64> = HashMap::new();

    loop {
        if ctx.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }

        state = match state {
            // Snapshot enumeration and the live decision were resolved while
            // building the spec; the channel set arrived with it.
            SourceState::Init => SourceState::WaitConnect,
            SourceState::WaitConnect => SourceState::Negotiate,

            SourceState::Negotiate => {
                let ours = local_header(spec);
                set.control.send(encode(&ours)).await?;

                let frame = recv_frame(set.control.as_mut(), ctx).await?;
                let theirs = decode_header(&frame)
                    .map_err(|e| MigrationError::Protocol(format!("bad header: {}", e)))?;

                let fs = negotiate_fs(&ours, &theirs);
                if fs == crate::migration::control::FS_RSYNC {
                    // The generic fallback needs an rsync stream the storage
                    // drivers here do not provide; refuse instead of stalling
                    // against a mismatched peer.
                    return Err(MigrationError::Protocol(
                        "no common filesystem transfer protocol with the peer".to_string(),
                    ));
                }
                live_used = negotiate_live(spec.live, theirs.criu, spec.require_live)
                    .map_err(|_| MigrationError::LiveNotSupported)?;
                debug!("Negotiated fs protocol {} (live: {})", fs, live_used);

                if spec.was_running && !live_used {
                    SourceState::Checkpoint
                } else {
                    SourceState::Stream
                }
            }

            // Stateless-but-running: stop cleanly before any byte moves; the
            // instance is never frozen mid-stream.
            SourceState::Checkpoint => {
                if let Some(stop) = spec.stop.take() {
                    stop()
                        .await
                        .map_err(|e| MigrationError::Protocol(format!("stop failed: {}", e)))?;
                }
                SourceState::Stream
            }

            SourceState::Stream => {
                let args = MigrateArgs {
                    data: format!("{}/{}", spec.inst.project, spec.inst.name),
                    info: Some(spec.backup.clone()),
                    live: live_used,
                    instance_only: spec.instance_only,
                };
                stats.insert("snapshots".to_string(), args.snapshot_names().len() as i64);
                spec.pool
                    .migrate_instance(&spec.inst, set.filesystem.as_mut(), &args, ctx)
                    .await?;

                if live_used {
                    SourceState::Live(LivePhase::PreDump)
                } else {
                    SourceState::Finalize
                }
            }

            SourceState::Live(phase) => {
                let state_ch = set.state.as_mut().ok_or_else(|| {
                    MigrationError::Protocol("live session without a state channel".to_string())
                })?;
                match phase {
                    LivePhase::PreDump => {
                        let image = spec.checkpoint.pre_dump().await.map_err(|e| {
                            MigrationError::Protocol(format!("pre-dump failed: {}", e))
                        })?;
                        state_ch.send(image).await?;
                        SourceState::Live(LivePhase::Final)
                    }
                    LivePhase::Final => {
                        spec.checkpoint.freeze().await.map_err(|e| {
                            MigrationError::Protocol(format!("freeze failed: {}", e))
                        })?;
                        let image = spec.checkpoint.final_dump().await.map_err(|e| {
                            MigrationError::Protocol(format!("final dump failed: {}", e))
                        })?;
                        state_ch.send(image).await?;
                        SourceState::Live(LivePhase::Flush)
                    }
                    LivePhase::Flush => {
                        state_ch.close().await?;
                        stats.insert("live".to_string(), 1);
                        SourceState::Finalize
                    }
                }
            }

            // Success only counts once the sink has acked over control.
            SourceState::Finalize => {
                let control = MigrationControl {
                    success: true,
                    message: None,
                    statistics: stats.clone(),
                };
                set.control.send(encode(&control)).await?;

                let frame = recv_frame(set.control.as_mut(), ctx).await?;
                let ack = decode_control(&frame)
                    .map_err(|e| MigrationError::Protocol(format!("bad ack: {}", e)))?;
                if !ack.success {
                    return Err(MigrationError::Remote(
                        ack.message.unwrap_or_else(|| "sink rejected transfer".to_string()),
                    ));
                }
                SourceState::Cleanup
            }

            SourceState::Cleanup => {
                return Ok(SourceOutcome { live_used, stats });
            }
        };
    }
}

fn local_header(spec: &SourceSpec) -> MigrationHeader {
    let snapshots: Vec<String> = if spec.instance_only {
        Vec::new()
    } else {
        spec.backup.snapshots.iter().map(|s| s.name.clone()).collect()
    };

    MigrationHeader {
        fs: spec.pool.info().driver,
        criu: spec.live,
        rsync_features: vec!["xattrs".to_string(), "delete".to_string()],
        zfs_features: Vec::new(),
        snapshots,
        snapshot_config: serde_json::to_string(&spec.backup.snapshots).unwrap_or_default(),
        volume_size: 0,
        refresh: false,
    }
}
