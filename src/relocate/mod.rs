pub mod devices;
pub mod placement;

use crate::api::error::ApiError;
use crate::api::types::{CreateInstanceRequest, InstancePost, InstanceSource, InstanceStatePut};
use crate::config::MemberConfig;
use crate::db::queries as db;
use crate::db::tables::{
    Instance, INSTANCE_STATUS_RUNNING, INSTANCE_STATUS_STOPPED, INSTANCE_TYPE_CONTAINER,
};
use crate::db::{ClusterDb, DbError};
use crate::migration::channel::{Channel, MemChannel, ServerChannel};
use crate::migration::sink::{run_sink, NullRestore, SinkSpec};
use crate::migration::source::{run_source, NullCheckpoint, SourceSpec, StopFn};
use crate::migration::{ChannelHub, ChannelSet, MigrationError, SessionSecrets};
use crate::ops::{Operation, OperationClass, OperationRegistry, OperationType, CHAN_CONTROL, CHAN_FILESYSTEM, CHAN_STATE};
use crate::peer::{PeerConnector, PeerError};
use crate::storage::volume::InstanceBackupConfig;
use crate::storage::{MigrateArgs, PoolRegistry, StoragePool};
use log::{info, warn};
use placement::PlacementScriptlet;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Stop timeout applied when a running instance is pre-stopped for a
/// stateless move.
pub const STOP_TIMEOUT_SECS: u64 = 30;

/// Prefix of temporary copy names; stable so crash recovery can spot stale
/// intermediate copies by name.
pub const TEMP_MOVE_PREFIX: &str = "move-";

/// Temporary name for the window in which source and copy both exist.
pub fn temp_move_name() -> String {
    format!("{}{}", TEMP_MOVE_PREFIX, Uuid::new_v4())
}

pub fn is_temp_move_name(name: &str) -> bool {
    name.strip_prefix(TEMP_MOVE_PREFIX)
        .map_or(false, |rest| Uuid::parse_str(rest).is_ok())
}

/// The sub-flow a parsed relocation request maps onto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Rename { new_name: String },
    PoolMove { pool: String },
    ProjectMove { project: String },
    ClusterMove { target: String },
    OfflineFastPath { target: String },
    Push { target_url: String },
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

/// Pure decision table: which flow a request runs, given the request body,
/// the URL `target` parameter and what is known about the owning member and
/// its pool.
pub fn decide_flow(
    req: &InstancePost,
    url_target: Option<&str>,
    source_online: bool,
    pool_remote: bool,
) -> Result<Flow, ApiError> {
    if !req.migration {
        let new_name = non_empty(req.name.as_ref()).ok_or_else(|| {
            ApiError::BadRequest("Rename requires a new instance name".to_string())
        })?;
        return Ok(Flow::Rename { new_name });
    }

    if let Some(pool) = non_empty(req.pool.as_ref()) {
        return Ok(Flow::PoolMove { pool });
    }
    if let Some(project) = non_empty(req.project.as_ref()) {
        return Ok(Flow::ProjectMove { project });
    }

    if let Some(target) = url_target.filter(|t| !t.is_empty()) {
        if source_online {
            return Ok(Flow::ClusterMove {
                target: target.to_string(),
            });
        }
        if pool_remote {
            return Ok(Flow::OfflineFastPath {
                target: target.to_string(),
            });
        }
        return Err(ApiError::Unavailable(
            "Source member is offline and the instance's pool is not remote-shared".to_string(),
        ));
    }

    if let Some(target_url) = non_empty(req.target.as_ref()) {
        return Ok(Flow::Push { target_url });
    }

    Err(ApiError::BadRequest(
        "Migration requested without a pool, project or target".to_string(),
    ))
}

/// What a relocation request resolves to: an operation on this member, or the
/// response of the member the request was proxied to.
pub enum Dispatch {
    Operation(Arc<Operation>),
    Forwarded(serde_json::Value),
}

/// Policy layer deciding and driving every relocation sub-flow.
pub struct Relocator {
    db:        Arc<ClusterDb>,
    pools:     Arc<PoolRegistry>,
    ops:       Arc<OperationRegistry>,
    peers:     Arc<dyn PeerConnector>,
    config:    Arc<MemberConfig>,
    placement: Option<Arc<dyn PlacementScriptlet>>,
}

impl Relocator {
    pub fn new(
        db: Arc<ClusterDb>,
        pools: Arc<PoolRegistry>,
        ops: Arc<OperationRegistry>,
        peers: Arc<dyn PeerConnector>,
        config: Arc<MemberConfig>,
        placement: Option<Arc<dyn PlacementScriptlet>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            pools,
            ops,
            peers,
            config,
            placement,
        })
    }

    fn pool_for(&self, inst: &Instance) -> Result<Arc<StoragePool>, ApiError> {
        self.pools.get_by_id(inst.pool_id).ok_or_else(|| {
            ApiError::Internal(format!(
                "Instance pool {} is not configured on this member",
                inst.pool_id
            ))
        })
    }

    /// Entry point behind `POST /1.0/instances/{name}`.
    pub async fn handle_instance_post(
        &self,
        project: &str,
        name: &str,
        url_target: Option<String>,
        body: InstancePost,
        notify: bool,
    ) -> Result<Dispatch, ApiError> {
        let inst = db::instance::get_instance(self.db.pool(), project, name)
            .await
            .map_err(|e| match e {
                DbError::NotFound => ApiError::not_found("Instance"),
                other => other.into(),
            })?;
        let pool = self.pool_for(&inst)?;

        let owner = db::member::get_node_by_name(self.db.pool(), &inst.location).await?;
        let owner_online =
            !owner.is_offline(self.config.offline_threshold(), chrono::Utc::now());

        let flow = decide_flow(&body, url_target.as_deref(), owner_online, pool.is_remote())?;
        let is_owner = inst.location == self.config.name;

        // Requests that must run on the owner are proxied there; with the
        // owner gone and an explicit target, the target takes over via the
        // remote-shared fast path.
        if !is_owner && !notify {
            if owner_online {
                let resp = self
                    .forward(&owner.address, project, name, url_target.as_deref(), &body)
                    .await?;
                return Ok(Dispatch::Forwarded(resp));
            }
            if let Flow::OfflineFastPath { target } = &flow {
                if *target != self.config.name {
                    let member = db::member::get_node_by_name(self.db.pool(), target).await?;
                    let resp = self
                        .forward(&member.address, project, name, url_target.as_deref(), &body)
                        .await?;
                    return Ok(Dispatch::Forwarded(resp));
                }
                // We are the requested target; fall through and run it here.
            } else {
                return Err(ApiError::Unavailable(format!(
                    "Member \"{}\" owning the instance is offline",
                    inst.location
                )));
            }
        }

        match flow {
            Flow::Rename { new_name } => self.rename(inst, pool, new_name).await,
            Flow::PoolMove { pool: target } => {
                self.pool_move(inst, pool, target, body).await
            }
            Flow::ProjectMove { project: target } => {
                self.project_move(inst, pool, target, body).await
            }
            Flow::ClusterMove { target } => self.cluster_move(inst, pool, target, body).await,
            Flow::OfflineFastPath { target } => {
                self.offline_fast_path(inst, pool, target).await
            }
            Flow::Push { target_url } => self.push_migration(inst, pool, target_url, body).await,
        }
    }

    async fn forward(
        &self,
        address: &str,
        project: &str,
        name: &str,
        url_target: Option<&str>,
        body: &InstancePost,
    ) -> Result<serde_json::Value, ApiError> {
        info!("Forwarding relocation of {}/{} to {}", project, name, address);
        let peer = self.peers.connect(address, true);
        let mut path = format!("/1.0/instances/{}?project={}", name, project);
        if let Some(target) = url_target {
            path.push_str(&format!("&target={}", target));
        }
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(peer.raw_query("POST", &path, value).await?)
    }

    fn instance_resources(name: &str) -> HashMap<String, Vec<String>> {
        let mut map = HashMap::new();
        map.insert("instances".to_string(), vec![name.to_string()]);
        map
    }

    /// Returns the already-running operation for a retried request, so a
    /// forwarded POST repeated before completion lands on the same id.
    fn existing_operation(&self, op_type: OperationType, name: &str) -> Option<Arc<Operation>> {
        self.ops.find_active(op_type, "instances", name)
    }

    // ---------------------------------------------------------------------
    // Rename in place
    // ---------------------------------------------------------------------

    async fn rename(
        &self,
        inst: Instance,
        pool: Arc<StoragePool>,
        new_name: String,
    ) -> Result<Dispatch, ApiError> {
        pool.validate_name(&new_name)?;
        if new_name == inst.name {
            return Err(ApiError::BadRequest(
                "New name equals the current name".to_string(),
            ));
        }
        if inst.is_running() {
            return Err(ApiError::Conflict(
                "Instance must be stopped to be renamed".to_string(),
            ));
        }
        match db::instance::get_instance(self.db.pool(), &inst.project, &new_name).await {
            Ok(_) => {
                return Err(ApiError::Conflict(format!(
                    "Instance name \"{}\" is already in use",
                    new_name
                )))
            }
            Err(DbError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(op) = self.existing_operation(OperationType::InstanceRename, &inst.name) {
            return Ok(Dispatch::Operation(op));
        }

        let op = Operation::new(
            &inst.project,
            OperationClass::Task,
            OperationType::InstanceRename,
            Self::instance_resources(&inst.name),
        );
        let db = self.db.clone();
        self.ops.start(
            op.clone(),
            Box::new(move |_ctx| {
                Box::pin(async move {
                    pool.rename_instance(&inst, &new_name).await?;
                    let result = db
                        .with_retry(|| {
                            db::instance::rename_instance(
                                db.pool(),
                                &inst.project,
                                &inst.name,
                                &new_name,
                                inst.volume_type(),
                            )
                        })
                        .await;
                    if let Err(e) = result {
                        // Put the volume back so disk and DB stay aligned.
                        let mut renamed = inst.clone();
                        renamed.name = new_name.clone();
                        let _ = pool.rename_instance(&renamed, &inst.name).await;
                        return Err(e.into());
                    }
                    info!("Renamed instance {}/{} to {}", inst.project, inst.name, new_name);
                    Ok(())
                })
            }),
        );
        Ok(Dispatch::Operation(op))
    }

    // ---------------------------------------------------------------------
    // Pool move (same member)
    // ---------------------------------------------------------------------

    async fn pool_move(
        &self,
        inst: Instance,
        src_pool: Arc<StoragePool>,
        target_pool: String,
        body: InstancePost,
    ) -> Result<Dispatch, ApiError> {
        let dst_pool = self
            .pools
            .get(&target_pool)
            .ok_or_else(|| ApiError::not_found("Storage pool"))?;
        if dst_pool.id == inst.pool_id {
            return Err(ApiError::BadRequest(
                "Instance is already on the requested pool".to_string(),
            ));
        }

        if let Some(op) = self.existing_operation(OperationType::InstancePoolMove, &inst.name) {
            return Ok(Dispatch::Operation(op));
        }

        let final_name = non_empty(body.name.as_ref()).unwrap_or_else(|| inst.name.clone());
        let via_temp = final_name == inst.name;
        let copy_name = if via_temp { temp_move_name() } else { final_name.clone() };

        let op = Operation::new(
            &inst.project,
            OperationClass::Task,
            OperationType::InstancePoolMove,
            Self::instance_resources(&inst.name),
        );
        let db = self.db.clone();
        let instance_only = body.instance_only;
        let target_pool_name = target_pool.clone();
        self.ops.start(
            op.clone(),
            Box::new(move |ctx| {
                Box::pin(async move {
                    let was_running = inst.is_running();
                    if was_running {
                        stop_instance(&db, &inst).await?;
                    }

                    let backup =
                        src_pool.generate_instance_backup_config(&inst, !instance_only).await?;
                    refuse_nested_snapshots(&backup)?;

                    let mut moved = (*inst.devices).clone();
                    devices::prepare_root_disk_for_move(
                        &mut moved,
                        &inst.expanded_devices,
                        Some(&target_pool_name),
                        None,
                    )
                    .map_err(ApiError::BadRequest)?;

                    copy_between_pools(
                        src_pool.clone(),
                        dst_pool.clone(),
                        inst.clone(),
                        inst.project.clone(),
                        copy_name.clone(),
                        backup.clone(),
                        instance_only,
                        ctx.clone(),
                    )
                    .await?;
                    dst_pool
                        .create_snapshot_rows(
                            &inst.project,
                            &copy_name,
                            inst.volume_type(),
                            &backup,
                            inst.node_id,
                        )
                        .await?;

                    db::instance::create_instance(
                        db.pool(),
                        &db::instance::NewInstance {
                            project: &inst.project,
                            name: &copy_name,
                            kind: &inst.kind,
                            architecture: &inst.architecture,
                            node_id: inst.node_id,
                            pool_id: dst_pool.id,
                            ephemeral: inst.ephemeral,
                            stateful: inst.stateful,
                            status: INSTANCE_STATUS_STOPPED,
                            local_config: &inst.local_config,
                            devices: &moved,
                            expanded_devices: &inst.expanded_devices,
                            profiles: &inst.profiles,
                        },
                    )
                    .await?;

                    // Source goes away, then the copy takes the final name.
                    src_pool.delete_instance(&inst).await?;
                    db::instance::delete_instance(db.pool(), &inst.project, &inst.name).await?;

                    if via_temp {
                        finish_rename_back(&db, &dst_pool, &inst, &copy_name, &final_name).await?;
                    }

                    if was_running {
                        start_instance(&db, &inst.project, &final_name).await?;
                    }
                    info!(
                        "Moved instance {}/{} to pool {}",
                        inst.project, final_name, target_pool_name
                    );
                    Ok(())
                })
            }),
        );
        Ok(Dispatch::Operation(op))
    }

    // ---------------------------------------------------------------------
    // Project move (same pool)
    // ---------------------------------------------------------------------

    async fn project_move(
        &self,
        inst: Instance,
        pool: Arc<StoragePool>,
        target_project: String,
        body: InstancePost,
    ) -> Result<Dispatch, ApiError> {
        if target_project == inst.project {
            return Err(ApiError::BadRequest(
                "Instance is already in the requested project".to_string(),
            ));
        }
        let project = db::project::get_project(self.db.pool(), &target_project)
            .await
            .map_err(|e| match e {
                DbError::NotFound => ApiError::not_found("Project"),
                other => other.into(),
            })?;

        // RBAC proper lives in the auth layer; project restrictions are
        // checked here.
        if project.restricted() && project.restricted_cluster_target() {
            return Err(ApiError::Forbidden(format!(
                "Project \"{}\" restricts receiving instances",
                target_project
            )));
        }

        let final_name = non_empty(body.name.as_ref()).unwrap_or_else(|| inst.name.clone());
        match db::instance::get_instance(self.db.pool(), &target_project, &final_name).await {
            Ok(_) => {
                return Err(ApiError::Conflict(format!(
                    "Instance \"{}\" already exists in project \"{}\"",
                    final_name, target_project
                )))
            }
            Err(DbError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        // Placement: the target project may confine instances to failover
        // groups this member is not part of.
        let mut target_member: Option<String> = None;
        if project.restricted_cluster_groups().is_some() {
            if inst.is_running() && !body.live {
                return Err(ApiError::BadRequest(
                    "Moving a running instance to a placed member requires live migration"
                        .to_string(),
                ));
            }
            let chosen = placement::choose_member(
                &self.db,
                &project,
                &inst,
                self.placement.as_deref(),
                self.config.offline_threshold(),
            )
            .await?;
            if chosen.name == inst.location {
                // Same member after all; cleared to suppress a spurious
                // "already on that member" failure downstream.
                target_member = None;
            } else if pool.is_remote() {
                target_member = Some(chosen.name);
            } else {
                return Err(ApiError::BadRequest(format!(
                    "Project \"{}\" places the instance on member \"{}\"; move it there explicitly first",
                    target_project, chosen.name
                )));
            }
        }

        if let Some(op) = self.existing_operation(OperationType::InstanceProjectMove, &inst.name)
        {
            return Ok(Dispatch::Operation(op));
        }

        let op = Operation::new(
            &inst.project,
            OperationClass::Task,
            OperationType::InstanceProjectMove,
            Self::instance_resources(&inst.name),
        );
        let db = self.db.clone();
        let peers = self.peers.clone();
        let instance_only = body.instance_only;
        self.ops.start(
            op.clone(),
            Box::new(move |ctx| {
                Box::pin(async move {
                    let was_running = inst.is_running();
                    if was_running {
                        stop_instance(&db, &inst).await?;
                    }

                    let backup =
                        pool.generate_instance_backup_config(&inst, !instance_only).await?;
                    refuse_nested_snapshots(&backup)?;

                    let mut moved = (*inst.devices).clone();
                    devices::prepare_root_disk_for_move(
                        &mut moved,
                        &inst.expanded_devices,
                        None,
                        None,
                    )
                    .map_err(ApiError::BadRequest)?;

                    copy_between_pools(
                        pool.clone(),
                        pool.clone(),
                        inst.clone(),
                        target_project.clone(),
                        final_name.clone(),
                        backup.clone(),
                        instance_only,
                        ctx.clone(),
                    )
                    .await?;
                    pool.create_snapshot_rows(
                        &target_project,
                        &final_name,
                        inst.volume_type(),
                        &backup,
                        inst.node_id,
                    )
                    .await?;

                    db::instance::create_instance(
                        db.pool(),
                        &db::instance::NewInstance {
                            project: &target_project,
                            name: &final_name,
                            kind: &inst.kind,
                            architecture: &inst.architecture,
                            node_id: inst.node_id,
                            pool_id: inst.pool_id,
                            ephemeral: inst.ephemeral,
                            stateful: inst.stateful,
                            status: INSTANCE_STATUS_STOPPED,
                            local_config: &inst.local_config,
                            devices: &moved,
                            expanded_devices: &inst.expanded_devices,
                            profiles: &inst.profiles,
                        },
                    )
                    .await?;

                    pool.delete_instance(&inst).await?;
                    db::instance::delete_instance(db.pool(), &inst.project, &inst.name).await?;

                    if let Some(member) = &target_member {
                        relink_to_member(&db, &peers, &pool, &target_project, &final_name, member)
                            .await?;
                    }

                    if was_running {
                        start_instance(&db, &target_project, &final_name).await?;
                    }
                    info!(
                        "Moved instance {}/{} to project {}",
                        inst.project, inst.name, target_project
                    );
                    Ok(())
                })
            }),
        );
        Ok(Dispatch::Operation(op))
    }

    // ---------------------------------------------------------------------
    // Cross-member move (source online)
    // ---------------------------------------------------------------------

    async fn cluster_move(
        &self,
        inst: Instance,
        pool: Arc<StoragePool>,
        target: String,
        body: InstancePost,
    ) -> Result<Dispatch, ApiError> {
        if target == inst.location {
            return Err(ApiError::BadRequest(
                "Instance is already located on the requested member".to_string(),
            ));
        }
        let target_member = db::member::get_node_by_name(self.db.pool(), &target)
            .await
            .map_err(|e| match e {
                DbError::NotFound => ApiError::not_found("Cluster member"),
                other => other.into(),
            })?;

        let backups =
            db::instance::get_instance_backups(self.db.pool(), &inst.project, &inst.name).await?;
        if !backups.is_empty() {
            return Err(ApiError::BadRequest(
                "Instances with backups cannot be moved between members".to_string(),
            ));
        }

        if let Some(op) = self.existing_operation(OperationType::InstanceMigrate, &inst.name) {
            return Ok(Dispatch::Operation(op));
        }

        if pool.is_remote() {
            return self.remote_shared_move(inst, pool, target_member).await;
        }

        // Full migration session: this member hosts the source, the target
        // pulls over three websockets.
        let live = body.live && inst.is_running() && inst.stateful;
        let secrets = SessionSecrets::new(live);
        let hub = ChannelHub::new(secrets.clone());

        let op = Operation::new(
            &inst.project,
            OperationClass::Websocket,
            OperationType::InstanceMigrate,
            Self::instance_resources(&inst.name),
        );
        op.update_metadata(secrets.metadata());
        {
            let hub = hub.clone();
            op.set_connect(Box::new(move |secret, stream| {
                let hub = hub.clone();
                Box::pin(async move {
                    hub.attach(&secret, Box::new(ServerChannel::new(stream))).await
                })
            }));
        }

        let db = self.db.clone();
        let peers = self.peers.clone();
        let op_id = op.id;
        let require_live = body.live;
        let instance_only = body.instance_only;
        let allow_inconsistent = body.allow_inconsistent;
        self.ops.start(
            op.clone(),
            Box::new(move |ctx| {
                Box::pin(async move {
                    let was_running = inst.is_running();
                    let backup =
                        pool.generate_instance_backup_config(&inst, !instance_only).await?;
                    refuse_nested_snapshots(&backup)?;

                    // The target decides whether to start the instance from
                    // this key once the move lands.
                    let mut power = HashMap::new();
                    power.insert(
                        "volatile.last_state.power".to_string(),
                        if was_running { "RUNNING" } else { "STOPPED" }.to_string(),
                    );
                    db::instance::create_instance_config(db.pool(), inst.id, &power).await?;

                    let op_url = format!(
                        "http://{}/1.0/operations/{}",
                        db.get_local_node_address(),
                        op_id
                    );
                    let peer = peers.connect(&target_member.address, true);
                    let create = CreateInstanceRequest {
                        name: inst.name.clone(),
                        kind: inst.kind.clone(),
                        architecture: inst.architecture.clone(),
                        ephemeral: inst.ephemeral,
                        stateful: inst.stateful,
                        config: (*inst.local_config).clone(),
                        devices: (*inst.devices).clone(),
                        profiles: (*inst.profiles).clone(),
                        pool: Some(pool.name.clone()),
                        instance_only,
                        source: InstanceSource {
                            kind: "migration".to_string(),
                            mode: "pull".to_string(),
                            operation: op_url,
                            websockets: secrets.websockets(),
                            live,
                            refresh: false,
                        },
                    };
                    let mut remote_op =
                        peer.create_instance(&inst.project, None, &create).await?;

                    let stop: Option<StopFn> = if was_running && !live {
                        let db = db.clone();
                        let stop_inst = inst.clone();
                        Some(Box::new(move || {
                            Box::pin(async move {
                                stop_instance(&db, &stop_inst).await?;
                                Ok(())
                            })
                        }))
                    } else {
                        None
                    };

                    let spec = SourceSpec {
                        pool: pool.clone(),
                        inst: inst.clone(),
                        backup,
                        live,
                        require_live,
                        instance_only,
                        allow_inconsistent,
                        was_running,
                        stop,
                        checkpoint: Box::new(NullCheckpoint),
                    };
                    run_source(hub, spec, ctx.clone()).await?;
                    remote_op.wait(&ctx).await?;

                    // The destination acked; this transaction is the point
                    // where the instance moves.
                    let project = inst.project.clone();
                    let name = inst.name.clone();
                    let pool_id = inst.pool_id;
                    let vol_type = inst.volume_type();
                    let target_name = target_member.name.clone();
                    db.with_retry(|| {
                        db::instance::update_instance_node(
                            db.pool(),
                            &project,
                            &name,
                            &name,
                            &target_name,
                            pool_id,
                            vol_type,
                        )
                    })
                    .await?;

                    // Source cleanup only after the linearization point.
                    pool.delete_instance_data(&inst).await?;

                    if was_running {
                        peer.update_instance_state(
                            &inst.project,
                            &inst.name,
                            &InstanceStatePut {
                                action: "start".to_string(),
                                stateful: live,
                                timeout: None,
                            },
                        )
                        .await?
                        .wait(&ctx)
                        .await?;
                    }

                    // The marker did its job; don't leave it on the moved row.
                    let id = db::instance::get_instance_id(db.pool(), &project, &name).await?;
                    db::instance::delete_instance_config_key(
                        db.pool(),
                        id,
                        "volatile.last_state.power",
                    )
                    .await?;

                    info!(
                        "Moved instance {}/{} to member {}",
                        inst.project, inst.name, target_member.name
                    );
                    Ok(())
                })
            }),
        );
        Ok(Dispatch::Operation(op))
    }

    /// Remote-shared pool, both members online: no session, no data movement.
    async fn remote_shared_move(
        &self,
        inst: Instance,
        pool: Arc<StoragePool>,
        target_member: crate::db::tables::ClusterMember,
    ) -> Result<Dispatch, ApiError> {
        let op = Operation::new(
            &inst.project,
            OperationClass::Task,
            OperationType::InstanceMigrate,
            Self::instance_resources(&inst.name),
        );
        let db = self.db.clone();
        let peers = self.peers.clone();
        self.ops.start(
            op.clone(),
            Box::new(move |ctx| {
                Box::pin(async move {
                    let was_running = inst.is_running();
                    if was_running {
                        stop_instance(&db, &inst).await?;
                    }

                    let project = inst.project.clone();
                    let name = inst.name.clone();
                    let pool_id = inst.pool_id;
                    let vol_type = inst.volume_type();
                    let target_name = target_member.name.clone();
                    db.with_retry(|| {
                        db::instance::update_instance_node(
                            db.pool(),
                            &project,
                            &name,
                            &name,
                            &target_name,
                            pool_id,
                            vol_type,
                        )
                    })
                    .await?;

                    // Target finalizes its mountpoints, source drops its own.
                    let peer = peers.connect(&target_member.address, true);
                    peer.raw_query(
                        "POST",
                        &format!(
                            "/internal/cluster/instance-moved/{}?project={}",
                            inst.name, inst.project
                        ),
                        serde_json::json!({"action": "create"}),
                    )
                    .await?;
                    pool.cleanup_instance_paths(&inst).await?;

                    if was_running {
                        peer.update_instance_state(
                            &inst.project,
                            &inst.name,
                            &InstanceStatePut {
                                action: "start".to_string(),
                                stateful: false,
                                timeout: None,
                            },
                        )
                        .await?
                        .wait(&ctx)
                        .await?;
                    }

                    info!(
                        "Relocated instance {}/{} to member {} (remote-shared)",
                        inst.project, inst.name, target_member.name
                    );
                    Ok(())
                })
            }),
        );
        Ok(Dispatch::Operation(op))
    }

    // ---------------------------------------------------------------------
    // Offline source, remote-shared pool: runs on the target member
    // ---------------------------------------------------------------------

    async fn offline_fast_path(
        &self,
        inst: Instance,
        pool: Arc<StoragePool>,
        target: String,
    ) -> Result<Dispatch, ApiError> {
        if target != self.config.name {
            return Err(ApiError::Internal(
                "Remote-shared fast path must execute on the target member".to_string(),
            ));
        }
        if !pool.is_remote() {
            return Err(ApiError::Unavailable(
                "Source member is offline and the instance's pool is not remote-shared"
                    .to_string(),
            ));
        }

        if let Some(op) = self.existing_operation(OperationType::InstanceMigrate, &inst.name) {
            return Ok(Dispatch::Operation(op));
        }

        let op = Operation::new(
            &inst.project,
            OperationClass::Task,
            OperationType::InstanceMigrate,
            Self::instance_resources(&inst.name),
        );
        let db = self.db.clone();
        let local_member = self.config.name.clone();
        self.ops.start(
            op.clone(),
            Box::new(move |_ctx| {
                Box::pin(async move {
                    let project = inst.project.clone();
                    let name = inst.name.clone();
                    let pool_id = inst.pool_id;
                    let vol_type = inst.volume_type();
                    db.with_retry(|| {
                        db::instance::update_instance_node(
                            db.pool(),
                            &project,
                            &name,
                            &name,
                            &local_member,
                            pool_id,
                            vol_type,
                        )
                    })
                    .await?;

                    let moved =
                        db::instance::get_instance(db.pool(), &inst.project, &inst.name).await?;
                    let backup = pool.generate_instance_backup_config(&moved, true).await?;
                    pool.import_instance(&moved, &backup).await?;

                    info!(
                        "Recovered instance {}/{} from offline member onto {}",
                        inst.project, inst.name, local_member
                    );
                    Ok(())
                })
            }),
        );
        Ok(Dispatch::Operation(op))
    }

    // ---------------------------------------------------------------------
    // Cross-server push
    // ---------------------------------------------------------------------

    async fn push_migration(
        &self,
        inst: Instance,
        pool: Arc<StoragePool>,
        target_url: String,
        body: InstancePost,
    ) -> Result<Dispatch, ApiError> {
        if let Some(op) = self.existing_operation(OperationType::InstanceMigrate, &inst.name) {
            return Ok(Dispatch::Operation(op));
        }

        let live = body.live && inst.is_running() && inst.stateful;
        let secrets = SessionSecrets::new(live);
        let hub = ChannelHub::new(secrets.clone());

        let op = Operation::new(
            &inst.project,
            OperationClass::Websocket,
            OperationType::InstanceMigrate,
            Self::instance_resources(&inst.name),
        );
        op.update_metadata(secrets.metadata());
        {
            let hub = hub.clone();
            op.set_connect(Box::new(move |secret, stream| {
                let hub = hub.clone();
                Box::pin(async move {
                    hub.attach(&secret, Box::new(ServerChannel::new(stream))).await
                })
            }));
        }

        let db = self.db.clone();
        let peers = self.peers.clone();
        let op_id = op.id;
        let require_live = body.live;
        let instance_only = body.instance_only;
        let allow_inconsistent = body.allow_inconsistent;
        let final_name = non_empty(body.name.as_ref()).unwrap_or_else(|| inst.name.clone());
        self.ops.start(
            op.clone(),
            Box::new(move |ctx| {
                Box::pin(async move {
                    let was_running = inst.is_running();
                    let backup =
                        pool.generate_instance_backup_config(&inst, !instance_only).await?;
                    refuse_nested_snapshots(&backup)?;

                    let op_url = format!(
                        "http://{}/1.0/operations/{}",
                        db.get_local_node_address(),
                        op_id
                    );
                    // A foreign server, not a member: no DB re-linkage ever.
                    let peer = peers.connect(&target_url, false);
                    let create = CreateInstanceRequest {
                        name: final_name.clone(),
                        kind: inst.kind.clone(),
                        architecture: inst.architecture.clone(),
                        ephemeral: inst.ephemeral,
                        stateful: inst.stateful,
                        config: (*inst.local_config).clone(),
                        devices: (*inst.devices).clone(),
                        profiles: (*inst.profiles).clone(),
                        pool: None,
                        instance_only,
                        source: InstanceSource {
                            kind: "migration".to_string(),
                            mode: "pull".to_string(),
                            operation: op_url,
                            websockets: secrets.websockets(),
                            live,
                            refresh: false,
                        },
                    };
                    let mut remote_op = peer.create_instance(&inst.project, None, &create).await?;

                    let stop: Option<StopFn> = if was_running && !live {
                        let db = db.clone();
                        let stop_inst = inst.clone();
                        Some(Box::new(move || {
                            Box::pin(async move {
                                stop_instance(&db, &stop_inst).await?;
                                Ok(())
                            })
                        }))
                    } else {
                        None
                    };

                    let spec = SourceSpec {
                        pool: pool.clone(),
                        inst: inst.clone(),
                        backup,
                        live,
                        require_live,
                        instance_only,
                        allow_inconsistent,
                        was_running,
                        stop,
                        checkpoint: Box::new(NullCheckpoint),
                    };
                    run_source(hub, spec, ctx.clone()).await?;
                    remote_op.wait(&ctx).await?;

                    // The instance now lives on the other server.
                    pool.delete_instance(&inst).await?;
                    db::instance::delete_instance(db.pool(), &inst.project, &inst.name).await?;

                    info!(
                        "Pushed instance {}/{} to {}",
                        inst.project, inst.name, target_url
                    );
                    Ok(())
                })
            }),
        );
        Ok(Dispatch::Operation(op))
    }

    // ---------------------------------------------------------------------
    // Sink: POST /1.0/instances with a migration source
    // ---------------------------------------------------------------------

    /// Handles an incoming migration create request on this member.
    pub async fn receive_migration(
        &self,
        project: String,
        body: CreateInstanceRequest,
        cluster_internal: bool,
    ) -> Result<Arc<Operation>, ApiError> {
        if body.source.kind != "migration" {
            return Err(ApiError::BadRequest(
                "Only migration sources are supported by this endpoint".to_string(),
            ));
        }
        if body.source.mode != "pull" {
            return Err(ApiError::BadRequest(
                "Only pull mode migration is supported".to_string(),
            ));
        }
        if body.source.operation.is_empty() {
            return Err(ApiError::BadRequest(
                "Migration source is missing the operation URL".to_string(),
            ));
        }

        let pool = match &body.pool {
            Some(name) => self
                .pools
                .get(name)
                .ok_or_else(|| ApiError::not_found("Storage pool"))?,
            None => self
                .pools
                .all()
                .first()
                .cloned()
                .ok_or_else(|| ApiError::Internal("No storage pool configured".to_string()))?,
        };

        let vol_type = if body.kind.is_empty() {
            INSTANCE_TYPE_CONTAINER.to_string()
        } else {
            body.kind.clone()
        };

        // A pull coming from another member of this cluster shares our store;
        // the notify header says so, and the source address is the fallback
        // signal when a proxy stripped it.
        let mut cluster_internal = cluster_internal;
        if !cluster_internal {
            if let Some(host) = url_host(&body.source.operation) {
                cluster_internal = db::member::get_node_by_address(self.db.pool(), &host)
                    .await
                    .is_ok();
            }
        }

        let op = Operation::new(
            &project,
            OperationClass::Task,
            OperationType::InstanceReceive,
            Self::instance_resources(&body.name),
        );
        let db = self.db.clone();
        let peers = self.peers.clone();
        self.ops.start(
            op.clone(),
            Box::new(move |ctx| {
                Box::pin(async move {
                    let peer = peers.connect(&body.source.operation, true);
                    let get_secret = |name: &str| -> Option<String> {
                        body.source.websockets.get(name).cloned()
                    };
                    let control_secret = get_secret(CHAN_CONTROL)
                        .ok_or_else(|| anyhow::anyhow!("missing control secret"))?;
                    let fs_secret = get_secret(CHAN_FILESYSTEM)
                        .ok_or_else(|| anyhow::anyhow!("missing filesystem secret"))?;
                    let state_secret = get_secret(CHAN_STATE);

                    let control = peer
                        .connect_operation_websocket(&body.source.operation, &control_secret)
                        .await?;
                    let filesystem = peer
                        .connect_operation_websocket(&body.source.operation, &fs_secret)
                        .await?;
                    let state = match &state_secret {
                        Some(secret) => Some(
                            peer.connect_operation_websocket(&body.source.operation, secret)
                                .await?,
                        ),
                        None => None,
                    };
                    let set = ChannelSet {
                        control,
                        filesystem,
                        state,
                    };

                    let node_id = db.get_node_id().await?;
                    let outcome = run_sink(
                        set,
                        SinkSpec {
                            pool: pool.clone(),
                            project: project.clone(),
                            name: body.name.clone(),
                            vol_type: vol_type.clone(),
                            live: body.source.live,
                            instance_only: body.instance_only,
                            cluster_internal,
                            restore: Box::new(NullRestore),
                        },
                        ctx,
                    )
                    .await?;

                    if !cluster_internal {
                        // Foreign source: this store has no rows yet.
                        let info = InstanceBackupConfig {
                            instance: crate::storage::volume::BackupInstanceInfo {
                                name: body.name.clone(),
                                project: project.clone(),
                                kind: vol_type.clone(),
                                architecture: body.architecture.clone(),
                                ephemeral: body.ephemeral,
                                stateful: body.stateful,
                                config: body.config.clone(),
                                devices: body.devices.clone(),
                                profiles: body.profiles.clone(),
                            },
                            volume: crate::storage::volume::BackupVolumeInfo {
                                name: body.name.clone(),
                                kind: vol_type.clone(),
                                content_type: "filesystem".to_string(),
                                config: Default::default(),
                            },
                            snapshots: outcome.snapshots.clone(),
                        };
                        pool.create_snapshot_rows(&project, &body.name, &vol_type, &info, node_id)
                            .await?;
                        db::instance::create_instance(
                            db.pool(),
                            &db::instance::NewInstance {
                                project: &project,
                                name: &body.name,
                                kind: &body.kind,
                                architecture: &body.architecture,
                                node_id,
                                pool_id: pool.id,
                                ephemeral: body.ephemeral,
                                stateful: body.stateful,
                                status: INSTANCE_STATUS_STOPPED,
                                local_config: &body.config,
                                devices: &body.devices,
                                expanded_devices: &body.devices,
                                profiles: &body.profiles,
                            },
                        )
                        .await?;
                    }
                    Ok(())
                })
            }),
        );
        Ok(op)
    }

    /// `POST /internal/cluster/instance-moved/{name}`: the new owner creates
    /// its mountpoints after a remote-shared move.
    pub async fn finalize_instance_moved(
        &self,
        project: &str,
        name: &str,
    ) -> Result<(), ApiError> {
        let inst = db::instance::get_instance(self.db.pool(), project, name)
            .await
            .map_err(|e| match e {
                DbError::NotFound => ApiError::not_found("Instance"),
                other => other.into(),
            })?;
        let owner_addr = db::instance::get_node_address_of_instance(
            self.db.pool(),
            project,
            name,
            self.db.local_member(),
        )
        .await?;
        if !owner_addr.is_empty() {
            return Err(ApiError::BadRequest(format!(
                "Instance {}/{} is not owned by this member",
                project, name
            )));
        }
        let pool = self.pool_for(&inst)?;
        let backup = pool.generate_instance_backup_config(&inst, true).await?;
        pool.import_instance(&inst, &backup).await?;
        Ok(())
    }
}

/// Cross-pool copy on this member, run through the same transfer code as a
/// cross-member migration, over an in-memory channel pair.
#[allow(clippy::too_many_arguments)]
async fn copy_between_pools(
    src_pool: Arc<StoragePool>,
    dst_pool: Arc<StoragePool>,
    inst: Instance,
    dst_project: String,
    dst_name: String,
    backup: InstanceBackupConfig,
    instance_only: bool,
    ctx: crate::ops::OpContext,
) -> Result<(), MigrationError> {
    let snapshots: Vec<String> = if instance_only {
        Vec::new()
    } else {
        backup.snapshots.iter().map(|s| s.name.clone()).collect()
    };
    let vol_type = inst.volume_type().to_string();

    let (mut tx, mut rx) = MemChannel::pair();
    let args = MigrateArgs {
        data: format!("{}/{}", dst_project, dst_name),
        info: Some(backup),
        live: false,
        instance_only,
    };
    let send_pool = src_pool.clone();
    let send_ctx = ctx.clone();
    let send_inst = inst.clone();
    let sender = tokio::spawn(async move {
        let result = send_pool
            .migrate_instance(&send_inst, &mut tx, &args, &send_ctx)
            .await;
        let _ = tx.close().await;
        result
    });

    dst_pool.prepare_receive(&dst_project, &vol_type, &dst_name).await?;
    dst_pool
        .receive_instance(&dst_project, &vol_type, &dst_name, &snapshots, &mut rx, &ctx)
        .await?;

    sender
        .await
        .map_err(|e| MigrationError::Protocol(e.to_string()))??;
    Ok(())
}

/// Renames the intermediate copy to its final name once the source is gone.
/// A failure here keeps the fully transferred copy and reports both names.
async fn finish_rename_back(
    db: &Arc<ClusterDb>,
    dst_pool: &Arc<StoragePool>,
    inst: &Instance,
    copy_name: &str,
    final_name: &str,
) -> Result<(), ApiError> {
    let mut copy = inst.clone();
    copy.name = copy_name.to_string();
    copy.pool_id = dst_pool.id;

    let disk = dst_pool.rename_instance(&copy, final_name).await;
    let rows = match &disk {
        Ok(()) => {
            db.with_retry(|| {
                db::instance::rename_instance(
                    db.pool(),
                    &inst.project,
                    copy_name,
                    final_name,
                    inst.volume_type(),
                )
            })
            .await
        }
        Err(_) => Ok(()),
    };

    if disk.is_err() || rows.is_err() {
        return Err(ApiError::Internal(format!(
            "Instance copied as \"{}\" but renaming it to \"{}\" failed; the copy was kept",
            copy_name, final_name
        )));
    }
    Ok(())
}

/// Marks the instance stopped. The runtime doing the actual shutdown is
/// external; the move flows only depend on the recorded state.
async fn stop_instance(db: &Arc<ClusterDb>, inst: &Instance) -> Result<(), DbError> {
    info!(
        "Stopping instance {}/{} before move (timeout {}s)",
        inst.project, inst.name, STOP_TIMEOUT_SECS
    );
    db::instance::update_instance_status(db.pool(), inst.id, INSTANCE_STATUS_STOPPED).await
}

async fn start_instance(db: &Arc<ClusterDb>, project: &str, name: &str) -> Result<(), DbError> {
    let inst = db::instance::get_instance(db.pool(), project, name).await?;
    db::instance::update_instance_status(db.pool(), inst.id, INSTANCE_STATUS_RUNNING).await
}

/// Re-points a freshly copied instance at another member; remote-shared pools
/// only, since no data moves.
async fn relink_to_member(
    db: &Arc<ClusterDb>,
    peers: &Arc<dyn PeerConnector>,
    pool: &Arc<StoragePool>,
    project: &str,
    name: &str,
    member: &str,
) -> Result<(), ApiError> {
    let inst = db::instance::get_instance(db.pool(), project, name).await?;
    db.with_retry(|| {
        db::instance::update_instance_node(
            db.pool(),
            project,
            name,
            name,
            member,
            inst.pool_id,
            inst.volume_type(),
        )
    })
    .await?;

    let target = db::member::get_node_by_name(db.pool(), member).await?;
    let peer = peers.connect(&target.address, true);
    match peer
        .raw_query(
            "POST",
            &format!("/internal/cluster/instance-moved/{}?project={}", name, project),
            serde_json::json!({"action": "create"}),
        )
        .await
    {
        Ok(_) => {}
        Err(PeerError::Unavailable { .. }) => {
            warn!(
                "Member {} unreachable for mountpoint finalization of {}/{}",
                member, project, name
            );
        }
        Err(e) => return Err(e.into()),
    }
    pool.cleanup_instance_paths(&inst).await?;
    Ok(())
}

/// Host part of an operation URL, in the `host:port` form member addresses
/// are registered with.
fn url_host(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host = rest.split('/').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Snapshot-of-snapshot copies are refused across every move flow.
fn refuse_nested_snapshots(backup: &InstanceBackupConfig) -> Result<(), ApiError> {
    for snap in &backup.snapshots {
        if snap.name.contains('/') {
            return Err(ApiError::BadRequest(format!(
                "Refusing to copy snapshot of snapshot \"{}\"",
                snap.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(migration: bool) -> InstancePost {
        InstancePost {
            migration,
            ..Default::default()
        }
    }

    #[test]
    fn rename_flow_requires_a_name() {
        let mut req = post(false);
        assert!(decide_flow(&req, None, true, false).is_err());

        req.name = Some("web02".to_string());
        assert_eq!(
            decide_flow(&req, None, true, false).unwrap(),
            Flow::Rename {
                new_name: "web02".to_string()
            }
        );
    }

    #[test]
    fn pool_takes_precedence_over_project() {
        let mut req = post(true);
        req.pool = Some("fast".to_string());
        req.project = Some("other".to_string());
        assert_eq!(
            decide_flow(&req, None, true, false).unwrap(),
            Flow::PoolMove {
                pool: "fast".to_string()
            }
        );
    }

    #[test]
    fn member_target_with_online_source_is_a_cluster_move() {
        let req = post(true);
        assert_eq!(
            decide_flow(&req, Some("node-b"), true, false).unwrap(),
            Flow::ClusterMove {
                target: "node-b".to_string()
            }
        );
    }

    #[test]
    fn offline_source_needs_a_remote_pool() {
        let req = post(true);
        assert_eq!(
            decide_flow(&req, Some("node-b"), false, true).unwrap(),
            Flow::OfflineFastPath {
                target: "node-b".to_string()
            }
        );
        let err = decide_flow(&req, Some("node-b"), false, false).unwrap_err();
        assert!(matches!(err, ApiError::Unavailable(_)));
    }

    #[test]
    fn push_target_without_member_target() {
        let mut req = post(true);
        req.target = Some("https://other-server:8443".to_string());
        assert_eq!(
            decide_flow(&req, None, true, false).unwrap(),
            Flow::Push {
                target_url: "https://other-server:8443".to_string()
            }
        );
    }

    #[test]
    fn bare_migration_is_rejected() {
        let req = post(true);
        assert!(decide_flow(&req, None, true, false).is_err());
    }

    #[test]
    fn url_host_extracts_member_addresses() {
        assert_eq!(
            url_host("http://10.0.0.2:8443/1.0/operations/abc").as_deref(),
            Some("10.0.0.2:8443")
        );
        assert_eq!(url_host("10.0.0.2:8443/1.0/operations/abc").as_deref(), Some("10.0.0.2:8443"));
        assert_eq!(url_host("http:///nope"), None);
    }

    #[test]
    fn temp_names_are_recognizable() {
        let name = temp_move_name();
        assert!(name.starts_with(TEMP_MOVE_PREFIX));
        assert!(is_temp_move_name(&name));
        assert!(!is_temp_move_name("move-notauuid"));
        assert!(!is_temp_move_name("web01"));
    }
}
