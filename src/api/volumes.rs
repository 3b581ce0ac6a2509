use crate::api::error::ApiError;
use crate::api::types::{VolumeSnapshotPost, VolumeSnapshotPut, VolumeSnapshotRename};
use crate::api::{project_or_default, IfMatch};
use crate::db::queries as db;
use crate::db::tables::{join_snapshot_name, StorageVolume, VOLUME_TYPE_CUSTOM};
use crate::db::{ClusterDb, DbError};
use crate::ops::{Operation, OperationClass, OperationRegistry, OperationType};
use crate::scheduler::{dedupe_name, parse_expiry, render_pattern};
use crate::storage::{PoolRegistry, StoragePool};
use chrono::{DateTime, Utc};
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, patch, post, put, State};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_PATTERN: &str = "snap%d";

fn snapshot_resources(pool: &str, full_name: &str) -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    map.insert(
        "storage_volumes".to_string(),
        vec![format!("{}/{}", pool, full_name)],
    );
    map
}

/// Weak validator over the mutable snapshot fields.
fn snapshot_etag(description: &str, expiry: Option<DateTime<Utc>>) -> String {
    let canon = json!([description, expiry]).to_string();
    hex::encode(Sha256::digest(canon.as_bytes()))
}

fn render_snapshot(vol: &StorageVolume) -> Value {
    let name = vol
        .split_snapshot_name()
        .map(|(_, snap)| snap)
        .unwrap_or(&vol.name);
    json!({
        "name": name,
        "description": vol.description,
        "expires_at": vol.expiry,
        "config": vol.config,
        "content_type": vol.content_type,
        "created_at": vol.created_at,
        "etag": snapshot_etag(&vol.description, vol.expiry),
    })
}

async fn lookup_pool(
    pools: &PoolRegistry,
    name: &str,
) -> Result<Arc<StoragePool>, ApiError> {
    pools
        .get(name)
        .ok_or_else(|| ApiError::not_found("Storage pool"))
}

async fn lookup_volume(
    db: &ClusterDb,
    pool: &StoragePool,
    project: &str,
    name: &str,
) -> Result<StorageVolume, ApiError> {
    db::volume::get_storage_pool_volume(db.pool(), pool.id, project, VOLUME_TYPE_CUSTOM, name)
        .await
        .map_err(|e| match e {
            DbError::NotFound => ApiError::not_found("Volume"),
            other => other.into(),
        })
}

/// Creates a snapshot; with no name given the `snapshots.pattern` of the
/// volume decides, falling back to `snapN`.
#[post(
    "/1.0/storage-pools/<pool>/volumes/custom/<volume>/snapshots?<project>",
    format = "json",
    data = "<body>"
)]
pub async fn create_snapshot(
    cluster_db: &State<Arc<ClusterDb>>,
    pools: &State<Arc<PoolRegistry>>,
    ops: &State<Arc<OperationRegistry>>,
    pool: &str,
    volume: &str,
    project: Option<String>,
    body: Json<VolumeSnapshotPost>,
) -> Result<(Status, Json<Value>), ApiError> {
    let project = project_or_default(project);
    let pool = lookup_pool(pools, pool).await?;
    let body = body.into_inner();

    let proj = db::project::get_project(cluster_db.pool(), &project).await?;
    if proj.restricted_snapshots() {
        return Err(ApiError::Forbidden(format!(
            "Project \"{}\" restricts snapshot creation",
            project
        )));
    }

    let vol = lookup_volume(cluster_db, &pool, &project, volume).await?;

    let now = Utc::now();
    let snap_name = match body.name {
        Some(name) if !name.is_empty() => {
            pool.validate_name(&name)?;
            name
        }
        _ => {
            let pattern = vol
                .config
                .get("snapshots.pattern")
                .map(String::as_str)
                .unwrap_or(DEFAULT_PATTERN);
            if pattern.contains("%d") {
                let index = db::volume::get_next_storage_volume_snapshot_index(
                    cluster_db.pool(),
                    pool.id,
                    &vol.name,
                    VOLUME_TYPE_CUSTOM,
                    pattern,
                )
                .await?;
                pattern.replace("%d", &index.to_string())
            } else {
                let rendered = render_pattern(pattern, now);
                let existing = db::volume::get_local_storage_pool_volume_snapshots_with_type(
                    cluster_db.pool(),
                    &project,
                    &vol.name,
                    VOLUME_TYPE_CUSTOM,
                    pool.id,
                )
                .await?;
                dedupe_name(&rendered, &existing)
            }
        }
    };

    let expiry = match body.expires_at {
        Some(at) => Some(at),
        None => {
            let expr = vol
                .config
                .get("snapshots.expiry")
                .map(String::as_str)
                .unwrap_or("");
            parse_expiry(expr, now).map_err(|e| {
                ApiError::BadRequest(format!("Invalid snapshots.expiry \"{}\": {}", expr, e))
            })?
        }
    };

    let full_name = join_snapshot_name(&vol.name, &snap_name);
    let op = Operation::new(
        &project,
        OperationClass::Task,
        OperationType::VolumeSnapshotCreate,
        snapshot_resources(&pool.name, &full_name),
    );
    let parent = vol.name.clone();
    let pool_arc = pool.clone();
    let project_owned = project.clone();
    ops.start(
        op.clone(),
        Box::new(move |_ctx| {
            Box::pin(async move {
                pool_arc
                    .create_custom_volume_snapshot(
                        &project_owned,
                        &parent,
                        &snap_name,
                        "",
                        expiry,
                    )
                    .await?;
                Ok(())
            })
        }),
    );
    Ok((Status::Accepted, Json(op.render())))
}

#[get("/1.0/storage-pools/<pool>/volumes/custom/<volume>/snapshots?<project>")]
pub async fn list_snapshots(
    cluster_db: &State<Arc<ClusterDb>>,
    pools: &State<Arc<PoolRegistry>>,
    pool: &str,
    volume: &str,
    project: Option<String>,
) -> Result<Json<Value>, ApiError> {
    let project = project_or_default(project);
    let pool = lookup_pool(pools, pool).await?;
    lookup_volume(cluster_db, &pool, &project, volume).await?;

    let snapshots = db::volume::get_local_storage_pool_volume_snapshots_with_type(
        cluster_db.pool(),
        &project,
        volume,
        VOLUME_TYPE_CUSTOM,
        pool.id,
    )
    .await?;
    let rendered: Vec<Value> = snapshots.iter().map(render_snapshot).collect();
    Ok(Json(json!({ "snapshots": rendered })))
}

#[get("/1.0/storage-pools/<pool>/volumes/custom/<volume>/snapshots/<snapshot>?<project>")]
pub async fn get_snapshot(
    cluster_db: &State<Arc<ClusterDb>>,
    pools: &State<Arc<PoolRegistry>>,
    pool: &str,
    volume: &str,
    snapshot: &str,
    project: Option<String>,
) -> Result<Json<Value>, ApiError> {
    let project = project_or_default(project);
    let pool = lookup_pool(pools, pool).await?;
    let full_name = join_snapshot_name(volume, snapshot);
    let vol = lookup_volume(cluster_db, &pool, &project, &full_name).await?;
    Ok(Json(render_snapshot(&vol)))
}

/// Full replacement of the mutable fields; honors `If-Match`.
#[put(
    "/1.0/storage-pools/<pool>/volumes/custom/<volume>/snapshots/<snapshot>?<project>",
    format = "json",
    data = "<body>"
)]
pub async fn put_snapshot(
    cluster_db: &State<Arc<ClusterDb>>,
    pools: &State<Arc<PoolRegistry>>,
    pool: &str,
    volume: &str,
    snapshot: &str,
    project: Option<String>,
    if_match: IfMatch,
    body: Json<VolumeSnapshotPut>,
) -> Result<Json<Value>, ApiError> {
    update_snapshot(
        cluster_db, pools, pool, volume, snapshot, project, if_match, body, false,
    )
    .await
}

/// Partial update of the mutable fields; honors `If-Match`.
#[patch(
    "/1.0/storage-pools/<pool>/volumes/custom/<volume>/snapshots/<snapshot>?<project>",
    format = "json",
    data = "<body>"
)]
pub async fn patch_snapshot(
    cluster_db: &State<Arc<ClusterDb>>,
    pools: &State<Arc<PoolRegistry>>,
    pool: &str,
    volume: &str,
    snapshot: &str,
    project: Option<String>,
    if_match: IfMatch,
    body: Json<VolumeSnapshotPut>,
) -> Result<Json<Value>, ApiError> {
    update_snapshot(
        cluster_db, pools, pool, volume, snapshot, project, if_match, body, true,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn update_snapshot(
    cluster_db: &State<Arc<ClusterDb>>,
    pools: &State<Arc<PoolRegistry>>,
    pool: &str,
    volume: &str,
    snapshot: &str,
    project: Option<String>,
    if_match: IfMatch,
    body: Json<VolumeSnapshotPut>,
    partial: bool,
) -> Result<Json<Value>, ApiError> {
    let project = project_or_default(project);
    let pool = lookup_pool(pools, pool).await?;
    let full_name = join_snapshot_name(volume, snapshot);
    let vol = lookup_volume(cluster_db, &pool, &project, &full_name).await?;

    if let Some(expected) = if_match.0 {
        let current = snapshot_etag(&vol.description, vol.expiry);
        if expected != current {
            return Err(ApiError::PreconditionFailed(
                "ETag does not match the current snapshot".to_string(),
            ));
        }
    }

    let body = body.into_inner();
    let (description, expiry) = if partial {
        (
            body.description.unwrap_or_else(|| vol.description.clone()),
            body.expires_at.or(vol.expiry),
        )
    } else {
        (body.description.unwrap_or_default(), body.expires_at)
    };

    pool.update_custom_volume_snapshot(
        &project,
        &full_name,
        &description,
        body.config.as_ref(),
        expiry,
    )
    .await?;

    let updated = lookup_volume(cluster_db, &pool, &project, &full_name).await?;
    Ok(Json(render_snapshot(&updated)))
}

#[post(
    "/1.0/storage-pools/<pool>/volumes/custom/<volume>/snapshots/<snapshot>?<project>",
    format = "json",
    data = "<body>"
)]
pub async fn rename_snapshot(
    cluster_db: &State<Arc<ClusterDb>>,
    pools: &State<Arc<PoolRegistry>>,
    ops: &State<Arc<OperationRegistry>>,
    pool: &str,
    volume: &str,
    snapshot: &str,
    project: Option<String>,
    body: Json<VolumeSnapshotRename>,
) -> Result<(Status, Json<Value>), ApiError> {
    let project = project_or_default(project);
    let pool = lookup_pool(pools, pool).await?;
    let full_name = join_snapshot_name(volume, snapshot);
    lookup_volume(cluster_db, &pool, &project, &full_name).await?;

    let new_name = body.into_inner().name;
    pool.validate_name(&new_name)?;

    let op = Operation::new(
        &project,
        OperationClass::Task,
        OperationType::VolumeSnapshotRename,
        snapshot_resources(&pool.name, &full_name),
    );
    let pool_arc = pool.clone();
    let project_owned = project.clone();
    ops.start(
        op.clone(),
        Box::new(move |_ctx| {
            Box::pin(async move {
                pool_arc
                    .rename_custom_volume_snapshot(&project_owned, &full_name, &new_name)
                    .await?;
                Ok(())
            })
        }),
    );
    Ok((Status::Accepted, Json(op.render())))
}

#[delete("/1.0/storage-pools/<pool>/volumes/custom/<volume>/snapshots/<snapshot>?<project>")]
pub async fn delete_snapshot(
    cluster_db: &State<Arc<ClusterDb>>,
    pools: &State<Arc<PoolRegistry>>,
    ops: &State<Arc<OperationRegistry>>,
    pool: &str,
    volume: &str,
    snapshot: &str,
    project: Option<String>,
) -> Result<(Status, Json<Value>), ApiError> {
    let project = project_or_default(project);
    let pool = lookup_pool(pools, pool).await?;
    let full_name = join_snapshot_name(volume, snapshot);
    lookup_volume(cluster_db, &pool, &project, &full_name).await?;

    let op = Operation::new(
        &project,
        OperationClass::Task,
        OperationType::VolumeSnapshotDelete,
        snapshot_resources(&pool.name, &full_name),
    );
    let pool_arc = pool.clone();
    let project_owned = project.clone();
    ops.start(
        op.clone(),
        Box::new(move |_ctx| {
            Box::pin(async move {
                pool_arc
                    .delete_custom_volume_snapshot(&project_owned, &full_name)
                    .await?;
                Ok(())
            })
        }),
    );
    Ok((Status::Accepted, Json(op.render())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_tracks_mutable_fields_only() {
        let a = snapshot_etag("nightly", None);
        let b = snapshot_etag("nightly", None);
        assert_eq!(a, b);

        let with_expiry = snapshot_etag("nightly", Some(Utc::now()));
        assert_ne!(a, with_expiry);
        assert_ne!(a, snapshot_etag("weekly", None));
    }
}
