use crate::api::error::ApiError;
use crate::api::types::{CreateInstanceRequest, InstancePost, InstanceStatePut};
use crate::api::{project_or_default, Notify};
use crate::db::queries as db;
use crate::db::tables::{INSTANCE_STATUS_RUNNING, INSTANCE_STATUS_STOPPED};
use crate::db::{ClusterDb, DbError};
use crate::ops::{Operation, OperationClass, OperationRegistry, OperationType};
use crate::relocate::{Dispatch, Relocator, STOP_TIMEOUT_SECS};
use crate::storage::PoolRegistry;
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, post, put, State};
use std::collections::HashMap;
use std::sync::Arc;

#[get("/1.0/instances?<project>&<member>")]
pub async fn list_instances(
    db: &State<Arc<ClusterDb>>,
    project: Option<String>,
    member: Option<String>,
) -> Result<Json<Value>, ApiError> {
    let instances = match member {
        Some(member) => db::instance::list_instances_on_member(db.pool(), &member).await?,
        None => db::instance::list_instances(db.pool(), project.as_deref()).await?,
    };
    Ok(Json(json!({ "instances": instances })))
}

#[get("/1.0/instances/<name>?<project>")]
pub async fn get_instance(
    db: &State<Arc<ClusterDb>>,
    name: &str,
    project: Option<String>,
) -> Result<Json<Value>, ApiError> {
    let project = project_or_default(project);
    let inst = db::instance::get_instance(db.pool(), &project, name)
        .await
        .map_err(|e| match e {
            DbError::NotFound => ApiError::not_found("Instance"),
            other => other.into(),
        })?;
    Ok(Json(json!(inst)))
}

/// Rename or one of the move flows; the relocation policy layer decides.
#[post("/1.0/instances/<name>?<project>&<target>", format = "json", data = "<body>")]
pub async fn post_instance(
    relocator: &State<Arc<Relocator>>,
    name: &str,
    project: Option<String>,
    target: Option<String>,
    notify: Notify,
    body: Json<InstancePost>,
) -> Result<(Status, Json<Value>), ApiError> {
    let project = project_or_default(project);
    let dispatch = relocator
        .handle_instance_post(&project, name, target, body.into_inner(), notify.0)
        .await?;
    match dispatch {
        Dispatch::Operation(op) => Ok((Status::Accepted, Json(op.render()))),
        Dispatch::Forwarded(value) => Ok((Status::Accepted, Json(value))),
    }
}

/// Instance creation is accepted only as a migration sink; the general create
/// path lives elsewhere in the daemon family.
#[post("/1.0/instances?<project>", format = "json", data = "<body>", rank = 2)]
pub async fn create_instance(
    relocator: &State<Arc<Relocator>>,
    project: Option<String>,
    notify: Notify,
    body: Json<CreateInstanceRequest>,
) -> Result<(Status, Json<Value>), ApiError> {
    let project = project_or_default(project);
    let op = relocator
        .receive_migration(project, body.into_inner(), notify.0)
        .await?;
    Ok((Status::Accepted, Json(op.render())))
}

#[delete("/1.0/instances/<name>?<project>")]
pub async fn delete_instance(
    db: &State<Arc<ClusterDb>>,
    pools: &State<Arc<PoolRegistry>>,
    ops: &State<Arc<OperationRegistry>>,
    name: &str,
    project: Option<String>,
) -> Result<(Status, Json<Value>), ApiError> {
    let project = project_or_default(project);
    let inst = db::instance::get_instance(db.pool(), &project, name)
        .await
        .map_err(|e| match e {
            DbError::NotFound => ApiError::not_found("Instance"),
            other => other.into(),
        })?;
    if inst.is_running() {
        return Err(ApiError::Conflict(
            "Instance must be stopped before deletion".to_string(),
        ));
    }
    let pool = pools
        .get_by_id(inst.pool_id)
        .ok_or_else(|| ApiError::Internal("Instance pool not configured here".to_string()))?;

    let mut resources = HashMap::new();
    resources.insert("instances".to_string(), vec![inst.name.clone()]);
    let op = Operation::new(
        &project,
        OperationClass::Task,
        OperationType::InstanceDelete,
        resources,
    );
    let db = (*db).clone();
    ops.start(
        op.clone(),
        Box::new(move |_ctx| {
            Box::pin(async move {
                pool.delete_instance(&inst).await?;
                db::instance::delete_instance(db.pool(), &inst.project, &inst.name).await?;
                Ok(())
            })
        }),
    );
    Ok((Status::Accepted, Json(op.render())))
}

/// Start/stop requests. The runtime acting on them is external; the recorded
/// state is what the move flows key off.
#[put("/1.0/instances/<name>/state?<project>", format = "json", data = "<body>")]
pub async fn put_instance_state(
    db: &State<Arc<ClusterDb>>,
    ops: &State<Arc<OperationRegistry>>,
    name: &str,
    project: Option<String>,
    body: Json<InstanceStatePut>,
) -> Result<(Status, Json<Value>), ApiError> {
    let project = project_or_default(project);
    let state = body.into_inner();
    let status = match state.action.as_str() {
        "start" => INSTANCE_STATUS_RUNNING,
        "stop" => INSTANCE_STATUS_STOPPED,
        other => {
            return Err(ApiError::BadRequest(format!(
                "Unsupported state action \"{}\"",
                other
            )))
        }
    };
    let inst = db::instance::get_instance(db.pool(), &project, name)
        .await
        .map_err(|e| match e {
            DbError::NotFound => ApiError::not_found("Instance"),
            other => other.into(),
        })?;

    let timeout = state.timeout.unwrap_or(STOP_TIMEOUT_SECS);
    let mut resources = HashMap::new();
    resources.insert("instances".to_string(), vec![inst.name.clone()]);
    let op = Operation::new(
        &project,
        OperationClass::Task,
        OperationType::InstanceState,
        resources,
    );
    let db = (*db).clone();
    ops.start(
        op.clone(),
        Box::new(move |_ctx| {
            Box::pin(async move {
                log::info!(
                    "Changing state of {}/{} to {} (timeout {}s)",
                    inst.project,
                    inst.name,
                    status,
                    timeout
                );
                db::instance::update_instance_status(db.pool(), inst.id, status).await?;
                Ok(())
            })
        }),
    );
    Ok((Status::Accepted, Json(op.render())))
}
