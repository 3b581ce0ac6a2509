use crate::api::error::ApiError;
use crate::api::project_or_default;
use crate::api::types::InstanceMovedPost;
use crate::relocate::Relocator;
use rocket::serde::json::{json, Json, Value};
use rocket::{post, State};
use std::sync::Arc;

/// Member-to-member notification finalizing mountpoint creation on the new
/// owner after a remote-shared move.
#[post(
    "/internal/cluster/instance-moved/<name>?<project>",
    format = "json",
    data = "<body>"
)]
pub async fn instance_moved(
    relocator: &State<Arc<Relocator>>,
    name: &str,
    project: Option<String>,
    body: Json<InstanceMovedPost>,
) -> Result<Json<Value>, ApiError> {
    if body.action != "create" {
        return Err(ApiError::BadRequest(format!(
            "Unsupported action \"{}\"",
            body.action
        )));
    }
    let project = project_or_default(project);
    relocator.finalize_instance_moved(&project, name).await?;
    Ok(Json(json!({"status": "ok"})))
}
