use crate::api::error::ApiError;
use crate::ops::OperationRegistry;
use rocket::serde::json::{Json, Value};
use rocket::{delete, get, State};
use std::sync::Arc;
use uuid::Uuid;

fn parse_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id)
        .map_err(|_| ApiError::BadRequest(format!("\"{}\" is not an operation id", id)))
}

#[get("/1.0/operations")]
pub async fn list_operations(ops: &State<Arc<OperationRegistry>>) -> Json<Value> {
    let rendered: Vec<Value> = ops.all().iter().map(|op| op.render()).collect();
    Json(serde_json::json!({ "operations": rendered }))
}

#[get("/1.0/operations/<id>", rank = 2)]
pub async fn get_operation(
    ops: &State<Arc<OperationRegistry>>,
    id: &str,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(id)?;
    let op = ops.get(&id).ok_or_else(|| ApiError::not_found("Operation"))?;
    Ok(Json(op.render()))
}

#[delete("/1.0/operations/<id>")]
pub async fn cancel_operation(
    ops: &State<Arc<OperationRegistry>>,
    id: &str,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(id)?;
    let op = ops
        .cancel(&id)
        .ok_or_else(|| ApiError::not_found("Operation"))?;
    Ok(Json(op.render()))
}

/// Attaches one of the three migration websockets to a waiting operation.
/// The channel stays open for as long as the session uses the socket.
#[get("/1.0/operations/<id>/websocket?<secret>")]
pub fn operation_websocket(
    ops: &State<Arc<OperationRegistry>>,
    id: &str,
    secret: String,
    ws: rocket_ws::WebSocket,
) -> Result<rocket_ws::Channel<'static>, ApiError> {
    let id = parse_id(id)?;
    let op = ops.get(&id).ok_or_else(|| ApiError::not_found("Operation"))?;

    Ok(ws.channel(move |stream| {
        Box::pin(async move {
            match op.connect(secret, stream) {
                Ok(parked) => {
                    if let Err(err) = parked.await {
                        log::debug!("Migration websocket detached: {}", err);
                    }
                }
                Err(err) => {
                    log::warn!("Rejected websocket for operation {}: {}", op.id, err);
                }
            }
            Ok(())
        })
    }))
}
