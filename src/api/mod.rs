pub mod error;
pub mod instances;
pub mod internal;
pub mod operations;
pub mod types;
pub mod volumes;

use rocket::request::{FromRequest, Outcome, Request};
use rocket::routes;

/// Marks a request as internal cluster traffic: a member already acting on a
/// forwarded relocation. Such requests are never forwarded again.
pub struct Notify(pub bool);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Notify {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let notify = req
            .headers()
            .get_one(crate::peer::client::NOTIFY_HEADER)
            .is_some();
        Outcome::Success(Notify(notify))
    }
}

/// ETag carried by `If-Match`, for conditional snapshot updates.
pub struct IfMatch(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for IfMatch {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let etag = req
            .headers()
            .get_one("If-Match")
            .map(|raw| raw.trim_matches('"').to_string());
        Outcome::Success(IfMatch(etag))
    }
}

pub fn project_or_default(project: Option<String>) -> String {
    match project {
        Some(p) if !p.is_empty() => p,
        _ => "default".to_string(),
    }
}

pub fn routes() -> Vec<rocket::Route> {
    routes![
        // instances
        instances::list_instances,
        instances::get_instance,
        instances::post_instance,
        instances::create_instance,
        instances::delete_instance,
        instances::put_instance_state,
        // operations
        operations::list_operations,
        operations::get_operation,
        operations::cancel_operation,
        operations::operation_websocket,
        // custom volume snapshots
        volumes::create_snapshot,
        volumes::list_snapshots,
        volumes::get_snapshot,
        volumes::put_snapshot,
        volumes::patch_snapshot,
        volumes::rename_snapshot,
        volumes::delete_snapshot,
    ]
}

pub fn internal_routes() -> Vec<rocket::Route> {
    routes![internal::instance_moved]
}
