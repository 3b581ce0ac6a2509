use crate::db::DbError;
use crate::migration::MigrationError;
use crate::peer::PeerError;
use crate::storage::StorageError;
use rocket::http::Status;
use rocket::response::Responder;
use rocket::serde::json::{json, Json};
use thiserror::Error;

/// Error taxonomy of the REST surface. Sync endpoints map these onto status
/// codes; async flows record them as the operation's terminal message.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> Status {
        match self {
            ApiError::BadRequest(_) => Status::BadRequest,
            ApiError::Forbidden(_) => Status::Forbidden,
            ApiError::Conflict(_) => Status::Conflict,
            ApiError::NotFound(_) => Status::NotFound,
            ApiError::PreconditionFailed(_) => Status::PreconditionFailed,
            ApiError::Unavailable(_) => Status::ServiceUnavailable,
            ApiError::Internal(_) => Status::InternalServerError,
        }
    }

    pub fn not_found(what: &str) -> Self {
        ApiError::NotFound(format!("{} not found", what))
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => ApiError::NotFound("Not found".to_string()),
            DbError::Conflict(msg) => ApiError::Conflict(msg),
            DbError::Retry => {
                ApiError::Unavailable("Cluster database is busy, retry".to_string())
            }
            DbError::Fatal(e) => ApiError::Internal(format!("Database error: {}", e)),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => ApiError::NotFound("Volume not found".to_string()),
            StorageError::AlreadyExists(name) => {
                ApiError::Conflict(format!("Volume \"{}\" already exists", name))
            }
            StorageError::InvalidName(msg) => ApiError::BadRequest(msg),
            StorageError::SnapshotImmutable => ApiError::BadRequest(
                "Snapshots only allow changing description and expiry".to_string(),
            ),
            StorageError::Cancelled => ApiError::BadRequest("Operation cancelled".to_string()),
            StorageError::Database(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<PeerError> for ApiError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::Unavailable { addr, reason } => {
                ApiError::Unavailable(format!("Peer {} unavailable: {}", addr, reason))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<MigrationError> for ApiError {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::Storage(e) => e.into(),
            MigrationError::Database(e) => e.into(),
            MigrationError::Peer(e) => e.into(),
            MigrationError::LiveNotSupported => {
                ApiError::BadRequest("Live migration not supported by peer".to_string())
            }
            MigrationError::Cancelled => {
                ApiError::BadRequest("Migration cancelled".to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        let status = self.status();
        let body = Json(json!({
            "error": self.to_string(),
            "error_code": status.code,
        }));
        let mut response = body.respond_to(req)?;
        response.set_status(status);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_errors_map_to_taxonomy() {
        assert_eq!(ApiError::from(DbError::NotFound).status(), Status::NotFound);
        assert_eq!(
            ApiError::from(DbError::Conflict("name in use".into())).status(),
            Status::Conflict
        );
        assert_eq!(
            ApiError::from(DbError::Retry).status(),
            Status::ServiceUnavailable
        );
    }

    #[test]
    fn storage_errors_map_to_taxonomy() {
        assert_eq!(
            ApiError::from(StorageError::InvalidName("bad".into())).status(),
            Status::BadRequest
        );
        assert_eq!(
            ApiError::from(StorageError::SnapshotImmutable).status(),
            Status::BadRequest
        );
        assert_eq!(
            ApiError::from(StorageError::AlreadyExists("v".into())).status(),
            Status::Conflict
        );
    }

    #[test]
    fn peer_unavailable_maps_to_service_unavailable() {
        let err = PeerError::Unavailable {
            addr: "10.0.0.2:8443".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(ApiError::from(err).status(), Status::ServiceUnavailable);
    }
}
