use thiserror::Error;

/// Maximum number of times a transaction hitting a serialization conflict is
/// re-run before the conflict is surfaced to the caller.
pub const MAX_TX_RETRIES: u32 = 5;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Not found")]
    NotFound,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization conflict, retry the transaction")]
    Retry,

    #[error("Database error: {0}")]
    Fatal(sqlx::Error),
}

impl From<sqlx::Error> for DbError {
    /// Classifies an sqlx error into the facade taxonomy.
    ///
    /// MySQL reports deadlocks as 1213 and lock wait timeouts as 1205, both
    /// of which the caller must retry. Duplicate keys (1062) are conflicts.
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DbError::NotFound,
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some("1213") | Some("1205") | Some("40001") => DbError::Retry,
                Some("1062") | Some("23000") => {
                    DbError::Conflict(db_err.message().to_string())
                }
                _ => DbError::Fatal(err),
            },
            _ => DbError::Fatal(err),
        }
    }
}

impl DbError {
    pub fn is_retry(&self) -> bool {
        matches!(self, DbError::Retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = DbError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, DbError::NotFound));
    }

    #[test]
    fn non_database_errors_are_fatal() {
        let err = DbError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, DbError::Fatal(_)));
        assert!(!err.is_retry());
    }

    #[test]
    fn only_retry_reports_retryable() {
        assert!(DbError::Retry.is_retry());
        assert!(!DbError::NotFound.is_retry());
        assert!(!DbError::Conflict("name in use".to_string()).is_retry());
    }
}
