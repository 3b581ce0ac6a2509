pub mod drivers;
pub mod pool;
pub mod stream;
pub mod volume;

pub use pool::{MigrateArgs, PoolRegistry, StoragePool};

use crate::db::DbError;
use crate::migration::channel::ChannelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Volume not found")]
    NotFound,

    #[error("Volume already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Snapshots only allow changing description and expiry")]
    SnapshotImmutable,

    #[error("Storage driver error: {0}")]
    Driver(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transfer channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Database(#[from] DbError),
}
