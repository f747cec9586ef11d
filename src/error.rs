use thiserror::Error;

/// Errors surfaced by the storage layer (DAO implementations).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no task is currently due")]
    NoTaskAvailable,

    #[error("task {0} not found, or no longer owned by this worker")]
    TaskNotFound(i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid cron expression {0:?}: {1}")]
    InvalidCron(String, cron::error::Error),
}

/// Errors surfaced while acquiring or renewing a lease.
#[derive(Debug, Error)]
pub enum PreemptError {
    #[error("no task available")]
    NoTaskAvailable,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors surfaced by an executor implementation.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unknown executor: {0}")]
    UnknownExecutor(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("invalid executor configuration: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("transport error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),
}
