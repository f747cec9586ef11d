pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::model::{ExecStatus, Execution, Task};

pub use memory::InMemoryDao;
pub use postgres::PostgresDao;

/// Persistence contract for tasks: the atomic preemption primitive plus the
/// lease-management operations the [`crate::preempter::Preempter`] drives.
#[async_trait]
pub trait TaskDao: Send + Sync {
    /// Atomically selects one due task and claims it for `owner` via a
    /// compare-and-swap on `utime`. Returns [`StorageError::NoTaskAvailable`]
    /// if nothing is due right now.
    async fn preempt(&self, owner: &str, lease_timeout_ms: i64) -> Result<Task, StorageError>;

    /// Heartbeats a held lease. Returns [`StorageError::TaskNotFound`] if the
    /// row no longer belongs to `owner` (lease was reclaimed by someone else).
    async fn update_utime(&self, id: i64, owner: &str) -> Result<(), StorageError>;

    async fn update_next_time(&self, id: i64, next: DateTime<Utc>) -> Result<(), StorageError>;

    /// Pauses scheduling for a task whose cron expression has no future fire.
    async fn stop(&self, id: i64) -> Result<(), StorageError>;

    /// Releases a held lease: flips back to waiting and clears the owner.
    async fn release(&self, id: i64, owner: &str) -> Result<(), StorageError>;

    async fn add(&self, task: &Task) -> Result<Task, StorageError>;

    async fn list(&self) -> Result<Vec<Task>, StorageError>;
}

/// Persistence contract for execution attempts.
#[async_trait]
pub trait ExecutionDao: Send + Sync {
    /// Inserts or overwrites the single execution row for `tid`, returning its
    /// stable execution id.
    async fn upsert(&self, tid: i64, status: ExecStatus, progress: i16) -> Result<i64, StorageError>;

    async fn update_progress(&self, eid: i64, progress: i16) -> Result<(), StorageError>;

    async fn update_status(&self, eid: i64, status: ExecStatus, progress: i16) -> Result<(), StorageError>;

    async fn get_last_execution(&self, tid: i64) -> Result<Execution, StorageError>;
}
