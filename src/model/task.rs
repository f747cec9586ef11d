use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::StorageError;

/// Scheduling status of a [`Task`]. Distinct from [`crate::model::execution::ExecStatus`],
/// which tracks an individual attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Running,
    Paused,
}

/// A persistent schedulable unit bound to a cron expression and an executor.
#[derive(Debug, Clone, TypedBuilder, sqlx::FromRow, Serialize, Deserialize)]
pub struct Task {
    #[builder(default)]
    pub id: i64,
    pub name: String,
    /// Registry key selecting which [`crate::executor::Executor`] runs this task.
    pub executor: String,
    pub cron_expr: String,
    /// Opaque, executor-specific configuration. Interpreted only by the named executor.
    #[builder(default)]
    pub cfg: String,
    #[builder(default)]
    pub owner: Option<String>,
    #[builder(default = TaskStatus::Waiting)]
    pub status: TaskStatus,
    #[builder(default)]
    pub next_exec_time: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub ctime: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub utime: DateTime<Utc>,
}

impl Task {
    /// Computes the next fire instant strictly after `after`, per this task's cron expression.
    ///
    /// Returns `Ok(None)` if the expression has no future occurrence (e.g. a spent
    /// one-shot schedule) rather than an error — callers use this to decide whether
    /// to pause the task instead of rescheduling it.
    pub fn next_time(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, StorageError> {
        use cron::Schedule;
        use std::str::FromStr;

        let schedule = Schedule::from_str(&self.cron_expr)
            .map_err(|e| StorageError::InvalidCron(self.cron_expr.clone(), e))?;
        Ok(schedule.after(&after).next())
    }
}
