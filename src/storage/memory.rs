use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::model::{ExecStatus, Execution, Task, TaskStatus};

use super::{ExecutionDao, TaskDao};

/// In-memory [`TaskDao`] / [`ExecutionDao`] double used by the test suite to
/// exercise the preemption and dispatch protocol without a real database.
///
/// Mirrors the CAS semantics of [`super::postgres::PostgresDao`]: `preempt`
/// picks one eligible row and flips it atomically under the write lock, so
/// concurrent callers racing on the same task id never both succeed.
pub struct InMemoryDao {
    tasks: RwLock<HashMap<i64, Task>>,
    executions: RwLock<HashMap<i64, Execution>>,
    next_task_id: std::sync::atomic::AtomicI64,
    next_exec_id: std::sync::atomic::AtomicI64,
}

impl Default for InMemoryDao {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDao {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            next_task_id: std::sync::atomic::AtomicI64::new(1),
            next_exec_id: std::sync::atomic::AtomicI64::new(1),
        }
    }

    fn tasks(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<i64, Task>> {
        self.tasks.write().unwrap_or_else(|e| e.into_inner())
    }

    fn executions(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<i64, Execution>> {
        self.executions.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TaskDao for InMemoryDao {
    async fn preempt(&self, owner: &str, lease_timeout_ms: i64) -> Result<Task, StorageError> {
        let mut tasks = self.tasks();
        let now = Utc::now();

        let mut due: Vec<&mut Task> = tasks
            .values_mut()
            .filter(|t| match t.status {
                TaskStatus::Waiting => t.next_exec_time.map(|n| n <= now).unwrap_or(true),
                TaskStatus::Running => {
                    now.signed_duration_since(t.utime).num_milliseconds() >= lease_timeout_ms
                }
                TaskStatus::Paused => false,
            })
            .collect();

        due.sort_by(|a, b| a.next_exec_time.cmp(&b.next_exec_time).then(a.id.cmp(&b.id)));

        let Some(task) = due.into_iter().next() else {
            return Err(StorageError::NoTaskAvailable);
        };

        task.status = TaskStatus::Running;
        task.owner = Some(owner.to_string());
        task.utime = now;
        Ok(task.clone())
    }

    async fn update_utime(&self, id: i64, owner: &str) -> Result<(), StorageError> {
        let mut tasks = self.tasks();
        let task = tasks.get_mut(&id).ok_or(StorageError::TaskNotFound(id))?;
        if task.owner.as_deref() != Some(owner) || task.status != TaskStatus::Running {
            return Err(StorageError::TaskNotFound(id));
        }
        task.utime = Utc::now();
        Ok(())
    }

    async fn update_next_time(&self, id: i64, next: DateTime<Utc>) -> Result<(), StorageError> {
        let mut tasks = self.tasks();
        let task = tasks.get_mut(&id).ok_or(StorageError::TaskNotFound(id))?;
        task.next_exec_time = Some(next);
        task.utime = Utc::now();
        Ok(())
    }

    async fn stop(&self, id: i64) -> Result<(), StorageError> {
        let mut tasks = self.tasks();
        let task = tasks.get_mut(&id).ok_or(StorageError::TaskNotFound(id))?;
        task.status = TaskStatus::Paused;
        Ok(())
    }

    async fn release(&self, id: i64, owner: &str) -> Result<(), StorageError> {
        let mut tasks = self.tasks();
        let task = tasks.get_mut(&id).ok_or(StorageError::TaskNotFound(id))?;
        if task.owner.as_deref() == Some(owner) {
            task.status = TaskStatus::Waiting;
            task.owner = None;
            task.utime = Utc::now();
        }
        Ok(())
    }

    async fn add(&self, task: &Task) -> Result<Task, StorageError> {
        let mut tasks = self.tasks();
        let id = self.next_task_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut stored = task.clone();
        stored.id = id;
        stored.ctime = Utc::now();
        stored.utime = Utc::now();
        tasks.insert(id, stored.clone());
        Ok(stored)
    }

    async fn list(&self) -> Result<Vec<Task>, StorageError> {
        let mut tasks: Vec<Task> = self.tasks().values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }
}

#[async_trait]
impl ExecutionDao for InMemoryDao {
    async fn upsert(&self, tid: i64, status: ExecStatus, progress: i16) -> Result<i64, StorageError> {
        let mut executions = self.executions();
        if let Some(existing) = executions.values_mut().find(|e| e.tid == tid) {
            existing.status = status;
            existing.progress = progress;
            existing.utime = Utc::now();
            return Ok(existing.id);
        }
        let id = self.next_exec_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let now = Utc::now();
        executions.insert(
            id,
            Execution { id, tid, status, progress, ctime: now, utime: now },
        );
        Ok(id)
    }

    async fn update_progress(&self, eid: i64, progress: i16) -> Result<(), StorageError> {
        let mut executions = self.executions();
        let exec = executions.get_mut(&eid).ok_or(StorageError::TaskNotFound(eid))?;
        exec.progress = progress;
        exec.utime = Utc::now();
        Ok(())
    }

    async fn update_status(&self, eid: i64, status: ExecStatus, progress: i16) -> Result<(), StorageError> {
        let mut executions = self.executions();
        let exec = executions.get_mut(&eid).ok_or(StorageError::TaskNotFound(eid))?;
        exec.status = status;
        exec.progress = progress;
        exec.utime = Utc::now();
        Ok(())
    }

    async fn get_last_execution(&self, tid: i64) -> Result<Execution, StorageError> {
        self.executions()
            .values()
            .find(|e| e.tid == tid)
            .cloned()
            .ok_or(StorageError::TaskNotFound(tid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task::builder()
            .name("demo".into())
            .executor("local".into())
            .cron_expr("* * * * * * *".into())
            .build()
    }

    #[tokio::test]
    async fn preempt_claims_exactly_once_under_race() {
        let dao = InMemoryDao::new();
        let t = dao.add(&sample_task()).await.unwrap();

        let a = dao.preempt("worker-a", 5_000).await;
        let b = dao.preempt("worker-b", 5_000).await;

        assert!(a.is_ok());
        assert!(matches!(b, Err(StorageError::NoTaskAvailable)));
        assert_eq!(a.unwrap().id, t.id);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let dao = InMemoryDao::new();
        let t = dao.add(&sample_task()).await.unwrap();
        dao.preempt("worker-a", 0).await.unwrap();

        // lease_timeout_ms = 0 means any elapsed time reclaims it immediately
        let reclaimed = dao.preempt("worker-b", 0).await;
        assert!(reclaimed.is_ok());
        assert_eq!(reclaimed.unwrap().id, t.id);
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let dao = InMemoryDao::new();
        let eid = dao.upsert(42, ExecStatus::Running, 10).await.unwrap();
        let exec = dao.get_last_execution(42).await.unwrap();
        assert_eq!(exec.id, eid);
        assert_eq!(exec.status, ExecStatus::Running);
        assert_eq!(exec.progress, 10);
    }
}
