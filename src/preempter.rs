use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{PreemptError, StorageError};
use crate::model::Task;
use crate::storage::TaskDao;

/// Acquires due tasks under a renewable lease and hands back a [`Lease`] whose
/// `release` must be called exactly once when the caller is done with the task.
///
/// Grounded on the CAS-on-`utime` preemption primitive: the heavy lifting
/// (atomic select-and-claim) lives in [`TaskDao::preempt`]; this type owns the
/// lease's lifecycle — the background refresh loop and the eventual release.
pub struct Preempter {
    dao: Arc<dyn TaskDao>,
    owner: String,
    refresh_interval: Duration,
    lease_timeout: Duration,
    preempt_timeout: Duration,
}

impl Preempter {
    pub fn new(
        dao: Arc<dyn TaskDao>,
        owner: String,
        refresh_interval: Duration,
        lease_timeout: Duration,
        preempt_timeout: Duration,
    ) -> Self {
        Self { dao, owner, refresh_interval, lease_timeout, preempt_timeout }
    }

    /// Blocks until a due task is acquired or `preempt_timeout` elapses.
    pub async fn preempt(&self) -> Result<(Task, Lease), PreemptError> {
        let lease_timeout_ms = self.lease_timeout.as_millis() as i64;

        let task = tokio::time::timeout(
            self.preempt_timeout,
            self.dao.preempt(&self.owner, lease_timeout_ms),
        )
        .await
        .map_err(|_| PreemptError::NoTaskAvailable)?
        .map_err(|e| match e {
            StorageError::NoTaskAvailable => PreemptError::NoTaskAvailable,
            other => PreemptError::Storage(other),
        })?;

        let lost = CancellationToken::new();
        let refresh_cancel = CancellationToken::new();
        let refresh_handle = spawn_refresh_loop(
            Arc::clone(&self.dao),
            task.id,
            self.owner.clone(),
            self.refresh_interval,
            lost.clone(),
            refresh_cancel.clone(),
        );

        let lease = Lease {
            dao: Arc::clone(&self.dao),
            task_id: task.id,
            owner: self.owner.clone(),
            lost,
            refresh_cancel,
            refresh_handle: Some(refresh_handle),
        };

        Ok((task, lease))
    }
}

fn spawn_refresh_loop(
    dao: Arc<dyn TaskDao>,
    task_id: i64,
    owner: String,
    refresh_interval: Duration,
    lost: CancellationToken,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = refresh_interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let refresh_deadline = Duration::from_secs(3);
            let result = tokio::time::timeout(refresh_deadline, dao.update_utime(task_id, &owner)).await;

            match result {
                Ok(Ok(())) => {
                    interval = refresh_interval;
                }
                Ok(Err(StorageError::TaskNotFound(_))) => {
                    warn!(task_id, "lease lost: another worker reclaimed this task");
                    lost.cancel();
                    return;
                }
                Ok(Err(err)) => {
                    warn!(task_id, error = %err, "lease refresh failed, backing off");
                    interval = refresh_interval / 3;
                }
                Err(_) => {
                    warn!(task_id, "lease refresh timed out, backing off");
                    interval = refresh_interval / 3;
                }
            }
        }
    })
}

/// A held lease on one task. Must be released exactly once via [`Lease::release`].
///
/// [`Lease::lost_token`] is cancelled by the background refresh loop the
/// moment this worker is no longer the recognized owner — the scheduler wires
/// this directly into the supervised execution's cancellation so a lost lease
/// tears down the in-flight attempt rather than racing another owner.
pub struct Lease {
    dao: Arc<dyn TaskDao>,
    task_id: i64,
    owner: String,
    lost: CancellationToken,
    refresh_cancel: CancellationToken,
    refresh_handle: Option<JoinHandle<()>>,
}

impl Lease {
    /// Cancelled when the refresh loop determines this worker no longer owns the task.
    pub fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Releases ownership without touching `next_exec_time`, for attempts
    /// abandoned before a real outcome was produced (unknown executor,
    /// failure to open the execution row). The task remains immediately
    /// re-preemptable on the next dispatch cycle.
    pub async fn release_without_reschedule(mut self) {
        self.refresh_cancel.cancel();
        if let Some(handle) = self.refresh_handle.take() {
            let _ = handle.await;
        }
        if let Err(err) = self.dao.release(self.task_id, &self.owner).await {
            warn!(task_id = self.task_id, error = %err, "failed to release lease");
        }
    }

    /// Stops refreshing, computes and persists the task's next fire time (or
    /// pauses it if the cron expression has no future occurrence), and clears
    /// ownership. Consumes `self` so it cannot be called twice.
    pub async fn release(mut self, task: &Task) {
        self.refresh_cancel.cancel();
        if let Some(handle) = self.refresh_handle.take() {
            let _ = handle.await;
        }

        let now = Utc::now();
        match task.next_time(now) {
            Ok(Some(next)) => {
                if let Err(err) = self.dao.update_next_time(self.task_id, next).await {
                    warn!(task_id = self.task_id, error = %err, "failed to persist next_exec_time");
                }
            }
            Ok(None) => {
                info!(task_id = self.task_id, "cron expression exhausted, pausing task");
                if let Err(err) = self.dao.stop(self.task_id).await {
                    warn!(task_id = self.task_id, error = %err, "failed to pause exhausted task");
                }
            }
            Err(err) => {
                warn!(task_id = self.task_id, error = %err, "invalid cron expression, pausing task");
                if let Err(err) = self.dao.stop(self.task_id).await {
                    warn!(task_id = self.task_id, error = %err, "failed to pause task with invalid cron");
                }
            }
        }

        if let Err(err) = self.dao.release(self.task_id, &self.owner).await {
            warn!(task_id = self.task_id, error = %err, "failed to release lease");
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.refresh_cancel.cancel();
    }
}
