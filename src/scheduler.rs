use std::sync::{Arc, OnceLock};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::executor::{Executor, ExecutorRegistry, RunStatus};
use crate::model::{ExecStatus, Task};
use crate::preempter::Preempter;
use crate::storage::ExecutionDao;

/// Why an in-flight execution's context was cancelled. Distinguishing these
/// is the crux of status reduction: a deadline and a lost lease both cancel
/// the same token, but persist as different terminal statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelReason {
    Deadline,
    LeaseLost,
    Shutdown,
}

/// Bounded-concurrency dispatch loop: preempts due tasks and supervises their
/// execution, never running more than `max_concurrency` attempts at once.
pub struct PreemptScheduler {
    preempter: Arc<Preempter>,
    executors: Arc<ExecutorRegistry>,
    execution_dao: Arc<dyn ExecutionDao>,
    semaphore: Arc<Semaphore>,
}

impl PreemptScheduler {
    pub fn new(
        preempter: Arc<Preempter>,
        executors: Arc<ExecutorRegistry>,
        execution_dao: Arc<dyn ExecutionDao>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            preempter,
            executors,
            execution_dao,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
        }
    }

    /// Runs the dispatch loop until `shutdown` is cancelled. Acquires a
    /// semaphore permit before attempting to preempt a task, so a full pool
    /// never holds an unused lease.
    pub async fn schedule(&self, shutdown: CancellationToken) {
        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduler shutting down, dispatch loop exiting");
                    return;
                }
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    permit.expect("semaphore is never closed while the scheduler is alive")
                }
            };

            let (task, lease) = match self.preempter.preempt().await {
                Ok(pair) => pair,
                Err(_) => {
                    drop(permit);
                    continue;
                }
            };

            let Some(executor) = self.executors.lookup(&task.executor) else {
                warn!(task_id = task.id, executor = %task.executor, "unknown executor; abandoning attempt");
                lease.release_without_reschedule().await;
                drop(permit);
                continue;
            };

            let execution_dao = Arc::clone(&self.execution_dao);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _permit = permit;
                supervise(task, lease, executor, execution_dao, shutdown).await;
            });
        }
    }
}

#[instrument(skip(lease, executor, execution_dao, shutdown), fields(task_id = task.id, executor = %task.executor))]
async fn supervise(
    task: Task,
    lease: crate::preempter::Lease,
    executor: Arc<dyn Executor>,
    execution_dao: Arc<dyn ExecutionDao>,
    shutdown: CancellationToken,
) {
    let timeout = executor.task_timeout(&task);

    let eid = match execution_dao.upsert(task.id, ExecStatus::Running, 0).await {
        Ok(eid) => eid,
        Err(err) => {
            error!(error = %err, "failed to open execution row; abandoning attempt");
            lease.release_without_reschedule().await;
            return;
        }
    };

    let exec_ctx = CancellationToken::new();
    let reason: Arc<OnceLock<CancelReason>> = Arc::new(OnceLock::new());

    {
        let exec_ctx = exec_ctx.clone();
        let reason = Arc::clone(&reason);
        let lost = lease.lost_token();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    let _ = reason.set(CancelReason::Deadline);
                    exec_ctx.cancel();
                }
                _ = lost.cancelled() => {
                    let _ = reason.set(CancelReason::LeaseLost);
                    exec_ctx.cancel();
                }
                _ = shutdown.cancelled() => {
                    let _ = reason.set(CancelReason::Shutdown);
                    exec_ctx.cancel();
                }
                _ = exec_ctx.cancelled() => {}
            }
        });
    }

    let run_status = tokio::select! {
        result = executor.run(exec_ctx.clone(), &task, eid) => result.ok(),
        _ = exec_ctx.cancelled() => None,
    };

    let mut final_status = reduce_status(run_status, exec_ctx.is_cancelled(), reason.get().copied());
    let mut progress = if final_status == ExecStatus::Success { 100 } else { 0 };

    if final_status == ExecStatus::Running {
        let (explored_status, explored_progress) = explore(&*executor, exec_ctx.clone(), eid, &task, &execution_dao).await;
        // Deadline/lease-loss during explore takes precedence the same way it does around `run`.
        final_status = if exec_ctx.is_cancelled() {
            match reason.get().copied() {
                Some(CancelReason::Deadline) => ExecStatus::DeadlineExceeded,
                _ => ExecStatus::Cancelled,
            }
        } else {
            explored_status
        };
        progress = explored_progress;
    }

    if let Err(err) = execution_dao.update_status(eid, final_status, progress).await {
        warn!(error = %err, "failed to persist final execution status");
    }

    exec_ctx.cancel();
    lease.release(&task).await;
}

fn reduce_status(run_status: Option<RunStatus>, cancelled: bool, reason: Option<CancelReason>) -> ExecStatus {
    if cancelled {
        return match reason {
            Some(CancelReason::Deadline) => ExecStatus::DeadlineExceeded,
            _ => ExecStatus::Cancelled,
        };
    }
    match run_status {
        Some(RunStatus::Success) => ExecStatus::Success,
        Some(RunStatus::Failed) => ExecStatus::Failed,
        Some(RunStatus::Running) => ExecStatus::Running,
        None => ExecStatus::Failed,
    }
}

/// Consumes the executor's progress stream until a terminal result, the
/// stream closes, or `ctx` is cancelled. Always returns the last progress
/// observed — a cancellation never zeroes it out.
async fn explore(
    executor: &dyn Executor,
    ctx: CancellationToken,
    eid: i64,
    task: &Task,
    execution_dao: &Arc<dyn ExecutionDao>,
) -> (ExecStatus, i16) {
    let Some(mut stream) = executor.explore(ctx.clone(), eid, task).await else {
        return (ExecStatus::Running, 0);
    };

    let mut last_progress = 0i16;
    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                return (ExecStatus::Cancelled, last_progress);
            }
            event = stream.recv() => {
                let Some(event) = event else {
                    // Stream closed without a terminal result: treat as a timing
                    // race and leave the prior `running` row as-is.
                    return (ExecStatus::Running, last_progress);
                };
                last_progress = event.progress;
                if let Err(err) = execution_dao.update_progress(eid, event.progress).await {
                    warn!(eid, error = %err, "failed to persist explore progress");
                }
                match event.status {
                    RunStatus::Success => return (ExecStatus::Success, event.progress),
                    RunStatus::Failed => return (ExecStatus::Failed, event.progress),
                    RunStatus::Running => continue,
                }
            }
        }
    }
}
