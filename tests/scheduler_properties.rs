use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ecron::executor::{Executor, ExecutorRegistry, ExploreEvent, ExploreStream, RunStatus};
use ecron::model::{ExecStatus, Task};
use ecron::preempter::Preempter;
use ecron::scheduler::PreemptScheduler;
use ecron::storage::{ExecutionDao, InMemoryDao, TaskDao};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn daily_task(name: &str, executor: &str) -> Task {
    Task::builder()
        .name(name.into())
        .executor(executor.into())
        .cron_expr("0 0 0 * * * *".into())
        .build()
}

/// Executor that succeeds immediately.
struct ImmediateSuccess;

#[async_trait]
impl Executor for ImmediateSuccess {
    fn name(&self) -> &str {
        "immediate-success"
    }
    async fn run(&self, _ctx: CancellationToken, _task: &Task, _eid: i64) -> Result<RunStatus, ecron::error::ExecutorError> {
        Ok(RunStatus::Success)
    }
    async fn explore(&self, _ctx: CancellationToken, _eid: i64, _task: &Task) -> Option<ExploreStream> {
        None
    }
    fn task_timeout(&self, _task: &Task) -> Duration {
        Duration::from_secs(10)
    }
}

/// Executor that reports Running from `run`, then streams progress up to
/// success.
struct AsyncSuccess;

#[async_trait]
impl Executor for AsyncSuccess {
    fn name(&self) -> &str {
        "async-success"
    }
    async fn run(&self, _ctx: CancellationToken, _task: &Task, _eid: i64) -> Result<RunStatus, ecron::error::ExecutorError> {
        Ok(RunStatus::Running)
    }
    async fn explore(&self, _ctx: CancellationToken, eid: i64, _task: &Task) -> Option<ExploreStream> {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for progress in [10, 50] {
                let _ = tx.send(ExploreEvent { eid, status: RunStatus::Running, progress }).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let _ = tx.send(ExploreEvent { eid, status: RunStatus::Success, progress: 100 }).await;
        });
        Some(rx)
    }
    fn task_timeout(&self, _task: &Task) -> Duration {
        Duration::from_secs(10)
    }
}

/// Executor that reports Running and then never produces a terminal result,
/// holding at a fixed progress.
struct NeverFinishes {
    stuck_progress: i16,
}

#[async_trait]
impl Executor for NeverFinishes {
    fn name(&self) -> &str {
        "never-finishes"
    }
    async fn run(&self, _ctx: CancellationToken, _task: &Task, _eid: i64) -> Result<RunStatus, ecron::error::ExecutorError> {
        Ok(RunStatus::Running)
    }
    async fn explore(&self, ctx: CancellationToken, eid: i64, _task: &Task) -> Option<ExploreStream> {
        let (tx, rx) = mpsc::channel(8);
        let progress = self.stuck_progress;
        tokio::spawn(async move {
            let _ = tx.send(ExploreEvent { eid, status: RunStatus::Running, progress }).await;
            ctx.cancelled().await;
        });
        Some(rx)
    }
    fn task_timeout(&self, _task: &Task) -> Duration {
        Duration::from_millis(150)
    }
}

async fn wait_for_terminal(dao: &InMemoryDao, tid: i64, tries: u32) -> ecron::model::Execution {
    for _ in 0..tries {
        if let Ok(exec) = dao.get_last_execution(tid).await {
            if exec.status.is_terminal() {
                return exec;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("execution for task {tid} never reached a terminal status");
}

#[tokio::test]
async fn happy_path_immediate_success() {
    let dao: Arc<InMemoryDao> = Arc::new(InMemoryDao::new());
    let task_dao: Arc<dyn TaskDao> = dao.clone();
    let exec_dao: Arc<dyn ExecutionDao> = dao.clone();

    let task = task_dao.add(&daily_task("happy-path", "immediate-success")).await.unwrap();

    let preempter = Arc::new(Preempter::new(
        task_dao.clone(),
        "worker-1".into(),
        Duration::from_millis(50),
        Duration::from_secs(5),
        Duration::from_millis(200),
    ));
    let registry = Arc::new(ExecutorRegistry::new());
    registry.register(Arc::new(ImmediateSuccess));
    let scheduler = PreemptScheduler::new(preempter, registry, exec_dao, 4);

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let handle = tokio::spawn(async move { scheduler.schedule(shutdown_clone).await });

    let exec = wait_for_terminal(&dao, task.id, 50).await;
    assert_eq!(exec.status, ExecStatus::Success);
    assert_eq!(exec.progress, 100);

    let reloaded = task_dao.list().await.unwrap().into_iter().find(|t| t.id == task.id).unwrap();
    assert!(reloaded.next_exec_time.is_some());
    assert!(reloaded.owner.is_none());

    shutdown.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn progress_is_monotonic_through_async_success() {
    let dao: Arc<InMemoryDao> = Arc::new(InMemoryDao::new());
    let task_dao: Arc<dyn TaskDao> = dao.clone();
    let exec_dao: Arc<dyn ExecutionDao> = dao.clone();

    let task = task_dao.add(&daily_task("async-progress", "async-success")).await.unwrap();

    let preempter = Arc::new(Preempter::new(
        task_dao.clone(),
        "worker-1".into(),
        Duration::from_millis(50),
        Duration::from_secs(5),
        Duration::from_millis(200),
    ));
    let registry = Arc::new(ExecutorRegistry::new());
    registry.register(Arc::new(AsyncSuccess));
    let scheduler = PreemptScheduler::new(preempter, registry, exec_dao, 4);

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let handle = tokio::spawn(async move { scheduler.schedule(shutdown_clone).await });

    let exec = wait_for_terminal(&dao, task.id, 50).await;
    assert_eq!(exec.status, ExecStatus::Success);
    assert_eq!(exec.progress, 100);

    shutdown.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn task_timeout_during_explore_preserves_progress() {
    let dao: Arc<InMemoryDao> = Arc::new(InMemoryDao::new());
    let task_dao: Arc<dyn TaskDao> = dao.clone();
    let exec_dao: Arc<dyn ExecutionDao> = dao.clone();

    let task = task_dao.add(&daily_task("timeout-during-explore", "never-finishes")).await.unwrap();

    let preempter = Arc::new(Preempter::new(
        task_dao.clone(),
        "worker-1".into(),
        Duration::from_millis(50),
        Duration::from_secs(5),
        Duration::from_millis(200),
    ));
    let registry = Arc::new(ExecutorRegistry::new());
    registry.register(Arc::new(NeverFinishes { stuck_progress: 30 }));
    let scheduler = PreemptScheduler::new(preempter, registry, exec_dao, 4);

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let handle = tokio::spawn(async move { scheduler.schedule(shutdown_clone).await });

    let exec = wait_for_terminal(&dao, task.id, 50).await;
    assert_eq!(exec.status, ExecStatus::DeadlineExceeded);
    assert_eq!(exec.progress, 30, "progress observed before the deadline must be preserved, not zeroed");

    shutdown.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn concurrent_preempt_only_one_winner() {
    let dao = Arc::new(InMemoryDao::new());
    let task = dao.add(&daily_task("concurrent-preempt", "immediate-success")).await.unwrap();

    let p1 = Preempter::new(dao.clone(), "a".into(), Duration::from_secs(1), Duration::from_secs(5), Duration::from_millis(300));
    let p2 = Preempter::new(dao.clone(), "b".into(), Duration::from_secs(1), Duration::from_secs(5), Duration::from_millis(300));

    let (r1, r2) = tokio::join!(p1.preempt(), p2.preempt());
    let successes = [r1.is_ok(), r2.is_ok()].into_iter().filter(|x| *x).count();
    assert_eq!(successes, 1, "exactly one of two racing preempts on the same task must win");
    assert_eq!(task.status, ecron::model::TaskStatus::Waiting, "sanity: original task row starts out waiting");
}

#[tokio::test]
async fn unknown_executor_does_not_advance_next_exec_time() {
    let dao: Arc<InMemoryDao> = Arc::new(InMemoryDao::new());
    let task_dao: Arc<dyn TaskDao> = dao.clone();
    let exec_dao: Arc<dyn ExecutionDao> = dao.clone();

    let task = task_dao.add(&daily_task("unknown-executor", "does-not-exist")).await.unwrap();

    let preempter = Arc::new(Preempter::new(
        task_dao.clone(),
        "worker-1".into(),
        Duration::from_millis(50),
        Duration::from_secs(5),
        Duration::from_millis(200),
    ));
    let registry = Arc::new(ExecutorRegistry::new()); // nothing registered
    let scheduler = PreemptScheduler::new(preempter, registry, exec_dao, 4);

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let handle = tokio::spawn(async move { scheduler.schedule(shutdown_clone).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    let _ = handle.await;

    let reloaded = task_dao.list().await.unwrap().into_iter().find(|t| t.id == task.id).unwrap();
    assert!(reloaded.next_exec_time.is_none(), "an unknown executor must not advance next_exec_time");
    assert!(reloaded.owner.is_none(), "the lease must still be released so the task can be retried");
}

/// Invariant: across N concurrent workers racing a single in-memory DAO, at
/// most one ever holds a successful preempt for a given task at a time.
#[tokio::test]
async fn invariant_mutual_exclusion_under_n_way_race() {
    let dao = Arc::new(InMemoryDao::new());
    let task = dao.add(&daily_task("race", "immediate-success")).await.unwrap();

    let winners = Arc::new(AtomicI32::new(0));
    let mut handles = Vec::new();
    for i in 0..8 {
        let dao = dao.clone();
        let winners = winners.clone();
        handles.push(tokio::spawn(async move {
            let p = Preempter::new(dao, format!("worker-{i}"), Duration::from_secs(1), Duration::from_secs(5), Duration::from_millis(300));
            if p.preempt().await.is_ok() {
                winners.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    let _ = task;
}
