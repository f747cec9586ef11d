use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;
use crate::model::Task;

use super::{default_task_timeout, Executor, ExploreStream, RunStatus};

type BoxedFn = Arc<
    dyn Fn(CancellationToken, Task) -> Pin<Box<dyn Future<Output = Result<(), ExecutorError>> + Send>>
        + Send
        + Sync,
>;

#[derive(Debug, Deserialize)]
struct LocalCfg {
    #[serde(default)]
    task_timeout_ms: Option<u64>,
}

/// Executor that dispatches to an in-process function registry keyed by
/// `Task.name`, for tasks that don't need a network hop.
#[derive(Default)]
pub struct LocalExecutor {
    functions: RwLock<HashMap<String, BoxedFn>>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function under `name`. Replaces any prior registration.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(CancellationToken, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ExecutorError>> + Send + 'static,
    {
        let boxed: BoxedFn = Arc::new(move |ctx, task| Box::pin(f(ctx, task)));
        self.functions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), boxed);
    }

    fn lookup(&self, name: &str) -> Option<BoxedFn> {
        self.functions.read().unwrap_or_else(|e| e.into_inner()).get(name).cloned()
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        "local"
    }

    async fn run(&self, ctx: CancellationToken, task: &Task, _eid: i64) -> Result<RunStatus, ExecutorError> {
        let f = self
            .lookup(&task.name)
            .ok_or_else(|| ExecutorError::UnknownTask(task.name.clone()))?;

        match f(ctx, task.clone()).await {
            Ok(()) => Ok(RunStatus::Success),
            Err(_) => Ok(RunStatus::Failed),
        }
    }

    async fn explore(&self, _ctx: CancellationToken, _eid: i64, _task: &Task) -> Option<ExploreStream> {
        // Local functions run to completion inside `run`; there is never an
        // asynchronous follow-up phase.
        None
    }

    fn task_timeout(&self, task: &Task) -> Duration {
        let cfg: Option<LocalCfg> = serde_json::from_str(&task.cfg).ok();
        default_task_timeout(cfg.and_then(|c| c.task_timeout_ms).map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(name: &str) -> Task {
        Task::builder()
            .name(name.into())
            .executor("local".into())
            .cron_expr("* * * * * * *".into())
            .build()
    }

    #[tokio::test]
    async fn registered_function_reports_success() {
        let exec = LocalExecutor::new();
        exec.register_fn("ping", |_ctx, _task| async move { Ok(()) });

        let status = exec.run(CancellationToken::new(), &sample_task("ping"), 1).await.unwrap();
        assert_eq!(status, RunStatus::Success);
    }

    #[tokio::test]
    async fn failing_function_reports_failed_not_an_error() {
        let exec = LocalExecutor::new();
        exec.register_fn("boom", |_ctx, _task| async move {
            Err(ExecutorError::InvalidConfig("boom".into()))
        });

        let status = exec.run(CancellationToken::new(), &sample_task("boom"), 1).await.unwrap();
        assert_eq!(status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn unregistered_task_name_is_an_error() {
        let exec = LocalExecutor::new();
        let result = exec.run(CancellationToken::new(), &sample_task("nope"), 1).await;
        assert!(matches!(result, Err(ExecutorError::UnknownTask(_))));
    }

    #[test]
    fn task_timeout_defaults_to_one_minute_without_cfg() {
        let exec = LocalExecutor::new();
        assert_eq!(exec.task_timeout(&sample_task("x")), Duration::from_secs(60));
    }
}
