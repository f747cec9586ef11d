pub mod grpc;
pub mod http;
pub mod local;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ExecutorError;
use crate::model::Task;

pub use grpc::GrpcExecutor;
pub use http::HttpExecutor;
pub use local::LocalExecutor;

/// The three outcomes an executor's synchronous `run` may report. A fourth,
/// implicit outcome — context cancellation or deadline — is detected by the
/// scheduler around the `run` call, not returned by the executor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failed,
    Running,
}

/// One event from an executor's asynchronous progress stream.
#[derive(Debug, Clone)]
pub struct ExploreEvent {
    pub eid: i64,
    pub status: RunStatus,
    pub progress: i16,
}

pub type ExploreStream = mpsc::Receiver<ExploreEvent>;

/// Pluggable protocol for running a task. Implementations translate a task's
/// `cfg` into a concrete invocation (HTTP call, gRPC call, local function).
#[async_trait]
pub trait Executor: Send + Sync {
    /// Stable registry key; matches `Task.executor`.
    fn name(&self) -> &str;

    /// Runs the task. Returns quickly; an executor unable to determine
    /// completion synchronously returns `Running` and defers to `explore`.
    async fn run(&self, ctx: CancellationToken, task: &Task, eid: i64) -> Result<RunStatus, ExecutorError>;

    /// Produces the task's asynchronous progress stream, or `None` if this
    /// executor has no asynchronous follow-up for the given task.
    async fn explore(&self, ctx: CancellationToken, eid: i64, task: &Task) -> Option<ExploreStream>;

    /// This task's declared execution budget. A missing or unparsable value
    /// defaults to one minute.
    fn task_timeout(&self, task: &Task) -> Duration;
}

/// Read-mostly registry of executors keyed by name, written once at startup
/// and consulted by the dispatch loop on every preempted task.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn Executor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executor under its own name. Re-registering the same name
    /// replaces the prior entry and logs a warning rather than erroring.
    pub fn register(&self, executor: Arc<dyn Executor>) {
        let name = executor.name().to_string();
        let mut executors = self.executors.write().unwrap_or_else(|e| e.into_inner());
        if executors.insert(name.clone(), executor).is_some() {
            warn!(executor = %name, "replacing previously registered executor");
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.executors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

pub(crate) fn default_task_timeout(raw: Option<Duration>) -> Duration {
    match raw {
        Some(d) if d.as_millis() > 0 => d,
        _ => Duration::from_secs(60),
    }
}
