use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ExecutorError;
use crate::model::{ExecStatus, Task};

use super::{default_task_timeout, Executor, ExploreEvent, ExploreStream, RunStatus};

/// Number of transient transport errors the explore loop tolerates before
/// giving up and reporting `Failed`.
const MAX_FAIL_COUNT: u32 = 5;

#[derive(Debug, Deserialize)]
struct HttpCfg {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    header: HashMap<String, String>,
    #[serde(default)]
    body: Option<String>,
    task_timeout_ms: Option<u64>,
    explore_interval_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Serialize)]
struct CancelRequest<'a> {
    execution_id: &'a str,
}

/// Executor that invokes a remote task runner over HTTP. The callee is
/// expected to require an `execution_id` header on every request, and to
/// respond with a JSON body shaped like [`crate::model::ExecResult`].
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client config is static and valid"),
        }
    }

    fn parse_cfg(task: &Task) -> Result<HttpCfg, ExecutorError> {
        serde_json::from_str(&task.cfg).map_err(|e| ExecutorError::InvalidConfig(e.to_string()))
    }

    /// Issues one request and parses the callee's status/progress body.
    /// `None` covers every transient failure mode (transport error, non-2xx,
    /// unparsable body) uniformly — the caller treats all of them as "still
    /// running, try again".
    async fn poll_once(&self, cfg: &HttpCfg, eid: i64) -> Option<(ExecStatus, i16)> {
        let method = cfg.method.parse().unwrap_or(reqwest::Method::GET);
        let mut request = self.client.request(method, &cfg.url).header("execution_id", eid.to_string());
        for (k, v) in &cfg.header {
            request = request.header(k, v);
        }
        if let Some(body) = &cfg.body {
            request = request.body(body.clone());
        }

        let response = request.send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }

        let body: super::super::model::ExecResult = response.json().await.ok()?;
        Some((ExecStatus::from_wire(&body.status), body.progress))
    }

    async fn notify_cancel(&self, cfg: &HttpCfg, eid: i64) {
        let eid_str = eid.to_string();
        let result = self
            .client
            .post(&cfg.url)
            .header("cancel", "true")
            .json(&CancelRequest { execution_id: &eid_str })
            .send()
            .await;
        if let Err(err) = result {
            warn!(eid, error = %err, "best-effort cancellation notice failed");
        }
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn run(&self, _ctx: CancellationToken, task: &Task, eid: i64) -> Result<RunStatus, ExecutorError> {
        let cfg = Self::parse_cfg(task)?;
        match self.poll_once(&cfg, eid).await {
            Some((ExecStatus::Success, _)) => Ok(RunStatus::Success),
            Some((ExecStatus::Failed, _)) => Ok(RunStatus::Failed),
            Some(_) => Ok(RunStatus::Running),
            None => Ok(RunStatus::Running),
        }
    }

    async fn explore(&self, ctx: CancellationToken, eid: i64, task: &Task) -> Option<ExploreStream> {
        let cfg = Self::parse_cfg(task).ok()?;
        let interval = cfg
            .explore_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(1));

        let (tx, rx) = mpsc::channel(8);
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut fail_count = 0u32;
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        let eid_str = eid.to_string();
                        let _ = client
                            .post(&cfg.url)
                            .header("cancel", "true")
                            .json(&CancelRequest { execution_id: &eid_str })
                            .send()
                            .await;
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                let method = cfg.method.parse().unwrap_or(reqwest::Method::GET);
                let mut request = client.request(method, &cfg.url).header("execution_id", eid.to_string());
                for (k, v) in &cfg.header {
                    request = request.header(k, v);
                }

                let outcome = request.send().await;
                let body = match outcome {
                    Ok(resp) if resp.status().is_success() => resp.json::<super::super::model::ExecResult>().await.ok(),
                    _ => None,
                };

                let Some(body) = body else {
                    fail_count += 1;
                    if fail_count >= MAX_FAIL_COUNT {
                        let _ = tx.send(ExploreEvent { eid, status: RunStatus::Failed, progress: 0 }).await;
                        return;
                    }
                    continue;
                };
                fail_count = 0;

                let status = ExecStatus::from_wire(&body.status);
                let run_status = match status {
                    ExecStatus::Success => RunStatus::Success,
                    ExecStatus::Failed => RunStatus::Failed,
                    _ => RunStatus::Running,
                };

                let terminal = matches!(run_status, RunStatus::Success | RunStatus::Failed);
                if tx.send(ExploreEvent { eid, status: run_status, progress: body.progress }).await.is_err() || terminal {
                    return;
                }
            }
        });

        Some(rx)
    }

    fn task_timeout(&self, task: &Task) -> Duration {
        let cfg = Self::parse_cfg(task).ok();
        default_task_timeout(cfg.and_then(|c| c.task_timeout_ms).map(Duration::from_millis))
    }
}
