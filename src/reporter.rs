use std::sync::Arc;

use tracing::warn;

use crate::model::{ExecResult, ExecStatus};
use crate::storage::ExecutionDao;

/// Turns a raw payload (typically the JSON body reported by an executor
/// callee) into a persisted progress update. Persistence is best-effort: a
/// storage failure is logged but never prevents the caller from learning the
/// parsed status, and a payload that fails to parse never mutates state.
pub struct ProgressReporter {
    dao: Arc<dyn ExecutionDao>,
}

impl ProgressReporter {
    pub fn new(dao: Arc<dyn ExecutionDao>) -> Self {
        Self { dao }
    }

    /// Parses `raw` as an [`ExecResult`] and, on success, persists its
    /// progress. Returns the resulting status: `Unknown` on parse failure
    /// (no mutation performed), or the parsed status regardless of whether
    /// persistence itself succeeded.
    pub async fn report(&self, raw: &str) -> ExecStatus {
        let result: ExecResult = match serde_json::from_str(raw) {
            Ok(r) => r,
            Err(err) => {
                warn!(error = %err, "failed to parse execution result payload");
                return ExecStatus::Unknown;
            }
        };

        let status = ExecStatus::from_wire(&result.status);
        if let Err(err) = self.dao.update_progress(result.id, result.progress).await {
            warn!(eid = result.id, error = %err, "failed to persist reported progress");
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryDao;

    #[tokio::test]
    async fn malformed_payload_returns_unknown_without_mutating_state() {
        let dao = Arc::new(InMemoryDao::new());
        let eid = dao.upsert(1, ExecStatus::Running, 5).await.unwrap();
        let reporter = ProgressReporter::new(dao.clone());

        let status = reporter.report("not json").await;
        assert_eq!(status, ExecStatus::Unknown);

        let exec = dao.get_last_execution(1).await.unwrap();
        assert_eq!(exec.id, eid);
        assert_eq!(exec.progress, 5);
    }

    #[tokio::test]
    async fn well_formed_payload_persists_progress_and_returns_parsed_status() {
        let dao = Arc::new(InMemoryDao::new());
        dao.upsert(1, ExecStatus::Running, 5).await.unwrap();
        let reporter = ProgressReporter::new(dao.clone());

        let status = reporter.report(r#"{"id":1,"status":"SUCCESS","progress":100}"#).await;
        assert_eq!(status, ExecStatus::Success);

        let exec = dao.get_last_execution(1).await.unwrap();
        assert_eq!(exec.progress, 100);
    }

    #[tokio::test]
    async fn dao_failure_still_returns_the_parsed_status() {
        let dao = Arc::new(InMemoryDao::new());
        // no upsert: update_progress will fail to find the row
        let reporter = ProgressReporter::new(dao.clone());

        let status = reporter.report(r#"{"id":999,"status":"RUNNING","progress":40}"#).await;
        assert_eq!(status, ExecStatus::Running);
    }
}
