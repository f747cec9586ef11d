//! A minimal reference implementation of the HTTP executor's wire protocol,
//! for exercising `ecron::executor::HttpExecutor` against a real callee
//! without standing up a production task runner. Not part of the scheduler
//! itself — see SPEC_FULL.md section 1 (the remote task-runner callee is out
//! of scope for the core) and section 6 (the wire protocol this implements).

use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::any;
use axum::{Json, Router};
use serde::Serialize;

#[derive(Serialize)]
struct Report {
    id: i64,
    status: &'static str,
    progress: i16,
}

/// Reports progress in fixed increments each time it is polled, then success.
struct CounterTask {
    progress: AtomicI16,
}

async fn poll(State(task): State<Arc<CounterTask>>, headers: HeaderMap) -> Json<Report> {
    let eid: i64 = headers
        .get("execution_id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    if headers.get("cancel").is_some() {
        return Json(Report { id: eid, status: "RUNNING", progress: 0 });
    }

    let prev = task.progress.fetch_add(25, Ordering::SeqCst);
    let report = if prev >= 100 {
        Report { id: eid, status: "SUCCESS", progress: 100 }
    } else {
        Report { id: eid, status: "RUNNING", progress: (prev + 25).min(100) }
    };
    Json(report)
}

#[tokio::main]
async fn main() {
    let task = Arc::new(CounterTask { progress: AtomicI16::new(0) });
    let app = Router::new().route("/run", any(poll)).with_state(task);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:8088").await.expect("bind reference callee port");
    println!("reference HTTP callee listening on http://127.0.0.1:8088/run");
    axum::serve(listener, app).await.expect("reference callee server exited");
}
