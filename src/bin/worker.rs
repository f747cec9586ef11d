use std::sync::Arc;

use anyhow::{Context, Result};
use ecron::config::Config;
use ecron::executor::{ExecutorRegistry, HttpExecutor, LocalExecutor};
use ecron::preempter::Preempter;
use ecron::scheduler::PreemptScheduler;
use ecron::storage::PostgresDao;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_concurrency as u32 + 4)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations").run(&pool).await.context("failed to run migrations")?;

    let dao: Arc<PostgresDao> = Arc::new(PostgresDao::new(pool));

    let preempter = Arc::new(Preempter::new(
        dao.clone(),
        config.worker_id.clone(),
        config.refresh_interval,
        config.lease_timeout,
        config.preempt_poll_timeout,
    ));

    let registry = Arc::new(ExecutorRegistry::new());
    registry.register(Arc::new(HttpExecutor::new()));
    registry.register(Arc::new(LocalExecutor::new()));

    let scheduler = PreemptScheduler::new(preempter, registry, dao, config.max_concurrency);

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    info!(worker_id = %config.worker_id, max_concurrency = config.max_concurrency, "starting scheduler");
    scheduler.schedule(shutdown).await;

    Ok(())
}
