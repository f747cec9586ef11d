use std::time::Duration;

use anyhow::{Context, Result};
use uuid::Uuid;

/// Process configuration loaded once from the environment at startup.
/// Mirrors the fail-fast style of the rest of the stack: a missing
/// `DATABASE_URL` is a startup error, never a silently-applied default.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub max_concurrency: usize,
    pub refresh_interval: Duration,
    pub lease_timeout: Duration,
    pub preempt_poll_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let worker_id = std::env::var("WORKER_ID").unwrap_or_else(|_| format!("worker-{}", Uuid::new_v4()));

        let max_concurrency = parse_env_or("MAX_CONCURRENCY", 16usize)?;
        let refresh_interval_ms = parse_env_or("REFRESH_INTERVAL_MS", 5_000u64)?;
        let preempt_poll_timeout_ms = parse_env_or("PREEMPT_POLL_TIMEOUT_MS", 3_000u64)?;
        let lease_timeout_ms = match std::env::var("LEASE_TIMEOUT_MS") {
            Ok(raw) => raw.parse::<u64>().context("LEASE_TIMEOUT_MS must be a positive integer")?,
            Err(_) => refresh_interval_ms * 3,
        };

        Ok(Self {
            database_url,
            worker_id,
            max_concurrency,
            refresh_interval: Duration::from_millis(refresh_interval_ms),
            lease_timeout: Duration::from_millis(lease_timeout_ms),
            preempt_poll_timeout: Duration::from_millis(preempt_poll_timeout_ms),
        })
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{key} is set but not a valid value: {e}")),
        Err(_) => Ok(default),
    }
}
