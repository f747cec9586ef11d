use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::StorageError;
use crate::model::{ExecStatus, Execution, Task};

use super::{ExecutionDao, TaskDao};

/// Postgres-backed [`TaskDao`] / [`ExecutionDao`].
///
/// The preemption primitive is a single statement: select the oldest due or
/// lease-expired row with `FOR UPDATE SKIP LOCKED`, then CAS its `utime` in
/// the same transaction. Two workers racing on the same row never both win —
/// `SKIP LOCKED` means the loser simply doesn't see the row as a candidate.
pub struct PostgresDao {
    pool: PgPool,
}

impl PostgresDao {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskDao for PostgresDao {
    async fn preempt(&self, owner: &str, lease_timeout_ms: i64) -> Result<Task, StorageError> {
        let mut tx = self.pool.begin().await?;

        let candidate: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM tasks
            WHERE (status = 'waiting' AND (next_exec_time IS NULL OR next_exec_time <= NOW()))
               OR (status = 'running' AND utime <= NOW() - ($1::bigint * INTERVAL '1 millisecond'))
            ORDER BY next_exec_time ASC NULLS FIRST, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(lease_timeout_ms)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id,)) = candidate else {
            return Err(StorageError::NoTaskAvailable);
        };

        let task: Task = sqlx::query_as(
            r#"
            UPDATE tasks
            SET status = 'running', owner = $2, utime = NOW()
            WHERE id = $1
            RETURNING id, name, executor, cron_expr, cfg, owner, status, next_exec_time, ctime, utime
            "#,
        )
        .bind(id)
        .bind(owner)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(task)
    }

    async fn update_utime(&self, id: i64, owner: &str) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE tasks SET utime = NOW() WHERE id = $1 AND owner = $2 AND status = 'running'",
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn update_next_time(&self, id: i64, next: DateTime<Utc>) -> Result<(), StorageError> {
        sqlx::query("UPDATE tasks SET next_exec_time = $2, utime = NOW() WHERE id = $1")
            .bind(id)
            .bind(next)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stop(&self, id: i64) -> Result<(), StorageError> {
        sqlx::query("UPDATE tasks SET status = 'paused', utime = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, id: i64, owner: &str) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE tasks SET status = 'waiting', owner = NULL, utime = NOW() WHERE id = $1 AND owner = $2",
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add(&self, task: &Task) -> Result<Task, StorageError> {
        let row: Task = sqlx::query_as(
            r#"
            INSERT INTO tasks (name, executor, cron_expr, cfg, status, next_exec_time, ctime, utime)
            VALUES ($1, $2, $3, $4, 'waiting', $5, NOW(), NOW())
            RETURNING id, name, executor, cron_expr, cfg, owner, status, next_exec_time, ctime, utime
            "#,
        )
        .bind(&task.name)
        .bind(&task.executor)
        .bind(&task.cron_expr)
        .bind(&task.cfg)
        .bind(task.next_exec_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list(&self) -> Result<Vec<Task>, StorageError> {
        let rows = sqlx::query_as(
            "SELECT id, name, executor, cron_expr, cfg, owner, status, next_exec_time, ctime, utime FROM tasks ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl ExecutionDao for PostgresDao {
    async fn upsert(&self, tid: i64, status: ExecStatus, progress: i16) -> Result<i64, StorageError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO executions (tid, status, progress, ctime, utime)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (tid) DO UPDATE SET status = $2, progress = $3, utime = NOW()
            RETURNING id
            "#,
        )
        .bind(tid)
        .bind(status.code())
        .bind(progress)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn update_progress(&self, eid: i64, progress: i16) -> Result<(), StorageError> {
        sqlx::query("UPDATE executions SET progress = $2, utime = NOW() WHERE id = $1")
            .bind(eid)
            .bind(progress)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_status(&self, eid: i64, status: ExecStatus, progress: i16) -> Result<(), StorageError> {
        sqlx::query("UPDATE executions SET status = $2, progress = $3, utime = NOW() WHERE id = $1")
            .bind(eid)
            .bind(status.code())
            .bind(progress)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_last_execution(&self, tid: i64) -> Result<Execution, StorageError> {
        let row: (i64, i64, i16, i16, DateTime<Utc>, DateTime<Utc>) = sqlx::query_as(
            "SELECT id, tid, status, progress, ctime, utime FROM executions WHERE tid = $1",
        )
        .bind(tid)
        .fetch_one(&self.pool)
        .await?;

        Ok(Execution {
            id: row.0,
            tid: row.1,
            status: ExecStatus::from_code(row.2),
            progress: row.3,
            ctime: row.4,
            utime: row.5,
        })
    }
}
