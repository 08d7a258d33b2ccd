//! Postgres-backed job store.
//!
//! Jobs are stored as a JSONB body next to the few columns the claim query
//! filters and orders on (`queue`, `status`, `scheduled_at`,
//! `claim_expires_at`, `created_at`). Claims run in a transaction that locks
//! the candidate row with `FOR UPDATE SKIP LOCKED`, so concurrent workers
//! (in this process or another) never receive the same job while its claim
//! is live.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use super::store::{JobStats, JobStore, JobStoreError, reset_for_retry};
use super::types::{DeadLetterEntry, Job, JobId, JobStatus, QueueName};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS ticketflow_jobs (
        id               UUID PRIMARY KEY,
        queue            TEXT NOT NULL,
        status           TEXT NOT NULL,
        scheduled_at     TIMESTAMPTZ,
        claim_expires_at TIMESTAMPTZ,
        created_at       TIMESTAMPTZ NOT NULL,
        body             JSONB NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ticketflow_jobs_claim_idx
        ON ticketflow_jobs (queue, status, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ticketflow_dead_letters (
        id               UUID PRIMARY KEY,
        queue            TEXT NOT NULL,
        reason           TEXT NOT NULL,
        dead_lettered_at TIMESTAMPTZ NOT NULL,
        body             JSONB NOT NULL
    )
    "#,
];

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue), err)]
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO ticketflow_jobs
                (id, queue, status, scheduled_at, claim_expires_at, created_at, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.queue.as_str())
        .bind(job.status.label())
        .bind(job.scheduled_at)
        .bind(job.claim_expires_at)
        .bind(job.created_at)
        .bind(Json(&job))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;

        Ok(job.id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT body FROM ticketflow_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self, claim_timeout), err)]
    async fn claim_next(
        &self,
        queue: QueueName,
        claim_timeout: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        let now = Utc::now();
        let row = sqlx::query(
            r#"
            SELECT body
            FROM ticketflow_jobs
            WHERE queue = $1
              AND (
                    (status IN ('pending', 'retrying')
                        AND (scheduled_at IS NULL OR scheduled_at <= $2))
                 OR (status = 'running' AND claim_expires_at <= $2)
              )
            ORDER BY created_at, id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(queue.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let Some(row) = row else {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("claim_next", e))?;
            return Ok(None);
        };

        let mut job = decode_job(&row)?;
        job.mark_running(claim_timeout);
        write_job(&mut *tx, &job, "claim_next").await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;
        Ok(Some(job))
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("update", e))?;
        write_job(&mut *conn, job, "update").await
    }

    async fn complete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query("DELETE FROM ticketflow_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("complete", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue), err)]
    async fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobStoreError> {
        if !job.status.is_terminal() {
            job.status = JobStatus::DeadLettered {
                error: reason.clone(),
                attempts: job.attempt,
            };
        }
        job.claim_expires_at = None;
        job.updated_at = Utc::now();
        let entry = DeadLetterEntry::new(job, reason);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("dead_letter", e))?;

        sqlx::query("DELETE FROM ticketflow_jobs WHERE id = $1")
            .bind(entry.job.id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("dead_letter", e))?;

        sqlx::query(
            r#"
            INSERT INTO ticketflow_dead_letters (id, queue, reason, dead_lettered_at, body)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
               SET reason = EXCLUDED.reason,
                   dead_lettered_at = EXCLUDED.dead_lettered_at,
                   body = EXCLUDED.body
            "#,
        )
        .bind(entry.job.id.as_uuid())
        .bind(entry.job.queue.as_str())
        .bind(&entry.reason)
        .bind(entry.dead_lettered_at)
        .bind(Json(&entry.job))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("dead_letter", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("dead_letter", e))
    }

    async fn list_dead_letters(
        &self,
        queue: QueueName,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT body, reason, dead_lettered_at
            FROM ticketflow_dead_letters
            WHERE queue = $1
            ORDER BY dead_lettered_at
            LIMIT $2
            "#,
        )
        .bind(queue.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter()
            .map(|row| {
                let job = decode_job(row)?;
                let reason: String = row
                    .try_get("reason")
                    .map_err(|e| JobStoreError::Storage(e.to_string()))?;
                let dead_lettered_at: DateTime<Utc> = row
                    .try_get("dead_lettered_at")
                    .map_err(|e| JobStoreError::Storage(e.to_string()))?;
                Ok(DeadLetterEntry {
                    job,
                    dead_lettered_at,
                    reason,
                })
            })
            .collect()
    }

    async fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("retry_dead_letter", e))?;

        let row = sqlx::query("DELETE FROM ticketflow_dead_letters WHERE id = $1 RETURNING body")
            .bind(job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("retry_dead_letter", e))?
            .ok_or(JobStoreError::NotFound(job_id))?;

        let job = reset_for_retry(decode_job(&row)?);
        sqlx::query(
            r#"
            INSERT INTO ticketflow_jobs
                (id, queue, status, scheduled_at, claim_expires_at, created_at, body)
            VALUES ($1, $2, $3, NULL, NULL, $4, $5)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.queue.as_str())
        .bind(job.status.label())
        .bind(job.created_at)
        .bind(Json(&job))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("retry_dead_letter", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("retry_dead_letter", e))?;
        Ok(job)
    }

    async fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query("DELETE FROM ticketflow_dead_letters WHERE id = $1")
            .bind(job_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_dead_letter", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    async fn stats(&self, queue: QueueName) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n FROM ticketflow_jobs WHERE queue = $1 GROUP BY status
            UNION ALL
            SELECT 'dead_lettered', COUNT(*) FROM ticketflow_dead_letters WHERE queue = $1
            "#,
        )
        .bind(queue.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Storage(e.to_string()))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| JobStoreError::Storage(e.to_string()))?;
            let n = n.max(0) as usize;
            match status.as_str() {
                "pending" => stats.pending += n,
                "running" => stats.running += n,
                "retrying" => stats.retrying += n,
                "dead_lettered" => stats.dead_lettered += n,
                _ => {}
            }
        }
        Ok(stats)
    }
}

async fn write_job<'c, E>(executor: E, job: &Job, operation: &str) -> Result<(), JobStoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE ticketflow_jobs
           SET status = $2,
               scheduled_at = $3,
               claim_expires_at = $4,
               body = $5
         WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.label())
    .bind(job.scheduled_at)
    .bind(job.claim_expires_at)
    .bind(Json(job))
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;

    if result.rows_affected() == 0 {
        return Err(JobStoreError::NotFound(job.id));
    }
    Ok(())
}

fn decode_job(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let Json(job): Json<Job> = row
        .try_get("body")
        .map_err(|e| JobStoreError::Payload(format!("failed to decode job row: {e}")))?;
    Ok(job)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}
