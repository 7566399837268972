//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_next` selects the oldest ready row of a lane with
//! `FOR UPDATE SKIP LOCKED` and flips it to `running` in the same statement,
//! so concurrent workers (in one process or several) never claim the same job.
//!
//! ## Deduplication
//!
//! A partial unique index on `(queue, idempotency_key)` backs the idempotency
//! guarantee. Dead-lettered jobs are moved to `dead_letter_jobs`, which frees
//! their key.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use crate::db::{to_i32, to_u32};

use super::store::{EnqueueOutcome, JobStats, JobStore, JobStoreError, PurgeReport};
use super::types::{DeadLetterEntry, Job, JobId, JobKind, JobStatus, QueueName};

const JOB_COLUMNS: &str = "id, queue, kind, idempotency_key, payload, status, attempt, last_error, \
                           retry_policy, history, created_at, updated_at, scheduled_at";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn insert_job(&self, job: &Job) -> Result<Option<JobId>, JobStoreError> {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (
                id, queue, kind, idempotency_key, payload, status, attempt, last_error,
                retry_policy, history, created_at, updated_at, scheduled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (queue, idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.id.0)
        .bind(job.queue.as_str())
        .bind(job.kind.type_name())
        .bind(&job.idempotency_key)
        .bind(&job.payload)
        .bind(job.status.label())
        .bind(to_i32(job.attempt))
        .bind(job.last_error())
        .bind(to_json(&job.retry_policy)?)
        .bind(to_json(&job.history)?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.scheduled_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(inserted.map(JobId::from_uuid))
    }

    async fn find_key_holder(&self, job: &Job) -> Result<Option<JobId>, JobStoreError> {
        let existing: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE queue = $1 AND idempotency_key = $2",
        )
        .bind(job.queue.as_str())
        .bind(&job.idempotency_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue_duplicate_lookup", e))?;

        Ok(existing.map(JobId::from_uuid))
    }
}

/// Insert attempts before giving up on a key whose holder keeps vanishing.
const ENQUEUE_ATTEMPTS: usize = 2;

/// Insert, or report the live job holding the idempotency key. The holder can
/// be dead-lettered between the two statements; the insert is then retried.
async fn insert_or_find<I, IF, L, LF>(
    mut insert: I,
    mut find_holder: L,
) -> Result<EnqueueOutcome, JobStoreError>
where
    I: FnMut() -> IF,
    IF: Future<Output = Result<Option<JobId>, JobStoreError>>,
    L: FnMut() -> LF,
    LF: Future<Output = Result<Option<JobId>, JobStoreError>>,
{
    for _ in 0..ENQUEUE_ATTEMPTS {
        if let Some(id) = insert().await? {
            return Ok(EnqueueOutcome::Enqueued(id));
        }
        if let Some(id) = find_holder().await? {
            return Ok(EnqueueOutcome::Duplicate(id));
        }
    }
    Err(JobStoreError::Storage(
        "enqueue: idempotency key conflict could not be resolved".to_string(),
    ))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("{operation}: {err}"))
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Serialization(e.to_string());

    let queue: String = row.try_get("queue").map_err(decode)?;
    let kind: String = row.try_get("kind").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let attempt = to_u32(row.try_get("attempt").map_err(decode)?);
    let last_error: Option<String> = row.try_get("last_error").map_err(decode)?;

    let status = match status.as_str() {
        "pending" => JobStatus::Pending,
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed {
            error: last_error.unwrap_or_default(),
            attempt,
        },
        other => {
            return Err(JobStoreError::Serialization(format!(
                "unknown job status {other}"
            )));
        }
    };

    let retry_policy: serde_json::Value = row.try_get("retry_policy").map_err(decode)?;
    let history: serde_json::Value = row.try_get("history").map_err(decode)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(decode)?),
        queue: QueueName::parse(&queue)
            .ok_or_else(|| JobStoreError::Serialization(format!("unknown queue {queue}")))?,
        kind: JobKind::parse(&kind)
            .ok_or_else(|| JobStoreError::Serialization(format!("unknown job kind {kind}")))?,
        idempotency_key: row.try_get("idempotency_key").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        status,
        retry_policy: serde_json::from_value(retry_policy)
            .map_err(|e| JobStoreError::Serialization(e.to_string()))?,
        attempt,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        scheduled_at: row.try_get("scheduled_at").map_err(decode)?,
        history: serde_json::from_value(history)
            .map_err(|e| JobStoreError::Serialization(e.to_string()))?,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, JobStoreError> {
    serde_json::to_value(value).map_err(|e| JobStoreError::Serialization(e.to_string()))
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue), err)]
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError> {
        let (store, job) = (self, &job);
        insert_or_find(move || store.insert_job(job), move || store.find_key_holder(job)).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, attempt = $3, last_error = $4, history = $5,
                updated_at = $6, scheduled_at = $7, payload = $8
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(job.status.label())
        .bind(to_i32(job.attempt))
        .bind(job.last_error())
        .bind(to_json(&job.history)?)
        .bind(job.updated_at)
        .bind(job.scheduled_at)
        .bind(&job.payload)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job.id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %queue))]
    async fn claim_next(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'running', attempt = attempt + 1, updated_at = $2
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = $1
                  AND status IN ('pending', 'failed')
                  AND (scheduled_at IS NULL OR scheduled_at <= $2)
                ORDER BY created_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(queue.as_str())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn list(&self, queue: Option<QueueName>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE ($1::TEXT IS NULL OR queue = $1)
            ORDER BY created_at
            LIMIT $2
            "#
        ))
        .bind(queue.map(|q| q.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobStoreError> {
        job.status = JobStatus::DeadLettered {
            error: reason.clone(),
            attempts: job.attempt,
        };
        job.updated_at = Utc::now();
        let entry = DeadLetterEntry::new(job, reason);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("dead_letter_begin", e))?;

        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(entry.job.id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("dead_letter_delete", e))?;

        sqlx::query(
            r#"
            INSERT INTO dead_letter_jobs (id, queue, job, reason, dead_lettered_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET job = EXCLUDED.job, reason = EXCLUDED.reason,
                dead_lettered_at = EXCLUDED.dead_lettered_at
            "#,
        )
        .bind(entry.job.id.0)
        .bind(entry.job.queue.as_str())
        .bind(to_json(&entry.job)?)
        .bind(&entry.reason)
        .bind(entry.dead_lettered_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("dead_letter_insert", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("dead_letter_commit", e))
    }

    async fn list_dead_letters(
        &self,
        queue: Option<QueueName>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job, reason, dead_lettered_at FROM dead_letter_jobs
            WHERE ($1::TEXT IS NULL OR queue = $1)
            ORDER BY dead_lettered_at
            LIMIT $2
            "#,
        )
        .bind(queue.map(|q| q.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter()
            .map(|row| {
                let decode = |e: sqlx::Error| JobStoreError::Serialization(e.to_string());
                let job: serde_json::Value = row.try_get("job").map_err(decode)?;
                Ok(DeadLetterEntry {
                    job: serde_json::from_value(job)
                        .map_err(|e| JobStoreError::Serialization(e.to_string()))?,
                    reason: row.try_get("reason").map_err(decode)?,
                    dead_lettered_at: row.try_get("dead_lettered_at").map_err(decode)?,
                })
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("retry_dead_letter_begin", e))?;

        let stored: Option<serde_json::Value> =
            sqlx::query_scalar("DELETE FROM dead_letter_jobs WHERE id = $1 RETURNING job")
                .bind(job_id.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("retry_dead_letter_delete", e))?;

        let stored = stored.ok_or(JobStoreError::NotFound(job_id))?;
        let mut job: Job = serde_json::from_value(stored)
            .map_err(|e| JobStoreError::Serialization(e.to_string()))?;
        job.reset();

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue, kind, idempotency_key, payload, status, attempt, last_error,
                retry_policy, history, created_at, updated_at, scheduled_at
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, NULL, $6, '[]'::jsonb, $7, $8, NULL)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(job.id.0)
        .bind(job.queue.as_str())
        .bind(job.kind.type_name())
        .bind(&job.idempotency_key)
        .bind(&job.payload)
        .bind(to_json(&job.retry_policy)?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("retry_dead_letter_insert", e))?;

        if inserted.rows_affected() == 0 {
            // A newer live job already holds the idempotency key.
            return Err(JobStoreError::AlreadyExists(job_id));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("retry_dead_letter_commit", e))?;
        Ok(job)
    }

    async fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query("DELETE FROM dead_letter_jobs WHERE id = $1")
            .bind(job_id.0)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_dead_letter", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    async fn requeue_running(&self) -> Result<usize, JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', updated_at = NOW() WHERE status = 'running'",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_running", e))?;

        Ok(result.rows_affected() as usize)
    }

    async fn purge(
        &self,
        completed_before: DateTime<Utc>,
        dead_letters_before: DateTime<Utc>,
    ) -> Result<PurgeReport, JobStoreError> {
        let completed =
            sqlx::query("DELETE FROM jobs WHERE status = 'completed' AND updated_at < $1")
                .bind(completed_before)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("purge_completed", e))?
                .rows_affected();

        let dead_letters = sqlx::query("DELETE FROM dead_letter_jobs WHERE dead_lettered_at < $1")
            .bind(dead_letters_before)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_dead_letters", e))?
            .rows_affected();

        Ok(PurgeReport {
            completed: completed as usize,
            dead_letters: dead_letters as usize,
        })
    }

    async fn stats(&self, queue: QueueName) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM jobs WHERE queue = $1 GROUP BY status",
        )
        .bind(queue.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Serialization(e.to_string()))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| JobStoreError::Serialization(e.to_string()))?;
            let count = count.max(0) as usize;
            match status.as_str() {
                "pending" => stats.pending += count,
                "running" => stats.running += count,
                "completed" => stats.completed += count,
                "failed" => stats.failed += count,
                _ => {}
            }
        }

        let dead: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letter_jobs WHERE queue = $1")
            .bind(queue.as_str())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats_dead_letters", e))?;
        stats.dead_lettered = dead.max(0) as usize;

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn answers(
        values: Vec<Option<JobId>>,
    ) -> impl FnMut() -> std::future::Ready<Result<Option<JobId>, JobStoreError>> {
        let mut values = values.into_iter();
        move || std::future::ready(Ok(values.next().flatten()))
    }

    #[tokio::test]
    async fn duplicate_reports_the_key_holder() {
        let holder = JobId::new();
        let outcome = insert_or_find(answers(vec![None]), answers(vec![Some(holder)]))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Duplicate(holder));
    }

    #[tokio::test]
    async fn insert_is_retried_when_holder_vanishes() {
        let job = JobId::new();
        let inserts = Cell::new(0);
        let mut insert = answers(vec![None, Some(job)]);
        let counted = || {
            inserts.set(inserts.get() + 1);
            insert()
        };

        // The holder was dead-lettered between the insert and the lookup.
        let outcome = insert_or_find(counted, answers(vec![None])).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Enqueued(job));
        assert_eq!(inserts.get(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_repeated_conflicts() {
        let result = insert_or_find(answers(vec![None, None]), answers(vec![None, None])).await;
        assert!(matches!(result, Err(JobStoreError::Storage(_))));
    }
}
