//! Job executor with retry and backoff logic.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobError, JobKind, JobStatus, QueueName};

/// Executes one kind of job.
///
/// A handler performs the job's externally visible work and returns an error
/// for any failure; the executor turns that into a retry or a dead letter.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

/// What happened to a job after one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    RetryScheduled { at: Option<DateTime<Utc>> },
    DeadLettered { reason: String },
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Routes claimed jobs to their handlers and records the result.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    timeout: Duration,
    counters: Counters,
}

impl JobExecutor {
    /// Create an executor. `timeout` bounds every handler invocation.
    pub fn new(store: Arc<dyn JobStore>, timeout: Duration) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            timeout,
            counters: Counters::default(),
        }
    }

    /// Register the handler for a job kind, replacing any previous one.
    pub fn register_handler(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            jobs_processed: self.counters.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            jobs_retried: self.counters.retried.load(Ordering::Relaxed),
            jobs_dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Execute a job previously returned by [`JobStore::claim_next`].
    ///
    /// A missing handler is a permanent failure; exceeding the timeout is a
    /// transient one.
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue, kind = job.kind.type_name(), attempt = job.attempt))]
    pub async fn execute_one(&self, job: &mut Job) -> Result<ExecutionOutcome, JobStoreError> {
        let started = Utc::now();
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let result = match self.handlers.get(&job.kind) {
            None => Err(JobError::permanent(format!(
                "no handler for job kind: {}",
                job.kind.type_name()
            ))),
            Some(handler) => match tokio::time::timeout(self.timeout, handler.handle(job)).await {
                Ok(result) => result,
                Err(_) => Err(JobError::transient(format!(
                    "handler timed out after {}s",
                    self.timeout.as_secs()
                ))),
            },
        };

        match result {
            Ok(()) => {
                job.mark_completed(started);
                self.store.update(job).await?;
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!("job completed");
                Ok(ExecutionOutcome::Completed)
            }
            Err(error) => {
                job.mark_failed(&error, started);

                if matches!(job.status, JobStatus::DeadLettered { .. }) {
                    let reason = error.message().to_string();
                    warn!(error = %error, attempts = job.attempt, "job dead-lettered");
                    self.store.dead_letter(job.clone(), reason.clone()).await?;
                    self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    return Ok(ExecutionOutcome::DeadLettered { reason });
                }

                info!(error = %error, retry_at = ?job.scheduled_at, "job failed, retry scheduled");
                self.store.update(job).await?;
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                Ok(ExecutionOutcome::RetryScheduled {
                    at: job.scheduled_at,
                })
            }
        }
    }

    /// Run every job on `queue` that is ready now, one at a time.
    ///
    /// Returns the number of executions. Jobs rescheduled into the future are
    /// left for a later drain.
    pub async fn drain(&self, queue: QueueName) -> Result<usize, JobStoreError> {
        let mut executed = 0;
        while let Some(mut job) = self.store.claim_next(queue, Utc::now()).await? {
            self.execute_one(&mut job).await?;
            executed += 1;
        }
        Ok(executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::RetryPolicy;
    use std::sync::atomic::AtomicUsize;

    struct Succeed;

    #[async_trait]
    impl JobHandler for Succeed {
        async fn handle(&self, _job: &Job) -> Result<(), JobError> {
            Ok(())
        }
    }

    struct Fail(JobError, AtomicUsize);

    #[async_trait]
    impl JobHandler for Fail {
        async fn handle(&self, _job: &Job) -> Result<(), JobError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Err(self.0.clone())
        }
    }

    struct Hang;

    #[async_trait]
    impl JobHandler for Hang {
        async fn handle(&self, _job: &Job) -> Result<(), JobError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    fn text_job() -> Job {
        Job::new(QueueName::Text, JobKind::FreeText, serde_json::json!({}))
    }

    async fn claim(store: &InMemoryJobStore) -> Job {
        store
            .claim_next(QueueName::Text, Utc::now())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn execute_successful_job() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone(), Duration::from_secs(5));
        executor.register_handler(JobKind::FreeText, Arc::new(Succeed));

        store.enqueue(text_job()).await.unwrap();
        let mut claimed = claim(&store).await;

        let outcome = executor.execute_one(&mut claimed).await.unwrap();

        assert_eq!(outcome, ExecutionOutcome::Completed);
        let stored = store.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(executor.stats().jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn transient_failure_retries_then_dead_letters() {
        let store = InMemoryJobStore::arc();
        let handler = Arc::new(Fail(JobError::transient("503"), AtomicUsize::new(0)));
        let mut executor = JobExecutor::new(store.clone(), Duration::from_secs(5));
        executor.register_handler(JobKind::FreeText, handler.clone());

        let job = text_job().with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO));
        let job_id = job.id;
        store.enqueue(job).await.unwrap();

        let mut first = claim(&store).await;
        let outcome = executor.execute_one(&mut first).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::RetryScheduled { .. }));

        let mut second = claim(&store).await;
        assert_eq!(second.attempt, 2);
        let outcome = executor.execute_one(&mut second).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::DeadLettered { .. }));

        assert_eq!(handler.1.load(Ordering::SeqCst), 2);
        assert!(store.get(job_id).await.unwrap().is_none());
        let dead = store.list_dead_letters(None, 10).await.unwrap();
        assert_eq!(dead[0].job.id, job_id);
        assert_eq!(dead[0].reason, "503");
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let store = InMemoryJobStore::arc();
        let handler = Arc::new(Fail(JobError::permanent("bad recipient"), AtomicUsize::new(0)));
        let mut executor = JobExecutor::new(store.clone(), Duration::from_secs(5));
        executor.register_handler(JobKind::FreeText, handler.clone());

        store.enqueue(text_job()).await.unwrap();

        assert_eq!(executor.drain(QueueName::Text).await.unwrap(), 1);
        assert_eq!(handler.1.load(Ordering::SeqCst), 1);
        assert_eq!(store.stats(QueueName::Text).await.unwrap().dead_lettered, 1);
        assert_eq!(executor.stats().jobs_dead_lettered, 1);
    }

    #[tokio::test]
    async fn missing_handler_dead_letters() {
        let store = InMemoryJobStore::arc();
        let executor = JobExecutor::new(store.clone(), Duration::from_secs(5));

        store.enqueue(text_job()).await.unwrap();
        let mut claimed = claim(&store).await;

        let outcome = executor.execute_one(&mut claimed).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::DeadLettered {
                reason: "no handler for job kind: free_text".to_string()
            }
        );
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone(), Duration::from_millis(20));
        executor.register_handler(JobKind::FreeText, Arc::new(Hang));

        store.enqueue(text_job()).await.unwrap();
        let mut claimed = claim(&store).await;

        let outcome = executor.execute_one(&mut claimed).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::RetryScheduled { at: Some(_) }));
        assert!(claimed.status.is_retriable());
    }
}
