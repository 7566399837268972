//! Job storage implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::types::{DeadLetterEntry, Job, JobId, JobStatus, QueueName};

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "outcome", content = "job_id", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// A new job was stored.
    Enqueued(JobId),
    /// A live job with the same (queue, idempotency key) already exists.
    Duplicate(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueOutcome::Enqueued(id) | EnqueueOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate(_))
    }
}

/// Counts removed by [`JobStore::purge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PurgeReport {
    pub completed: usize,
    pub dead_letters: usize,
}

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enqueue a new job, unless a live job on the same lane holds its
    /// idempotency key.
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Update a job.
    async fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the oldest job on `queue` that is ready at `now`, marking it running.
    /// Returns None if no jobs are available.
    async fn claim_next(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// List live jobs, oldest first.
    async fn list(&self, queue: Option<QueueName>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Move a job to the dead-letter queue.
    async fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError>;

    /// List dead-lettered jobs, oldest first.
    async fn list_dead_letters(
        &self,
        queue: Option<QueueName>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Retry a dead-lettered job (move back to pending).
    async fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Delete a dead-lettered job.
    async fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// Put jobs left `running` by a previous process back to pending.
    async fn requeue_running(&self) -> Result<usize, JobStoreError>;

    /// Drop completed jobs finished before `completed_before` and dead letters
    /// recorded before `dead_letters_before`.
    async fn purge(
        &self,
        completed_before: DateTime<Utc>,
        dead_letters_before: DateTime<Utc>,
    ) -> Result<PurgeReport, JobStoreError>;

    /// Get job statistics for one lane.
    async fn stats(&self, queue: QueueName) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid job payload: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl JobStats {
    /// Jobs still waiting to run (fresh or awaiting retry).
    pub fn depth(&self) -> usize {
        self.pending + self.failed
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }

        if let Some(key) = &job.idempotency_key {
            let existing = jobs.values().find(|j| {
                j.queue == job.queue && j.is_live() && j.idempotency_key.as_deref() == Some(key)
            });
            if let Some(existing) = existing {
                return Ok(EnqueueOutcome::Duplicate(existing.id));
            }
        }

        let id = job.id;
        jobs.insert(id, job);
        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    async fn claim_next(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().await;

        // Oldest ready job on this lane (FIFO by creation)
        let candidate = jobs
            .values()
            .filter(|j| {
                j.queue == queue
                    && matches!(j.status, JobStatus::Pending | JobStatus::Failed { .. })
                    && j.is_ready_at(now)
            })
            .min_by_key(|j| (j.created_at, j.id.0))
            .map(|j| j.id);

        Ok(candidate.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_running();
                job.clone()
            })
        }))
    }

    async fn list(&self, queue: Option<QueueName>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().await;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| queue.is_none_or(|q| j.queue == q))
            .cloned()
            .collect();

        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let mut dls = self.dead_letters.write().await;

        job.status = JobStatus::DeadLettered {
            error: reason.clone(),
            attempts: job.attempt,
        };
        job.updated_at = Utc::now();

        jobs.remove(&job.id);
        dls.insert(job.id, DeadLetterEntry::new(job, reason));

        Ok(())
    }

    async fn list_dead_letters(
        &self,
        queue: Option<QueueName>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let dls = self.dead_letters.read().await;
        let mut result: Vec<_> = dls
            .values()
            .filter(|e| queue.is_none_or(|q| e.job.queue == q))
            .cloned()
            .collect();

        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let mut dls = self.dead_letters.write().await;

        let entry = dls.get(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        // A newer live job may hold the key released by the dead letter.
        if let Some(key) = entry.job.idempotency_key.as_deref() {
            let taken = jobs.values().any(|j| {
                j.queue == entry.job.queue && j.is_live() && j.idempotency_key.as_deref() == Some(key)
            });
            if taken {
                return Err(JobStoreError::AlreadyExists(job_id));
            }
        }

        let Some(entry) = dls.remove(&job_id) else {
            return Err(JobStoreError::NotFound(job_id));
        };
        let mut job = entry.job;
        job.reset();

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.dead_letters
            .write()
            .await
            .remove(&job_id)
            .map(|_| ())
            .ok_or(JobStoreError::NotFound(job_id))
    }

    async fn requeue_running(&self) -> Result<usize, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let mut count = 0;
        for job in jobs.values_mut() {
            if matches!(job.status, JobStatus::Running) {
                job.status = JobStatus::Pending;
                job.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge(
        &self,
        completed_before: DateTime<Utc>,
        dead_letters_before: DateTime<Utc>,
    ) -> Result<PurgeReport, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let mut dls = self.dead_letters.write().await;

        let jobs_before = jobs.len();
        jobs.retain(|_, j| !(j.status == JobStatus::Completed && j.updated_at < completed_before));
        let dls_before = dls.len();
        dls.retain(|_, e| e.dead_lettered_at >= dead_letters_before);

        Ok(PurgeReport {
            completed: jobs_before - jobs.len(),
            dead_letters: dls_before - dls.len(),
        })
    }

    async fn stats(&self, queue: QueueName) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().await;
        let dls = self.dead_letters.read().await;

        let mut stats = JobStats::default();

        for job in jobs.values().filter(|j| j.queue == queue) {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }

        stats.dead_lettered += dls.values().filter(|e| e.job.queue == queue).count();

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobError, JobKind};

    fn lesson_job(key: &str) -> Job {
        Job::new(QueueName::Lesson, JobKind::SendLesson, serde_json::json!({}))
            .with_idempotency_key(key)
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();

        let job_id = store.enqueue(lesson_job("a")).await.unwrap().job_id();

        let claimed = store
            .claim_next(QueueName::Lesson, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, job_id);
        assert!(matches!(claimed.status, JobStatus::Running));
        assert_eq!(claimed.attempt, 1);

        // No more jobs
        assert!(
            store
                .claim_next(QueueName::Lesson, Utc::now())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn duplicate_key_on_same_lane_is_rejected() {
        let store = InMemoryJobStore::new();

        let first = store.enqueue(lesson_job("5:12:+900000000")).await.unwrap();
        let second = store.enqueue(lesson_job("5:12:+900000000")).await.unwrap();

        assert!(matches!(first, EnqueueOutcome::Enqueued(_)));
        assert_eq!(second, EnqueueOutcome::Duplicate(first.job_id()));
        assert_eq!(store.stats(QueueName::Lesson).await.unwrap().depth(), 1);

        // Same key on another lane is independent
        let other = Job::new(QueueName::Reminder, JobKind::SendReminder, serde_json::json!({}))
            .with_idempotency_key("5:12:+900000000");
        assert!(!store.enqueue(other).await.unwrap().is_duplicate());
    }

    #[tokio::test]
    async fn lanes_are_claimed_independently() {
        let store = InMemoryJobStore::new();
        store.enqueue(lesson_job("a")).await.unwrap();

        assert!(
            store
                .claim_next(QueueName::Welcome, Utc::now())
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .claim_next(QueueName::Lesson, Utc::now())
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn backoff_delays_claim() {
        let store = InMemoryJobStore::new();
        store.enqueue(lesson_job("a")).await.unwrap();

        let mut claimed = store
            .claim_next(QueueName::Lesson, Utc::now())
            .await
            .unwrap()
            .unwrap();
        claimed.mark_failed(&JobError::transient("timeout"), Utc::now());
        store.update(&claimed).await.unwrap();

        let now = Utc::now();
        assert!(store.claim_next(QueueName::Lesson, now).await.unwrap().is_none());

        let later = now + chrono::Duration::seconds(61);
        let retried = store.claim_next(QueueName::Lesson, later).await.unwrap().unwrap();
        assert_eq!(retried.attempt, 2);
    }

    #[tokio::test]
    async fn dead_letter_flow() {
        let store = InMemoryJobStore::new();

        let job = lesson_job("a");
        let job_id = job.id;
        store.enqueue(job).await.unwrap();

        let mut claimed = store
            .claim_next(QueueName::Lesson, Utc::now())
            .await
            .unwrap()
            .unwrap();
        claimed.mark_failed(&JobError::permanent("bad recipient"), Utc::now());

        store
            .dead_letter(claimed, "bad recipient".to_string())
            .await
            .unwrap();

        // Job is no longer in main queue
        assert!(store.get(job_id).await.unwrap().is_none());

        // Job is in DLQ
        let dls = store
            .list_dead_letters(Some(QueueName::Lesson), 10)
            .await
            .unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].job.id, job_id);
        assert!(
            store
                .list_dead_letters(Some(QueueName::Text), 10)
                .await
                .unwrap()
                .is_empty()
        );

        // Retry the job
        let retried = store.retry_dead_letter(job_id).await.unwrap();
        assert!(matches!(retried.status, JobStatus::Pending));
        assert_eq!(retried.attempt, 0);

        // DLQ is now empty
        assert!(store.list_dead_letters(None, 10).await.unwrap().is_empty());
        assert!(matches!(
            store.retry_dead_letter(job_id).await,
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn retrying_dead_letter_refuses_key_held_by_newer_job() {
        let store = InMemoryJobStore::new();
        let key = "5:12:+900000000";

        let first = store.enqueue(lesson_job(key)).await.unwrap().job_id();
        let claimed = store
            .claim_next(QueueName::Lesson, Utc::now())
            .await
            .unwrap()
            .unwrap();
        store
            .dead_letter(claimed, "provider unavailable".to_string())
            .await
            .unwrap();

        // Dead-lettered jobs release their idempotency key
        let fresh = store.enqueue(lesson_job(key)).await.unwrap();
        assert!(!fresh.is_duplicate());

        assert!(matches!(
            store.retry_dead_letter(first).await,
            Err(JobStoreError::AlreadyExists(id)) if id == first
        ));

        let live = store.list(Some(QueueName::Lesson), 10).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, fresh.job_id());
        // The dead letter stays put
        assert_eq!(store.list_dead_letters(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = InMemoryJobStore::new();

        for i in 0..5 {
            store.enqueue(lesson_job(&format!("k{i}"))).await.unwrap();
        }

        let stats = store.stats(QueueName::Lesson).await.unwrap();
        assert_eq!(stats.pending, 5);

        store.claim_next(QueueName::Lesson, Utc::now()).await.unwrap();
        store.claim_next(QueueName::Lesson, Utc::now()).await.unwrap();

        let stats = store.stats(QueueName::Lesson).await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.running, 2);

        assert_eq!(store.requeue_running().await.unwrap(), 2);
        assert_eq!(store.stats(QueueName::Lesson).await.unwrap().pending, 5);
    }

    #[tokio::test]
    async fn purge_respects_retention() {
        let store = InMemoryJobStore::new();
        store.enqueue(lesson_job("a")).await.unwrap();
        let mut job = store
            .claim_next(QueueName::Lesson, Utc::now())
            .await
            .unwrap()
            .unwrap();
        job.mark_completed(Utc::now());
        store.update(&job).await.unwrap();

        let report = store
            .purge(Utc::now() - chrono::Duration::hours(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(report.completed, 0);

        let report = store
            .purge(Utc::now() + chrono::Duration::seconds(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(report.completed, 1);
        assert!(store.get(job.id).await.unwrap().is_none());
    }
}
