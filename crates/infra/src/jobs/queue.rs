//! Producer-side enqueue API.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument};

use super::store::{EnqueueOutcome, JobStore, JobStoreError};
use super::types::{Job, JobKind, QueueName, RetryPolicy};

/// Typed enqueue front-end over a [`JobStore`], applying the configured
/// retry policy to every job.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    retry_policy: RetryPolicy,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            retry_policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Record a job durably. A second enqueue with the same key on the same
    /// lane, while the first job is still live, is a no-op.
    #[instrument(skip(self, payload, idempotency_key), fields(queue = %queue, kind = kind.type_name()))]
    pub async fn enqueue<P: Serialize>(
        &self,
        queue: QueueName,
        kind: JobKind,
        payload: &P,
        idempotency_key: impl Into<String>,
    ) -> Result<EnqueueOutcome, JobStoreError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| JobStoreError::Serialization(e.to_string()))?;
        let job = Job::new(queue, kind, payload)
            .with_idempotency_key(idempotency_key)
            .with_retry_policy(self.retry_policy.clone());

        let outcome = self.store.enqueue(job).await?;
        if outcome.is_duplicate() {
            debug!(job_id = %outcome.job_id(), "duplicate enqueue ignored");
        }
        Ok(outcome)
    }

    /// Enqueue on the kind's default lane.
    pub async fn enqueue_default<P: Serialize>(
        &self,
        kind: JobKind,
        payload: &P,
        idempotency_key: impl Into<String>,
    ) -> Result<EnqueueOutcome, JobStoreError> {
        self.enqueue(kind.default_queue(), kind, payload, idempotency_key)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;

    #[tokio::test]
    async fn enqueue_applies_policy_and_dedupes() {
        let store = InMemoryJobStore::arc();
        let queue = JobQueue::new(store.clone(), RetryPolicy::no_retry());

        let payload = serde_json::json!({"course_id": 5, "lesson_id": 12});
        let first = queue
            .enqueue(QueueName::Lesson, JobKind::SendLesson, &payload, "5:12:+900000000")
            .await
            .unwrap();
        let second = queue
            .enqueue(QueueName::Lesson, JobKind::SendLesson, &payload, "5:12:+900000000")
            .await
            .unwrap();

        assert!(second.is_duplicate());
        assert_eq!(second.job_id(), first.job_id());

        let job = store.get(first.job_id()).await.unwrap().unwrap();
        assert_eq!(job.retry_policy, RetryPolicy::no_retry());
        assert_eq!(job.payload, payload);
        assert_eq!(store.stats(QueueName::Lesson).await.unwrap().depth(), 1);
    }

    #[tokio::test]
    async fn default_lane_follows_kind() {
        let store = InMemoryJobStore::arc();
        let queue = JobQueue::new(store.clone(), RetryPolicy::default());

        queue
            .enqueue_default(JobKind::Welcome, &serde_json::json!({}), "welcome:1")
            .await
            .unwrap();

        assert_eq!(store.stats(QueueName::Welcome).await.unwrap().pending, 1);
    }
}
