//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Queue lane. Each lane has its own workers, concurrency and rate budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Lesson,
    Reminder,
    Notification,
    Welcome,
    Text,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::Lesson,
        QueueName::Reminder,
        QueueName::Notification,
        QueueName::Welcome,
        QueueName::Text,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Lesson => "lesson",
            QueueName::Reminder => "reminder",
            QueueName::Notification => "notification",
            QueueName::Welcome => "welcome",
            QueueName::Text => "text",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|q| q.as_str() == value)
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job kind/type for routing to appropriate handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Full lesson sequence to one learner
    SendLesson,
    /// "Next lesson in two hours" heads-up
    SendReminder,
    /// Enrollment announcement for a course
    CourseNotification,
    /// First-enrollment greeting
    Welcome,
    /// Arbitrary text (feedback, fallback replies)
    FreeText,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::SendLesson,
        JobKind::SendReminder,
        JobKind::CourseNotification,
        JobKind::Welcome,
        JobKind::FreeText,
    ];

    pub fn type_name(&self) -> &'static str {
        match self {
            JobKind::SendLesson => "send_lesson",
            JobKind::SendReminder => "send_reminder",
            JobKind::CourseNotification => "course_notification",
            JobKind::Welcome => "welcome",
            JobKind::FreeText => "free_text",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.type_name() == value)
    }

    /// Lane this kind is normally enqueued on.
    pub fn default_queue(&self) -> QueueName {
        match self {
            JobKind::SendLesson => QueueName::Lesson,
            JobKind::SendReminder => QueueName::Reminder,
            JobKind::CourseNotification => QueueName::Notification,
            JobKind::Welcome => QueueName::Welcome,
            JobKind::FreeText => QueueName::Text,
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Currently being executed
    Running,
    /// Completed successfully
    Completed,
    /// Failed, will be retried
    Failed { error: String, attempt: u32 },
    /// Exhausted retries or failed permanently, moved to DLQ
    DeadLettered { error: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered { .. })
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, JobStatus::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed { .. } => "failed",
            JobStatus::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, the first try included
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Calculate delay after a failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay)
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Handler failure, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// Worth retrying (timeouts, throttling, provider outages)
    #[error("transient failure: {0}")]
    Transient(String),
    /// Retrying cannot help (bad recipient, missing lesson, malformed payload)
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl JobError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, JobError::Permanent(_))
    }

    pub fn message(&self) -> &str {
        match self {
            JobError::Transient(msg) | JobError::Permanent(msg) => msg,
        }
    }
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Lane the job runs on
    pub queue: QueueName,
    /// Job kind for routing
    pub kind: JobKind,
    /// Deduplication key, unique per lane among live jobs
    pub idempotency_key: Option<String>,
    /// JSON payload
    pub payload: serde_json::Value,
    /// Current status
    pub status: JobStatus,
    /// Retry policy
    pub retry_policy: RetryPolicy,
    /// Current attempt number (starts at 0)
    pub attempt: u32,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the job was last updated
    pub updated_at: DateTime<Utc>,
    /// When the job should next be executed (backoff)
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Execution history (errors from previous attempts)
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Job {
    /// Create a new job.
    pub fn new(queue: QueueName, kind: JobKind, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue,
            kind,
            idempotency_key: None,
            payload,
            status: JobStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            history: Vec::new(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set a custom retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Schedule the job for later execution.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Check if the job is ready to execute at `now`.
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Whether the job still occupies its idempotency key.
    pub fn is_live(&self) -> bool {
        !matches!(self.status, JobStatus::DeadLettered { .. })
    }

    /// Mark job as running.
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.updated_at = now;
        self.scheduled_at = None;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: true,
            error: None,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    /// Mark job as failed.
    ///
    /// Transient failures are rescheduled with backoff while attempts remain;
    /// permanent failures and exhausted jobs become dead-lettered.
    pub fn mark_failed(&mut self, error: &JobError, started_at: DateTime<Utc>) {
        let now = Utc::now();
        let message = error.message().to_string();
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: false,
            error: Some(message.clone()),
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });

        if !error.is_permanent() && self.retry_policy.should_retry(self.attempt) {
            // Schedule retry with backoff
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.status = JobStatus::Failed {
                error: message,
                attempt: self.attempt,
            };
        } else {
            // Move to dead letter
            self.status = JobStatus::DeadLettered {
                error: message,
                attempts: self.attempt,
            };
        }
    }

    /// Reset for a fresh run (dead-letter retry, crash recovery).
    pub fn reset(&mut self) {
        self.status = JobStatus::Pending;
        self.attempt = 0;
        self.scheduled_at = None;
        self.updated_at = Utc::now();
        self.history.clear();
    }

    /// Last recorded error, if any.
    pub fn last_error(&self) -> Option<&str> {
        match &self.status {
            JobStatus::Failed { error, .. } | JobStatus::DeadLettered { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String) -> Self {
        Self {
            job,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            QueueName::Lesson,
            JobKind::SendLesson,
            serde_json::json!({"key": "value"}),
        )
    }

    #[test]
    fn exponential_backoff_doubles_from_base() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(240));
    }

    #[test]
    fn backoff_is_capped() {
        let policy =
            RetryPolicy::exponential(50, Duration::from_secs(60), Duration::from_secs(600));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(600));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(600));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_counts_total_attempts() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn job_lifecycle() {
        let mut job = job();

        assert!(matches!(job.status, JobStatus::Pending));
        assert_eq!(job.attempt, 0);

        job.mark_running();
        assert!(matches!(job.status, JobStatus::Running));
        assert_eq!(job.attempt, 1);

        let started = Utc::now();
        job.mark_completed(started);
        assert!(matches!(job.status, JobStatus::Completed));
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
    }

    #[test]
    fn transient_failures_retry_until_exhausted() {
        let mut job = job();
        let error = JobError::transient("provider timeout");

        for expected_attempt in 1..=2 {
            job.mark_running();
            job.mark_failed(&error, Utc::now());
            assert_eq!(
                job.status,
                JobStatus::Failed {
                    error: "provider timeout".to_string(),
                    attempt: expected_attempt
                }
            );
            assert!(job.scheduled_at.is_some());
        }

        job.mark_running();
        job.mark_failed(&error, Utc::now());
        assert!(matches!(
            job.status,
            JobStatus::DeadLettered { attempts: 3, .. }
        ));
        assert_eq!(job.history.len(), 3);
    }

    #[test]
    fn permanent_failure_dead_letters_immediately() {
        let mut job = job();
        job.mark_running();
        job.mark_failed(&JobError::permanent("invalid recipient"), Utc::now());
        assert!(matches!(
            job.status,
            JobStatus::DeadLettered { attempts: 1, .. }
        ));
        assert_eq!(job.last_error(), Some("invalid recipient"));
    }

    #[test]
    fn queue_and_kind_names_round_trip() {
        for queue in QueueName::ALL {
            assert_eq!(QueueName::parse(queue.as_str()), Some(queue));
        }
        for kind in JobKind::ALL {
            assert_eq!(JobKind::parse(kind.type_name()), Some(kind));
        }
        assert_eq!(QueueName::parse("bulk"), None);
        assert_eq!(JobKind::SendReminder.default_queue(), QueueName::Reminder);
    }
}
