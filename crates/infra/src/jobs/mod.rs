//! Background job system: lanes, retry with backoff, dead letters.
//!
//! ## Components
//!
//! - `Job`: a typed payload with lane, idempotency key and retry state
//! - `JobStore`: persistence (in-memory or Postgres), dedupe and claiming
//! - `JobQueue`: producer-side enqueue with the configured retry policy
//! - `JobExecutor`: routes claimed jobs to handlers and records the result
//! - `WorkerPool`: per-lane consumer loops with concurrency and rate limits

pub mod executor;
pub mod pool;
pub mod postgres;
pub mod queue;
pub mod rate_limit;
pub mod store;
pub mod types;

pub use executor::{ExecutionOutcome, ExecutorStats, JobExecutor, JobHandler};
pub use pool::{LaneConfig, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use postgres::PostgresJobStore;
pub use queue::JobQueue;
pub use rate_limit::{RateLimiter, SlidingWindow};
pub use store::{EnqueueOutcome, InMemoryJobStore, JobStats, JobStore, JobStoreError, PurgeReport};
pub use types::{
    BackoffStrategy, DeadLetterEntry, Job, JobError, JobId, JobKind, JobStatus, QueueName,
    RetryPolicy,
};
