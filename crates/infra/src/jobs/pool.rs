//! Worker pool: one independent consumer loop per lane.
//!
//! Lanes never share concurrency or rate budget, so a lesson backlog cannot
//! hold up welcome messages. Each lane loop claims a job only after a
//! concurrency permit is free, then runs it on its own task once the lane's
//! rate limiter admits it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use super::executor::JobExecutor;
use super::rate_limit::RateLimiter;
use super::types::QueueName;

/// Per-lane worker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneConfig {
    /// Concurrent executions on this lane.
    pub concurrency: usize,
    /// Executions admitted per second.
    pub rate_limit_per_sec: usize,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_limit_per_sec: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub lanes: HashMap<QueueName, LaneConfig>,
    /// Sleep between polls of an empty lane.
    pub poll_interval: Duration,
}

impl WorkerPoolConfig {
    /// Same settings for every lane.
    pub fn uniform(lane: LaneConfig, poll_interval: Duration) -> Self {
        Self {
            lanes: QueueName::ALL.into_iter().map(|q| (q, lane)).collect(),
            poll_interval,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::uniform(LaneConfig::default(), Duration::from_millis(500))
    }
}

/// Running pool. Dropping the handle does not stop the workers; call
/// [`WorkerPoolHandle::shutdown`].
#[derive(Debug)]
pub struct WorkerPoolHandle {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl WorkerPoolHandle {
    /// Stop claiming new jobs and wait for in-flight executions to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("worker pool stopped");
    }
}

pub struct WorkerPool;

impl WorkerPool {
    /// Spawn one consumer loop per configured lane.
    pub fn start(executor: Arc<JobExecutor>, config: WorkerPoolConfig) -> WorkerPoolHandle {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        for (queue, lane) in config.lanes {
            let worker = LaneWorker {
                queue,
                executor: executor.clone(),
                limiter: Arc::new(RateLimiter::per_second(lane.rate_limit_per_sec)),
                permits: Arc::new(Semaphore::new(lane.concurrency.max(1))),
                poll_interval: config.poll_interval,
                cancel: cancel.clone(),
                tracker: tracker.clone(),
            };
            info!(
                queue = %queue,
                concurrency = lane.concurrency,
                rate_limit_per_sec = lane.rate_limit_per_sec,
                "lane worker started"
            );
            tracker.spawn(worker.run());
        }

        WorkerPoolHandle { cancel, tracker }
    }
}

struct LaneWorker {
    queue: QueueName,
    executor: Arc<JobExecutor>,
    limiter: Arc<RateLimiter>,
    permits: Arc<Semaphore>,
    poll_interval: Duration,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl LaneWorker {
    async fn run(self) {
        loop {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.executor.store().claim_next(self.queue, Utc::now()).await {
                Ok(Some(mut job)) => {
                    let executor = self.executor.clone();
                    let limiter = self.limiter.clone();
                    self.tracker.spawn(async move {
                        let _permit = permit;
                        limiter.acquire().await;
                        if let Err(e) = executor.execute_one(&mut job).await {
                            error!(job_id = %job.id, error = %e, "failed to record job result");
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if self.idle().await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(queue = %self.queue, error = %e, "failed to claim job");
                    if self.idle().await {
                        break;
                    }
                }
            }
        }
        info!(queue = %self.queue, "lane worker stopped");
    }

    /// Sleep one poll interval. Returns `true` when cancelled meanwhile.
    async fn idle(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(self.poll_interval) => false,
        }
    }
}
