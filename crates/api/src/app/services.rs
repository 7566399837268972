//! Service wiring: stores, queue, scheduler, delivery handlers and ingestion,
//! assembled once per process and shared by every handler.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use microlearn_infra::config::AppConfig;
use microlearn_infra::courses::CourseService;
use microlearn_infra::delivery::{Outbox, register_delivery_handlers};
use microlearn_infra::ingestion::WebhookIngestion;
use microlearn_infra::jobs::{JobExecutor, JobQueue, WorkerPool, WorkerPoolHandle};
use microlearn_infra::maintenance::{Maintenance, RetentionPolicy};
use microlearn_infra::progress::ProgressTracker;
use microlearn_infra::reply_context::ReplyContextService;
use microlearn_infra::scheduler::{LessonScheduler, SchedulerError};
use microlearn_infra::Stores;
use microlearn_messaging::MessagingGateway;
use microlearn_progress::AnswerMatcher;

pub struct AppServices {
    pub stores: Stores,
    pub queue: JobQueue,
    pub scheduler: Arc<LessonScheduler>,
    pub courses: CourseService,
    pub ingestion: WebhookIngestion,
    pub executor: Arc<JobExecutor>,
    pub contexts: ReplyContextService,
    pub webhook_verify_token: String,
    pub admin_api_token: String,
}

/// Wire every service on top of `stores`, sending through `gateway`.
pub fn build_services(
    config: &AppConfig,
    stores: Stores,
    gateway: Arc<dyn MessagingGateway>,
) -> AppServices {
    let queue = JobQueue::new(stores.jobs.clone(), config.retry_policy());
    let contexts = ReplyContextService::new(stores.reply_contexts.clone(), config.context_ttl);

    let scheduler = Arc::new(LessonScheduler::new(
        stores.schedules.clone(),
        stores.catalog.clone(),
        queue.clone(),
        config.default_timezone,
    ));

    let outbox = Arc::new(Outbox::new(
        gateway,
        stores.messages.clone(),
        contexts.clone(),
        config.send_timeout,
        config.message_delay,
    ));
    let mut executor = JobExecutor::new(stores.jobs.clone(), config.job_timeout);
    register_delivery_handlers(
        &mut executor,
        stores.catalog.clone(),
        outbox,
        config.welcome_template.clone(),
    );

    let tracker = Arc::new(ProgressTracker::new(
        stores.catalog.clone(),
        stores.progress.clone(),
        AnswerMatcher::default(),
    ));
    let ingestion = WebhookIngestion::new(
        stores.messages.clone(),
        contexts.clone(),
        tracker,
        queue.clone(),
    );

    let courses = CourseService::new(stores.catalog.clone(), queue.clone(), scheduler.clone());

    AppServices {
        stores,
        queue,
        scheduler,
        courses,
        ingestion,
        executor: Arc::new(executor),
        contexts,
        webhook_verify_token: config.webhook_verify_token.clone(),
        admin_api_token: config.admin_api_token.clone(),
    }
}

/// Handles to everything running beside the HTTP server.
pub struct BackgroundTasks {
    workers: WorkerPoolHandle,
    maintenance: JoinHandle<()>,
    cancel: CancellationToken,
    scheduler: Arc<LessonScheduler>,
}

impl BackgroundTasks {
    /// Stop timers first so no new jobs appear, then drain the workers.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        self.cancel.cancel();
        if let Err(e) = self.maintenance.await {
            tracing::warn!(error = %e, "maintenance task ended abnormally");
        }
        self.workers.shutdown().await;
    }
}

impl AppServices {
    /// Recover work left by a previous process and start workers, schedule
    /// timers and the maintenance sweep.
    pub async fn start_background(&self, config: &AppConfig) -> Result<BackgroundTasks, SchedulerError> {
        let requeued = self.stores.jobs.requeue_running().await?;
        if requeued > 0 {
            tracing::info!(requeued, "requeued jobs left running by a previous process");
        }

        let workers = WorkerPool::start(self.executor.clone(), config.worker_pool());

        let restored = self.scheduler.restore(Utc::now()).await?;
        tracing::info!(restored, "course schedules restored");

        let cancel = CancellationToken::new();
        let maintenance = Maintenance::new(
            self.stores.jobs.clone(),
            self.contexts.clone(),
            RetentionPolicy {
                completed_jobs: config.completed_retention,
                dead_letters: config.failed_retention,
                context_fallback_age: config.context_fallback_age,
            },
        );
        let maintenance = tokio::spawn(maintenance.run(
            config.sweep_interval.max(Duration::from_secs(1)),
            cancel.clone(),
        ));

        Ok(BackgroundTasks {
            workers,
            maintenance,
            cancel,
            scheduler: self.scheduler.clone(),
        })
    }
}
