//! Periodic cleanup: finished jobs past retention, old dead letters, and
//! expired reply contexts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::jobs::{JobStore, PurgeReport};
use crate::reply_context::ReplyContextService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed_jobs: Duration,
    pub dead_letters: Duration,
    pub context_fallback_age: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub jobs: PurgeReport,
    pub contexts: usize,
}

pub struct Maintenance {
    jobs: Arc<dyn JobStore>,
    contexts: ReplyContextService,
    retention: RetentionPolicy,
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Maintenance {
    pub fn new(jobs: Arc<dyn JobStore>, contexts: ReplyContextService, retention: RetentionPolicy) -> Self {
        Self {
            jobs,
            contexts,
            retention,
        }
    }

    /// One cleanup pass. Each part runs even when the other fails.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        match self
            .jobs
            .purge(
                before(now, self.retention.completed_jobs),
                before(now, self.retention.dead_letters),
            )
            .await
        {
            Ok(purged) => report.jobs = purged,
            Err(e) => tracing::error!(error = %e, "job purge failed"),
        }

        match self.contexts.sweep(now, self.retention.context_fallback_age).await {
            Ok(deleted) => report.contexts = deleted,
            Err(e) => tracing::error!(error = %e, "reply context sweep failed"),
        }

        report
    }

    /// Sweep every `interval` until `cancel` fires.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        tracing::info!(interval_secs = interval.as_secs(), "maintenance sweep started");

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("maintenance sweep stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.sweep(Utc::now()).await;
                    if report.jobs.completed + report.jobs.dead_letters + report.contexts > 0 {
                        tracing::info!(
                            completed_jobs = report.jobs.completed,
                            dead_letters = report.jobs.dead_letters,
                            contexts = report.contexts,
                            "maintenance sweep purged rows"
                        );
                    } else {
                        tracing::debug!("maintenance sweep: nothing to purge");
                    }
                }
            }
        }
    }
}
