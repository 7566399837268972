//! Backend selection: one bundle of store handles, either all in memory or
//! all on the same Postgres pool.

use std::sync::Arc;

use sqlx::PgPool;

use crate::catalog::{CatalogStore, InMemoryCatalogStore, PostgresCatalogStore};
use crate::jobs::{InMemoryJobStore, JobStore, PostgresJobStore};
use crate::message_log::{InMemoryMessageLog, MessageLog, PostgresMessageLog};
use crate::progress::{InMemoryProgressStore, PostgresProgressStore, ProgressStore};
use crate::reply_context::{InMemoryReplyContextStore, PostgresReplyContextStore, ReplyContextStore};
use crate::scheduler::{InMemoryScheduleStore, PostgresScheduleStore, ScheduleStore};

#[derive(Clone)]
pub struct Stores {
    pub catalog: Arc<dyn CatalogStore>,
    pub progress: Arc<dyn ProgressStore>,
    pub reply_contexts: Arc<dyn ReplyContextStore>,
    pub messages: Arc<dyn MessageLog>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub jobs: Arc<dyn JobStore>,
}

impl Stores {
    /// Process-local stores. Nothing survives a restart.
    pub fn in_memory() -> Self {
        Self {
            catalog: Arc::new(InMemoryCatalogStore::new()),
            progress: Arc::new(InMemoryProgressStore::new()),
            reply_contexts: Arc::new(InMemoryReplyContextStore::new()),
            messages: Arc::new(InMemoryMessageLog::new()),
            schedules: Arc::new(InMemoryScheduleStore::new()),
            jobs: InMemoryJobStore::arc(),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            catalog: Arc::new(PostgresCatalogStore::new(pool.clone())),
            progress: Arc::new(PostgresProgressStore::new(pool.clone())),
            reply_contexts: Arc::new(PostgresReplyContextStore::new(pool.clone())),
            messages: Arc::new(PostgresMessageLog::new(pool.clone())),
            schedules: Arc::new(PostgresScheduleStore::new(pool.clone())),
            jobs: Arc::new(PostgresJobStore::new(pool)),
        }
    }
}
