use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use microlearn_infra::jobs::{DeadLetterEntry, JobStats, QueueName};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterQuery {
    pub queue: Option<String>,
    pub limit: Option<usize>,
}

impl DeadLetterQuery {
    pub fn queue(&self) -> Result<Option<QueueName>, axum::response::Response> {
        match self.queue.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => QueueName::parse(raw).map(Some).ok_or_else(|| {
                errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_queue",
                    "queue must be one of: lesson, reminder, notification, welcome, text",
                )
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(100).clamp(1, 1000)
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct QueueStatsView {
    pub queue: QueueName,
    pub depth: usize,
    #[serde(flatten)]
    pub stats: JobStats,
}

impl QueueStatsView {
    pub fn new(queue: QueueName, stats: JobStats) -> Self {
        Self {
            queue,
            depth: stats.depth(),
            stats,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeadLetterView {
    pub job_id: String,
    pub queue: QueueName,
    pub kind: &'static str,
    pub attempts: u32,
    pub reason: String,
    pub dead_lettered_at: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

impl From<DeadLetterEntry> for DeadLetterView {
    fn from(entry: DeadLetterEntry) -> Self {
        Self {
            job_id: entry.job.id.to_string(),
            queue: entry.job.queue,
            kind: entry.job.kind.type_name(),
            attempts: entry.job.attempt,
            reason: entry.reason,
            dead_lettered_at: entry.dead_lettered_at,
            payload: entry.job.payload,
        }
    }
}
