//! Queue administration: lane statistics and dead-letter handling.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use uuid::Uuid;

use microlearn_infra::jobs::{JobId, QueueName};

use crate::app::dto::{DeadLetterQuery, DeadLetterView, QueueStatsView};
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/queues", get(queue_stats))
        .route("/queues/dead-letters", get(list_dead_letters))
        .route("/queues/dead-letters/:id/retry", post(retry_dead_letter))
}

/// GET /admin/queues - per-lane counts.
pub async fn queue_stats(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let mut queues = Vec::with_capacity(QueueName::ALL.len());
    for queue in QueueName::ALL {
        match services.stores.jobs.stats(queue).await {
            Ok(stats) => queues.push(QueueStatsView::new(queue, stats)),
            Err(e) => return errors::job_store_error_to_response(e),
        }
    }
    Json(json!({ "queues": queues })).into_response()
}

/// GET /admin/queues/dead-letters?queue=lesson&limit=50
pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<DeadLetterQuery>,
) -> axum::response::Response {
    let queue = match query.queue() {
        Ok(queue) => queue,
        Err(resp) => return resp,
    };

    match services.stores.jobs.list_dead_letters(queue, query.limit()).await {
        Ok(entries) => {
            let items: Vec<DeadLetterView> = entries.into_iter().map(DeadLetterView::from).collect();
            Json(json!({ "items": items })).into_response()
        }
        Err(e) => errors::job_store_error_to_response(e),
    }
}

/// POST /admin/queues/dead-letters/:id/retry - move a dead letter back to pending.
pub async fn retry_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    let job_id = JobId::from_uuid(id);
    match services.stores.jobs.retry_dead_letter(job_id).await {
        Ok(job) => {
            tracing::info!(job_id = %job.id, queue = %job.queue, "dead letter requeued");
            Json(json!({
                "job_id": job.id.to_string(),
                "queue": job.queue,
                "status": job.status,
            }))
            .into_response()
        }
        Err(e) => errors::job_store_error_to_response(e),
    }
}
