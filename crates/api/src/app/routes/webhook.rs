//! Provider webhook: subscription handshake and event delivery.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;

use microlearn_messaging::{VerificationParams, WebhookEnvelope, verify_subscription};

use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new().route("/", get(verify).post(receive))
}

/// GET /webhook - echo the challenge when the verify token matches.
pub async fn verify(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<VerificationParams>,
) -> axum::response::Response {
    match verify_subscription(&params, &services.webhook_verify_token) {
        Some(challenge) => {
            tracing::info!("webhook subscription verified");
            (StatusCode::OK, challenge).into_response()
        }
        None => {
            tracing::warn!(mode = ?params.mode, "webhook verification refused");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

/// POST /webhook - process one provider event envelope.
pub async fn receive(
    Extension(services): Extension<Arc<AppServices>>,
    body: Bytes,
) -> axum::response::Response {
    let envelope: WebhookEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_payload", e.to_string());
        }
    };

    match services.ingestion.ingest(&envelope, Utc::now()).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::ingest_error_to_response(e),
    }
}
