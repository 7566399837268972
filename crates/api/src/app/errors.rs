use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use microlearn_infra::StoreError;
use microlearn_infra::courses::CourseServiceError;
use microlearn_infra::ingestion::IngestError;
use microlearn_infra::jobs::JobStoreError;

pub fn course_error_to_response(err: CourseServiceError) -> axum::response::Response {
    if err.is_validation() {
        return json_error(StatusCode::BAD_REQUEST, "validation_error", err.to_string());
    }
    match err {
        CourseServiceError::CourseNotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        CourseServiceError::Store(e) => store_error_to_response(e),
        CourseServiceError::Queue(e) => job_store_error_to_response(e),
        other => {
            tracing::error!(error = %other, "course operation failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", other.to_string())
        }
    }
}

pub fn ingest_error_to_response(err: IngestError) -> axum::response::Response {
    if err.is_client_error() {
        return json_error(StatusCode::BAD_REQUEST, "invalid_payload", err.to_string());
    }
    tracing::error!(error = %err, "webhook processing failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", err.to_string())
}

pub fn job_store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        JobStoreError::AlreadyExists(_) => json_error(StatusCode::CONFLICT, "conflict", err.to_string()),
        JobStoreError::Serialization(_) | JobStoreError::Storage(_) => {
            tracing::error!(error = %err, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
        }
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound { .. } => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        StoreError::Conflict(_) => json_error(StatusCode::CONFLICT, "conflict", err.to_string()),
        StoreError::Serialization(_) | StoreError::Database(_) => {
            tracing::error!(error = %err, "store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
