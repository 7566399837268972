//! Course creation and delivery scheduling.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use uuid::Uuid;

use microlearn_core::CourseId;
use microlearn_infra::courses::CreateCourseRequest;
use microlearn_infra::scheduler::ScheduleParams;

use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_course))
        .route("/:id/schedule", post(reschedule).get(get_schedule))
}

/// POST /courses - create, enroll, publish and schedule in one call.
pub async fn create_course(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<CreateCourseRequest>,
) -> axum::response::Response {
    match services.courses.create_course(body, Utc::now()).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(e) => errors::course_error_to_response(e),
    }
}

/// POST /courses/:id/schedule - replace the delivery schedule, keeping progress.
pub async fn reschedule(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<Uuid>,
    Json(params): Json<ScheduleParams>,
) -> axum::response::Response {
    let course_id = CourseId::from_uuid(id);
    match services.courses.reschedule(course_id, &params, Utc::now()).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => errors::course_error_to_response(e),
    }
}

/// GET /courses/:id/schedule
pub async fn get_schedule(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    let course_id = CourseId::from_uuid(id);
    match services.courses.schedule(course_id).await {
        Ok(Some(schedule)) => Json(schedule).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no schedule for course {course_id}"),
        ),
        Err(e) => errors::store_error_to_response(e),
    }
}
