use axum::Router;

pub mod admin;
pub mod courses;
pub mod system;
pub mod webhook;

/// Router for endpoints that require the admin token.
pub fn admin_router() -> Router {
    Router::new()
        .nest("/courses", courses::router())
        .nest("/admin", admin::router())
}
