//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store, queue, scheduler and ingestion wiring
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    let admin_auth = middleware::AdminAuth {
        token: Arc::from(services.admin_api_token.as_str()),
    };

    // Admin routes: require the bearer token.
    let protected = routes::admin_router().layer(axum::middleware::from_fn_with_state(
        admin_auth,
        middleware::admin_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/webhook", routes::webhook::router())
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(Extension(services)),
        )
}
