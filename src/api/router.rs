use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use super::handlers;
use super::AppState;
use crate::metrics::metrics_handler;

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(handlers::submit_job))
        .route(
            "/jobs/{id}",
            get(handlers::get_job).delete(handlers::evict_job),
        )
        .route("/jobs/{id}/cancel", post(handlers::cancel_job))
        .route("/jobs/{id}/events", get(handlers::job_events))
        .route("/health", get(handlers::health))
        .route("/metrics", get(metrics_handler))
        .layer(build_cors())
        .with_state(state)
}
