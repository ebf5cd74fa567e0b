//! HTTP API in front of the coordinator.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /jobs` | submit `{kind, input}` |
//! | `GET /jobs/{id}` | status, with result or error once terminal |
//! | `POST /jobs/{id}/cancel` | cancel |
//! | `DELETE /jobs/{id}` | evict a terminal job |
//! | `GET /jobs/{id}/events` | SSE stream of state changes |
//! | `GET /health` | broker liveness and queue depths |
//! | `GET /metrics` | Prometheus text format |

pub mod handlers;
pub mod router;

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};

use crate::scheduler::coordinator::{Coordinator, CoordinatorError};
use crate::scheduler::job::{JobId, JobState};

pub use router::build_router;

/// Shared state of all handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    /// How often the event stream re-reads a job.
    pub event_poll_interval: Duration,
}

impl AppState {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            event_poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_event_poll_interval(mut self, interval: Duration) -> Self {
        self.event_poll_interval = interval;
        self
    }
}

/// Errors returned to API clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {id} is {state}")]
    Conflict { id: JobId, state: JobState },

    #[error("{0}")]
    Unavailable(String),
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::InvalidInput(msg) => ApiError::BadRequest(msg),
            CoordinatorError::NotFound(id) => ApiError::NotFound(id),
            CoordinatorError::Conflict { id, state } => ApiError::Conflict { id, state },
            CoordinatorError::Contention(id) => {
                ApiError::Unavailable(format!("Job {} is busy, retry later", id))
            }
            CoordinatorError::Broker(e) => ApiError::Unavailable(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let body = match &self {
            ApiError::Conflict { id, state } => json!({
                "error": self.to_string(),
                "job_id": id,
                "state": state,
            }),
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

/// Serves the API on `addr` until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "API server listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
