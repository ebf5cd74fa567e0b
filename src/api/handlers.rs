use std::convert::Infallible;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, Stream};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use super::{ApiError, AppState};
use crate::scheduler::coordinator::{Coordinator, CoordinatorError};
use crate::scheduler::job::{Disposition, JobId, JobInput, JobKind, JobState};

/// Body of submission and cancellation responses.
#[derive(Debug, Serialize)]
pub struct HandleBody {
    pub job_id: JobId,
    pub state: JobState,
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("'{}' is not a job id", raw)))
}

/// `POST /jobs`
pub async fn submit_job(
    State(state): State<AppState>,
    body: Result<Json<JobInput>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(input) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let handle = state.coordinator.submit(input).await?;

    let body = HandleBody {
        job_id: handle.job_id,
        state: handle.state,
    };
    let response = match handle.disposition {
        Disposition::Created => (StatusCode::ACCEPTED, Json(body)).into_response(),
        Disposition::Existing => (StatusCode::CONFLICT, Json(body)).into_response(),
        Disposition::Cached => {
            let status = state.coordinator.status(handle.job_id).await?;
            (StatusCode::OK, Json(status)).into_response()
        }
    };
    Ok(response)
}

/// `GET /jobs/{id}`
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let status = state.coordinator.status(id).await?;
    let code = if status.state.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((code, Json(status)).into_response())
}

/// `POST /jobs/{id}/cancel`
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HandleBody>, ApiError> {
    let id = parse_job_id(&id)?;
    let job = state.coordinator.cancel(id).await?;
    Ok(Json(HandleBody {
        job_id: job.id,
        state: job.state,
    }))
}

/// `DELETE /jobs/{id}`
pub async fn evict_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_job_id(&id)?;
    state.coordinator.evict(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

struct EventCursor {
    coordinator: Coordinator,
    id: JobId,
    poll_interval: Duration,
    last: Option<JobState>,
    done: bool,
}

/// Next event for the cursor: waits until the state differs from the last one
/// sent. Ends after a terminal state or once the job is gone.
async fn next_event(mut cursor: EventCursor) -> Option<(Result<Event, Infallible>, EventCursor)> {
    if cursor.done {
        return None;
    }

    loop {
        match cursor.coordinator.status(cursor.id).await {
            Ok(status) if Some(status.state) != cursor.last => {
                cursor.last = Some(status.state);
                cursor.done = status.state.is_terminal();
                let event = Event::default()
                    .event("state")
                    .json_data(&status)
                    .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
                return Some((Ok(event), cursor));
            }
            Ok(_) => {}
            Err(CoordinatorError::NotFound(_)) => {
                cursor.done = true;
                let event = Event::default()
                    .event("error")
                    .data(json!({ "error": format!("Job {} not found", cursor.id) }).to_string());
                return Some((Ok(event), cursor));
            }
            Err(e) => {
                debug!(job_id = %cursor.id, error = %e, "Status read failed, retrying");
            }
        }
        tokio::time::sleep(cursor.poll_interval).await;
    }
}

/// `GET /jobs/{id}/events`
pub async fn job_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = parse_job_id(&id)?;
    // Unknown ids get a plain 404 rather than an empty stream.
    state.coordinator.get_job(id).await?;

    let cursor = EventCursor {
        coordinator: state.coordinator.clone(),
        id,
        poll_interval: state.event_poll_interval,
        last: None,
        done: false,
    };
    let stream = stream::unfold(cursor, next_event);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Response {
    let broker = state.coordinator.broker();
    if let Err(e) = broker.ping().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": e.to_string() })),
        )
            .into_response();
    }

    let mut queues = Vec::new();
    for kind in JobKind::ALL {
        match broker.queue_depth(kind).await {
            Ok(depth) => queues.push(depth),
            Err(e) => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "status": "unavailable", "error": e.to_string() })),
                )
                    .into_response();
            }
        }
    }

    Json(json!({ "status": "ok", "queues": queues })).into_response()
}
