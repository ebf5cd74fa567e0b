//! HTTP API behaviour against the in-process broker.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{FakeFetcher, Harness};
use repolens::api::{build_router, AppState};

fn app(harness: &Harness) -> Router {
    build_router(AppState::new(harness.coordinator.clone()))
}

async fn send(app: Router, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = match body {
        Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
        None => Body::empty(),
    };
    let req = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(json!({}));
    (status, json)
}

fn fetch_body() -> Value {
    json!({
        "kind": "fetch",
        "input": { "url": "https://github.com/acme/widgets", "ref": "main" }
    })
}

fn harness() -> Harness {
    Harness::new(FakeFetcher::new().with_repo("github.com/acme/widgets", common::widget_snapshot()))
}

#[tokio::test]
async fn test_submit_then_duplicate_conflicts() {
    let harness = harness();

    let (status, created) = send(app(&harness), Method::POST, "/jobs", Some(fetch_body())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(created["state"], "enqueued");

    let (status, duplicate) = send(app(&harness), Method::POST, "/jobs", Some(fetch_body())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(duplicate["job_id"], created["job_id"]);
}

#[tokio::test]
async fn test_bad_submissions_are_rejected() {
    let harness = harness();

    let unknown_kind = json!({ "kind": "export", "input": {} });
    let (status, body) = send(app(&harness), Method::POST, "/jobs", Some(unknown_kind)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let bad_url = json!({ "kind": "fetch", "input": { "url": "not a url" } });
    let (status, _) = send(app(&harness), Method::POST, "/jobs", Some(bad_url)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let other_host = json!({
        "kind": "fetch",
        "input": { "url": "https://gitlab.com/acme/widgets", "ref": "main" }
    });
    let (status, body) = send(app(&harness), Method::POST, "/jobs", Some(other_host)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("gitlab.com"));

    let unknown_artifact = json!({
        "kind": "analyze",
        "input": { "source": { "artifact": { "fingerprint": "0".repeat(64) } } }
    });
    let (status, _) = send(app(&harness), Method::POST, "/jobs", Some(unknown_artifact)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_job_status_codes() {
    let harness = harness();

    let (status, _) = send(app(&harness), Method::GET, "/jobs/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing = format!("/jobs/{}", uuid::Uuid::new_v4());
    let (status, _) = send(app(&harness), Method::GET, &missing, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, created) = send(app(&harness), Method::POST, "/jobs", Some(fetch_body())).await;
    let path = format!("/jobs/{}", created["job_id"].as_str().unwrap());
    let (status, body) = send(app(&harness), Method::GET, &path, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["kind"], "fetch");
    assert!(body["result"].is_null());
}

#[tokio::test]
async fn test_cancel_then_evict() {
    let harness = harness();

    let (_, created) = send(app(&harness), Method::POST, "/jobs", Some(fetch_body())).await;
    let id = created["job_id"].as_str().unwrap().to_string();

    // Only terminal jobs can be evicted.
    let (status, _) = send(app(&harness), Method::DELETE, &format!("/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) =
        send(app(&harness), Method::POST, &format!("/jobs/{}/cancel", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "cancelled");

    let (status, body) = send(app(&harness), Method::GET, &format!("/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "cancelled");

    let (status, _) = send(app(&harness), Method::DELETE, &format!("/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(app(&harness), Method::GET, &format!("/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cached_submission_returns_result() {
    let mut harness = harness();
    harness.start().await;

    let (_, created) = send(app(&harness), Method::POST, "/jobs", Some(fetch_body())).await;
    let id: uuid::Uuid = created["job_id"].as_str().unwrap().parse().unwrap();
    harness.wait_terminal(id).await;

    let (status, body) = send(app(&harness), Method::POST, "/jobs", Some(fetch_body())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "succeeded");
    assert_eq!(body["result"]["type"], "artifact");
    assert_eq!(body["result"]["data"]["file_count"], 2);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_events_stream_ends_on_terminal_state() {
    let harness = harness();

    let missing = format!("/jobs/{}/events", uuid::Uuid::new_v4());
    let (status, _) = send(app(&harness), Method::GET, &missing, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, created) = send(app(&harness), Method::POST, "/jobs", Some(fetch_body())).await;
    let id = created["job_id"].as_str().unwrap().to_string();
    send(app(&harness), Method::POST, &format!("/jobs/{}/cancel", id), None).await;

    let req = Request::builder()
        .uri(format!("/jobs/{}/events", id))
        .body(Body::empty())
        .unwrap();
    let resp = app(&harness).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("event: state"));
    assert!(text.contains("\"cancelled\""));
}

#[tokio::test]
async fn test_health_reports_queues() {
    let harness = harness();
    send(app(&harness), Method::POST, "/jobs", Some(fetch_body())).await;

    let (status, body) = send(app(&harness), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let queues = body["queues"].as_array().unwrap();
    let fetch = queues.iter().find(|q| q["kind"] == "fetch").unwrap();
    assert_eq!(fetch["ready"], 1);
}

#[tokio::test]
async fn test_metrics_endpoint_serves_text() {
    repolens::metrics::init_metrics().unwrap();
    let harness = harness();

    let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let resp = app(&harness).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
