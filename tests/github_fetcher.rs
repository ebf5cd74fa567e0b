//! GitHub fetcher against a local stand-in for the REST and raw endpoints.

use std::net::SocketAddr;

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use repolens::error::FetchError;
use repolens::fetch::{FetchConfig, GitHubFetcher, RepoFetcher};
use repolens::scheduler::RepoLocator;

const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

async fn commit(Path((_owner, _name, git_ref)): Path<(String, String, String)>) -> Response {
    match git_ref.as_str() {
        "main" => COMMIT.into_response(),
        "limited" => {
            let mut headers = HeaderMap::new();
            headers.insert("x-ratelimit-remaining", "0".parse().unwrap());
            (StatusCode::FORBIDDEN, headers, "rate limit exceeded").into_response()
        }
        "broken" => (StatusCode::BAD_GATEWAY, "upstream").into_response(),
        _ => (StatusCode::UNPROCESSABLE_ENTITY, "No commit found").into_response(),
    }
}

async fn tree(Path((_owner, _name, _commit)): Path<(String, String, String)>) -> Json<serde_json::Value> {
    Json(json!({
        "sha": COMMIT,
        "truncated": false,
        "tree": [
            { "path": "src", "type": "tree" },
            { "path": "src/lib.rs", "type": "blob", "size": 22 },
            { "path": "README.md", "type": "blob", "size": 10 },
            { "path": "logo.png", "type": "blob", "size": 4 },
            { "path": "data/huge.csv", "type": "blob", "size": 10_000_000 }
        ]
    }))
}

async fn raw(Path((_owner, _name, _commit, path)): Path<(String, String, String, String)>) -> Response {
    match path.as_str() {
        "src/lib.rs" => "pub fn answer() -> u8 { 42 }".into_response(),
        "README.md" => "# widgets\n".into_response(),
        "logo.png" => vec![0x89u8, b'P', 0, b'G'].into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn spawn_fake_github() -> SocketAddr {
    let app = Router::new()
        .route("/repos/{owner}/{name}/commits/{git_ref}", get(commit))
        .route("/repos/{owner}/{name}/git/trees/{commit}", get(tree))
        .route("/raw/{owner}/{name}/{commit}/{*path}", get(raw));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn fetcher() -> GitHubFetcher {
    let addr = spawn_fake_github().await;
    let config = FetchConfig::default().with_base_urls(
        format!("http://{}", addr),
        format!("http://{}/raw", addr),
    );
    GitHubFetcher::new(config).unwrap()
}

fn widgets() -> RepoLocator {
    RepoLocator::parse("https://github.com/acme/widgets").unwrap()
}

#[tokio::test]
async fn test_resolve_and_snapshot() {
    let fetcher = fetcher().await;

    let commit = fetcher.resolve(&widgets(), "main").await.unwrap();
    assert_eq!(commit, COMMIT);

    let snapshot = fetcher.snapshot(&widgets(), &commit).await.unwrap();
    let paths: Vec<_> = snapshot.files.keys().cloned().collect();
    assert_eq!(paths, vec!["README.md".to_string(), "src/lib.rs".to_string()]);
    // The binary file and the oversized file are left out.
    assert_eq!(snapshot.skipped, 2);
}

#[tokio::test]
async fn test_resolve_errors_are_classified() {
    let fetcher = fetcher().await;

    let err = fetcher.resolve(&widgets(), "no-such-branch").await.unwrap_err();
    assert!(matches!(err, FetchError::InvalidRef { .. }), "{:?}", err);
    assert!(!err.is_transient());

    let err = fetcher.resolve(&widgets(), "limited").await.unwrap_err();
    assert!(matches!(err, FetchError::RateLimited(_)), "{:?}", err);
    assert!(err.is_transient());

    let err = fetcher.resolve(&widgets(), "broken").await.unwrap_err();
    assert!(matches!(err, FetchError::Unavailable(_)), "{:?}", err);
}

#[tokio::test]
async fn test_other_hosts_are_rejected() {
    let fetcher = fetcher().await;
    let gitlab = RepoLocator::parse("https://gitlab.com/acme/widgets").unwrap();

    let err = fetcher.resolve(&gitlab, "main").await.unwrap_err();
    assert!(matches!(err, FetchError::UnsupportedHost(host) if host == "gitlab.com"));
}
