//! End-to-end job flows over the in-process broker with fake collaborators.

mod common;

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use common::{widget_snapshot, FakeFetcher, Harness};
use repolens::error::ErrorKind;
use repolens::scheduler::{
    AnalysisFocus, AnalysisParams, Disposition, JobInput, JobKind, JobState, ResultPayload,
};
use repolens::storage::{Artifact, RepoSnapshot};

const WIDGETS: &str = "https://github.com/acme/widgets";

fn widgets_fetcher() -> FakeFetcher {
    FakeFetcher::new().with_repo("github.com/acme/widgets", widget_snapshot())
}

#[tokio::test]
async fn test_analyze_repo_fetches_then_analyzes() {
    let mut harness = Harness::new(widgets_fetcher());
    harness.start().await;

    let handle = harness
        .coordinator
        .submit(JobInput::analyze_repo(WIDGETS, "main", AnalysisParams::default()))
        .await
        .unwrap();
    assert_eq!(handle.disposition, Disposition::Created);
    assert_eq!(handle.kind, JobKind::Analyze);

    let status = harness.wait_terminal(handle.job_id).await;
    assert_eq!(status.state, JobState::Succeeded, "error: {:?}", status.error);
    let Some(ResultPayload::Analysis(result)) = status.result else {
        panic!("expected an analysis result, got {:?}", status.result);
    };
    assert_eq!(result.report.summary, "A small widget library");
    assert_eq!(result.report.sections.len(), AnalysisFocus::ALL.len());
    assert_eq!(result.artifact_fingerprint, widget_snapshot().fingerprint());

    assert_eq!(status.dependencies.len(), 1);
    let fetch = harness.status(status.dependencies[0]).await;
    assert_eq!(fetch.kind, JobKind::Fetch);
    assert_eq!(fetch.state, JobState::Succeeded);
    assert!(matches!(fetch.result, Some(ResultPayload::Artifact(_))));

    assert_eq!(harness.fetcher.snapshot_count(), 1);
    assert_eq!(harness.llm.call_count(), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_resubmission_after_success_is_cached() {
    let mut harness = Harness::new(widgets_fetcher());
    harness.start().await;

    let params = AnalysisParams::default().with_focus([AnalysisFocus::Security]);
    let first = harness
        .coordinator
        .submit(JobInput::analyze_repo(WIDGETS, "main", params.clone()))
        .await
        .unwrap();
    harness.wait_terminal(first.job_id).await;

    // Different spelling of the same repository.
    let again = harness
        .coordinator
        .submit(JobInput::analyze_repo(
            "github.com/ACME/widgets.git",
            "main",
            params,
        ))
        .await
        .unwrap();
    assert_eq!(again.disposition, Disposition::Cached);
    assert_eq!(again.job_id, first.job_id);
    assert_eq!(again.state, JobState::Succeeded);

    assert_eq!(harness.fetcher.snapshot_count(), 1);
    assert_eq!(harness.llm.call_count(), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_identical_content_shares_artifact_and_result() {
    let fetcher = widgets_fetcher().with_repo("github.com/mirror/widgets", widget_snapshot());
    let mut harness = Harness::new(fetcher);
    harness.start().await;

    let first = harness
        .coordinator
        .submit(JobInput::analyze_repo(WIDGETS, "main", AnalysisParams::default()))
        .await
        .unwrap();
    let first = harness.wait_terminal(first.job_id).await;

    let second = harness
        .coordinator
        .submit(JobInput::analyze_repo(
            "https://github.com/mirror/widgets",
            "main",
            AnalysisParams::default(),
        ))
        .await
        .unwrap();
    assert_eq!(second.disposition, Disposition::Created);
    let second = harness.wait_terminal(second.job_id).await;
    assert_eq!(second.state, JobState::Succeeded);

    let fingerprint = |payload: &Option<ResultPayload>| match payload {
        Some(ResultPayload::Analysis(r)) => r.artifact_fingerprint.clone(),
        other => panic!("unexpected payload {:?}", other),
    };
    assert_eq!(fingerprint(&first.result), fingerprint(&second.result));

    // Both repositories were downloaded, but the model ran once.
    assert_eq!(harness.fetcher.snapshot_count(), 2);
    assert_eq!(harness.llm.call_count(), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_identical_submissions_create_one_job() {
    let harness = Harness::new(widgets_fetcher());

    let submissions = (0..8).map(|_| {
        let coordinator = harness.coordinator.clone();
        async move { coordinator.submit(JobInput::fetch(WIDGETS, "main")).await }
    });
    let handles: Vec<_> = join_all(submissions)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let created = handles
        .iter()
        .filter(|h| h.disposition == Disposition::Created)
        .count();
    assert_eq!(created, 1);
    assert!(handles.iter().all(|h| h.job_id == handles[0].job_id));
    assert_eq!(harness.ready(JobKind::Fetch).await, 1);
}

#[tokio::test]
async fn test_analysis_waits_for_its_fetch() {
    let mut harness = Harness::new(widgets_fetcher());

    let handle = harness
        .coordinator
        .submit(JobInput::analyze_repo(WIDGETS, "main", AnalysisParams::default()))
        .await
        .unwrap();
    assert_eq!(handle.state, JobState::Pending);
    assert_eq!(harness.ready(JobKind::Analyze).await, 0);
    assert_eq!(harness.ready(JobKind::Fetch).await, 1);

    harness.start().await;
    let status = harness.wait_terminal(handle.job_id).await;
    assert_eq!(status.state, JobState::Succeeded);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_failed_fetch_fails_analysis_without_running_it() {
    let mut harness = Harness::new(widgets_fetcher());
    harness.start().await;

    let handle = harness
        .coordinator
        .submit(JobInput::analyze_repo(WIDGETS, "missing", AnalysisParams::default()))
        .await
        .unwrap();
    let status = harness.wait_terminal(handle.job_id).await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.error.map(|e| e.kind), Some(ErrorKind::DependencyFailed));
    assert_eq!(status.attempts, 0);

    let fetch = harness.status(status.dependencies[0]).await;
    assert_eq!(fetch.state, JobState::Failed);
    assert_eq!(fetch.error.map(|e| e.kind), Some(ErrorKind::InvalidRef));
    // Permanent errors are not retried.
    assert_eq!(fetch.attempts, 1);

    assert_eq!(harness.llm.call_count(), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_rate_limited_fetch_is_retried() {
    let mut harness = Harness::new(widgets_fetcher().with_transient_failures(2));
    harness.start().await;

    let handle = harness
        .coordinator
        .submit(JobInput::fetch(WIDGETS, "main"))
        .await
        .unwrap();
    let status = harness.wait_terminal(handle.job_id).await;

    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.attempts, 3);
    assert_eq!(harness.fetcher.resolve_count(), 3);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let mut harness = Harness::new(widgets_fetcher().with_transient_failures(10));
    harness.start().await;

    let handle = harness
        .coordinator
        .submit(JobInput::fetch(WIDGETS, "main"))
        .await
        .unwrap();
    let status = harness.wait_terminal(handle.job_id).await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.error.map(|e| e.kind), Some(ErrorKind::RepoUnavailable));
    assert_eq!(status.attempts, 3);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_cancel_pending_analysis() {
    let mut harness = Harness::new(widgets_fetcher());

    let handle = harness
        .coordinator
        .submit(JobInput::analyze_repo(WIDGETS, "main", AnalysisParams::default()))
        .await
        .unwrap();
    let cancelled = harness.coordinator.cancel(handle.job_id).await.unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);

    harness.start().await;
    let fetch_id = cancelled.dependencies[0];
    let fetch = harness.wait_terminal(fetch_id).await;
    assert_eq!(fetch.state, JobState::Succeeded);

    assert_eq!(harness.status(handle.job_id).await.state, JobState::Cancelled);
    assert_eq!(harness.llm.call_count(), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_fetch_stops_at_checkpoint() {
    let gate = Arc::new(Semaphore::new(0));
    let mut harness = Harness::new(widgets_fetcher().with_gate(gate.clone()));
    harness.start().await;

    let handle = harness
        .coordinator
        .submit(JobInput::fetch(WIDGETS, "main"))
        .await
        .unwrap();
    harness.wait_for_state(handle.job_id, JobState::Running).await;

    let job = harness.coordinator.cancel(handle.job_id).await.unwrap();
    assert_eq!(job.state, JobState::Running);
    assert!(job.cancel_requested);

    gate.add_permits(1);
    let status = harness.wait_terminal(handle.job_id).await;
    assert_eq!(status.state, JobState::Cancelled);
    assert_eq!(harness.fetcher.snapshot_count(), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_failed_job_is_replaced_on_resubmit() {
    let mut harness = Harness::new(widgets_fetcher());
    harness.start().await;

    let input = JobInput::fetch(WIDGETS, "missing");
    let first = harness.coordinator.submit(input.clone()).await.unwrap();
    harness.wait_terminal(first.job_id).await;

    let second = harness.coordinator.submit(input).await.unwrap();
    assert_eq!(second.disposition, Disposition::Created);
    assert_ne!(second.job_id, first.job_id);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_evicted_fetch_reuses_known_commit() {
    let mut harness = Harness::new(widgets_fetcher());
    harness.start().await;

    let first = harness
        .coordinator
        .submit(JobInput::fetch(WIDGETS, "main"))
        .await
        .unwrap();
    harness.wait_terminal(first.job_id).await;
    harness.coordinator.evict(first.job_id).await.unwrap();
    assert!(harness.coordinator.get_job(first.job_id).await.is_err());

    let second = harness
        .coordinator
        .submit(JobInput::fetch(WIDGETS, "main"))
        .await
        .unwrap();
    assert_eq!(second.disposition, Disposition::Created);
    let status = harness.wait_terminal(second.job_id).await;
    assert_eq!(status.state, JobState::Succeeded);

    // The commit resolved again, but its snapshot was already stored.
    assert_eq!(harness.fetcher.resolve_count(), 2);
    assert_eq!(harness.fetcher.snapshot_count(), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_analysis_of_known_artifact_skips_fetch() {
    let mut harness = Harness::new(FakeFetcher::new());
    let snapshot = RepoSnapshot::new().with_file("main.py", "print('hi')\n");
    let fingerprint = snapshot.fingerprint();
    let artifact = Artifact::describe(
        &snapshot,
        uuid::Uuid::new_v4(),
        "github.com/acme/scripts",
        "a".repeat(40),
    );
    harness
        .coordinator
        .broker()
        .register_artifact(&artifact, &snapshot.to_bytes().unwrap())
        .await
        .unwrap();
    harness.start().await;

    let handle = harness
        .coordinator
        .submit(JobInput::analyze_artifact(&fingerprint, AnalysisParams::default()))
        .await
        .unwrap();
    let status = harness.wait_terminal(handle.job_id).await;

    assert_eq!(status.state, JobState::Succeeded);
    assert!(status.dependencies.is_empty());
    assert_eq!(harness.fetcher.resolve_count(), 0);

    let again = harness
        .coordinator
        .submit(JobInput::analyze_artifact(&fingerprint, AnalysisParams::default()))
        .await
        .unwrap();
    assert_eq!(again.disposition, Disposition::Cached);
    assert_eq!(harness.llm.call_count(), 1);
    harness.shutdown().await;
}
