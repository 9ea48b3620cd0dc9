//! Integration tests for background jobs: submission, progress events,
//! artifacts, cancellation and retention
//!
//! Run with: cargo test --test jobs_integration

mod common;

use awardlens::engine::{parse_request, ExportOutcome, ExportRequest, JobRequest};
use awardlens::error::Error;
use awardlens::tasks::{JobEvent, JobId, JobResult, JobState, JobStatus, Reaper};
use awardlens::AnalyticsEngine;
use common::Fixture;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn start_workers(engine: &AnalyticsEngine) -> (broadcast::Sender<()>, JoinHandle<()>) {
    let (tx, rx) = broadcast::channel(1);
    let orchestrator = Arc::clone(engine.orchestrator());
    let handle = tokio::spawn(async move { orchestrator.run_workers(rx).await });
    (tx, handle)
}

async fn stop_workers(workers: (broadcast::Sender<()>, JoinHandle<()>)) {
    let (tx, handle) = workers;
    let _ = tx.send(());
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("workers did not stop")
        .unwrap();
}

/// Collect every event of a job until its stream ends
async fn drain_events(engine: &AnalyticsEngine, id: JobId) -> Vec<JobEvent> {
    let mut subscription = engine.subscribe(id).unwrap();
    let mut events = Vec::new();
    timeout(Duration::from_secs(10), async {
        while let Some(event) = subscription.next().await {
            events.push(event);
        }
    })
    .await
    .expect("job did not finish in time");
    events
}

async fn wait_terminal(engine: &AnalyticsEngine, id: JobId) -> JobStatus {
    timeout(Duration::from_secs(10), async {
        loop {
            let status = engine.job_status(id).unwrap();
            if status.state.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}

fn event_status(event: &JobEvent) -> Option<&JobStatus> {
    match event {
        JobEvent::JobUpdate { status, .. } | JobEvent::SubscribeAck { status } => Some(status),
        JobEvent::Error { .. } => None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_row_export_lifecycle() {
    let fx = Fixture::new();
    let engine = fx.engine();
    let workers = start_workers(&engine);

    let request: ExportRequest = parse_request(&json!({"background": true})).unwrap();
    let outcome = engine.export(&request).unwrap();
    let ExportOutcome::Job { status, estimate } = outcome.data else {
        panic!("background export must be queued");
    };
    assert_eq!(estimate.row_count, 12);
    assert_eq!(status.state, JobState::Pending);

    let events = drain_events(&engine, status.job_id).await;
    assert!(matches!(events.first(), Some(JobEvent::SubscribeAck { .. })));

    let progress: Vec<u8> = events
        .iter()
        .filter_map(event_status)
        .map(|s| s.progress)
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);

    let last = events.last().and_then(event_status).unwrap();
    assert_eq!(last.state, JobState::Succeeded);
    assert_eq!(last.progress, 100);

    let final_status = engine.job_status(status.job_id).unwrap();
    match final_status.result {
        Some(JobResult::Artifact { path, rows, bytes }) => {
            assert_eq!(rows, 12);
            let csv = std::fs::read_to_string(&path).unwrap();
            assert_eq!(csv.len() as u64, bytes);
            assert_eq!(csv.lines().count(), 13);
            assert!(path.starts_with(fx.artifacts.path()));
            assert!(!engine
                .orchestrator()
                .store()
                .partial_path(status.job_id)
                .exists());
        },
        other => panic!("expected artifact, got {:?}", other),
    }

    stop_workers(workers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_export_over_sync_threshold_is_queued() {
    let fx = Fixture::new();
    let mut config = fx.config();
    config.export.sync_row_threshold = 5;
    let engine = fx.engine_with(config);

    let request: ExportRequest = parse_request(&json!({"background": false})).unwrap();
    let outcome = engine.export(&request).unwrap();
    let ExportOutcome::Job { status, estimate } = outcome.data else {
        panic!("an export over the sync threshold must be queued");
    };
    assert_eq!(estimate.row_count, 12);
    assert!(!estimate.inline);

    let mut subscription = engine.subscribe(status.job_id).unwrap();
    let workers = start_workers(&engine);
    let mut states = Vec::new();
    timeout(Duration::from_secs(10), async {
        while let Some(event) = subscription.next().await {
            states.extend(event_status(&event).map(|s| s.state));
        }
    })
    .await
    .expect("job did not finish in time");
    assert_eq!(states.first(), Some(&JobState::Pending));
    assert!(states.contains(&JobState::Started { retries: 0 }));
    assert!(states
        .iter()
        .any(|s| matches!(s, JobState::Progress { .. })));
    assert_eq!(states.last(), Some(&JobState::Succeeded));

    // a filter under the threshold still answers inline
    let small: ExportRequest = parse_request(&json!({"contractors": ["bayside"]})).unwrap();
    match engine.export(&small).unwrap().data {
        ExportOutcome::Inline { summary, .. } => assert_eq!(summary.rows, 2),
        other => panic!("expected inline export, got {:?}", other),
    }

    stop_workers(workers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_aggregated_export_job() {
    let fx = Fixture::new();
    let engine = fx.engine();
    let workers = start_workers(&engine);

    let request: JobRequest = parse_request(&json!({
        "job": {"type": "aggregatedExport", "dimension": "area"},
        "timeRanges": [{"type": "yearly", "year": 2023}],
    }))
    .unwrap();
    let status = engine.submit_job(&request).unwrap();
    let done = wait_terminal(&engine, status.job_id).await;

    assert_eq!(done.state, JobState::Succeeded);
    let Some(JobResult::Artifact { path, rows, .. }) = done.result else {
        panic!("expected artifact");
    };
    assert_eq!(rows, 3);
    let csv = std::fs::read_to_string(path).unwrap();
    assert!(csv.starts_with("label,total_value,count,avg_value"));

    stop_workers(workers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_heavy_aggregate_matches_sync_answer() {
    let fx = Fixture::new();
    let engine = fx.engine();
    let workers = start_workers(&engine);

    let request: JobRequest = parse_request(&json!({
        "job": {"type": "heavyAggregate", "topN": 3},
        "contractors": ["acme"],
    }))
    .unwrap();
    let status = engine.submit_job(&request).unwrap();
    let done = wait_terminal(&engine, status.job_id).await;

    assert_eq!(done.state, JobState::Succeeded);
    let Some(JobResult::Inline { payload }) = done.result else {
        panic!("expected inline payload");
    };
    assert_eq!(payload["summary"]["count"], json!(4));
    assert_eq!(payload["byYear"].as_array().map(Vec::len), Some(3));
    assert!(payload["byContractor"].as_array().unwrap().len() <= 3);

    stop_workers(workers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_table_search_job() {
    let fx = Fixture::new();
    let engine = fx.engine();
    let workers = start_workers(&engine);

    let request: JobRequest = parse_request(&json!({
        "job": {"type": "fullTableSearch", "pageSize": 2},
        "keywords": ["road"],
    }))
    .unwrap();
    let status = engine.submit_job(&request).unwrap();
    let done = wait_terminal(&engine, status.job_id).await;

    let Some(JobResult::Inline { payload }) = done.result else {
        panic!("expected inline payload");
    };
    assert_eq!(payload["rows"].as_array().map(Vec::len), Some(2));
    assert_eq!(payload["pagination"]["totalCount"], json!(3));

    stop_workers(workers).await;
}

#[tokio::test]
async fn test_invalid_job_parameters_rejected_at_submit() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let request: JobRequest =
        parse_request(&json!({"job": {"type": "heavyAggregate", "topN": 0}})).unwrap();
    assert!(matches!(engine.submit_job(&request), Err(Error::Validation(_))));

    let request: JobRequest =
        parse_request(&json!({"job": {"type": "fullTableSearch", "page": 0}})).unwrap();
    assert!(matches!(engine.submit_job(&request), Err(Error::Validation(_))));

    assert!(parse_request::<JobRequest>(&json!({"job": {"type": "bogus"}})).is_err());
}

#[tokio::test]
async fn test_cancel_pending_job() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let request: JobRequest = parse_request(&json!({"job": {"type": "rowLevelExport"}})).unwrap();
    let status = engine.submit_job(&request).unwrap();

    let ack = engine.cancel_job(status.job_id).unwrap();
    assert!(ack.cancelled);
    assert_eq!(ack.state, JobState::Cancelled);

    let again = engine.cancel_job(status.job_id).unwrap();
    assert!(!again.cancelled);
    assert_eq!(again.state, JobState::Cancelled);

    // a worker picking the job up afterwards leaves it cancelled
    let workers = start_workers(&engine);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = engine.job_status(status.job_id).unwrap();
    assert_eq!(status.state, JobState::Cancelled);
    assert!(status.result.is_none());
    stop_workers(workers).await;

    let events = drain_events(&engine, status.job_id).await;
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn test_unknown_job_ids() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let missing = JobId::new();
    assert!(matches!(engine.job_status(missing), Err(Error::JobNotFound(_))));
    assert!(matches!(engine.cancel_job(missing), Err(Error::JobNotFound(_))));
    assert!(engine.subscribe(missing).is_err());
    assert!(matches!(
        AnalyticsEngine::parse_job_id("not-a-uuid"),
        Err(Error::Validation(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reaper_removes_expired_jobs() {
    let fx = Fixture::new();
    let engine = fx.engine();
    let workers = start_workers(&engine);

    let request: JobRequest = parse_request(&json!({"job": {"type": "rowLevelExport"}})).unwrap();
    let status = engine.submit_job(&request).unwrap();
    let done = wait_terminal(&engine, status.job_id).await;
    let Some(JobResult::Artifact { path, .. }) = done.result else {
        panic!("expected artifact");
    };
    assert!(path.exists());
    stop_workers(workers).await;

    let store = Arc::clone(engine.orchestrator().store());
    let reaper = Reaper::new(store, Duration::from_secs(60));

    let report = reaper.sweep(chrono::Utc::now()).unwrap();
    assert!(report.is_empty());
    assert!(engine.job_status(status.job_id).is_ok());

    let later = chrono::Utc::now() + chrono::Duration::seconds(3600);
    reaper.sweep(later).unwrap();
    assert!(matches!(
        engine.job_status(status.job_id),
        Err(Error::JobNotFound(_))
    ));
    assert!(!path.exists());
}

#[tokio::test]
async fn test_jobs_survive_restart() {
    let fx = Fixture::new();
    let id = {
        let engine = fx.engine();
        let request: JobRequest =
            parse_request(&json!({"job": {"type": "rowLevelExport"}})).unwrap();
        let status = engine.submit_job(&request).unwrap();
        engine.cancel_job(status.job_id).unwrap();
        status.job_id
    };

    let engine = fx.engine();
    let status = engine.job_status(id).unwrap();
    assert_eq!(status.state, JobState::Cancelled);
}
