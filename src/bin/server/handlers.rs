//! HTTP handlers
//!
//! Request bodies are taken as raw JSON and parsed by the library, so a body
//! of the wrong shape gets the same structured validation error as any other
//! invalid input. Scans run on the blocking pool.

use super::types::*;
use awardlens::engine::{
    parse_request, AggregateRequest, DistributionRequest, ExportOutcome, ExportRequest,
    JobRequest, PaginatedAggregateRequest, SearchRequest,
};
use awardlens::error::{Error, ErrorClass};
use awardlens::query::{EntityLookup, FilterRequest};
use awardlens::services::ServiceManager;
use awardlens::tasks::{CancelAck, JobEvent, JobResult, JobStatus};
use awardlens::AnalyticsEngine;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, Stream};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::error;

// =============================================================================
// Application State
// =============================================================================

/// Shared state of every handler
pub struct AppState {
    /// Query side and background jobs
    pub engine: AnalyticsEngine,
    /// Background services, for the health check
    pub services: Arc<ServiceManager>,
}

type SharedState = State<Arc<AppState>>;

// =============================================================================
// Error mapping
// =============================================================================

/// Library error rendered as a structured JSON response
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.class() {
            ErrorClass::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::Retryable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorClass::Cancelled => StatusCode::CONFLICT,
            ErrorClass::Unavailable | ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(code = self.0.code(), error = %self.0, "Request failed");
        }
        (status, Json(ErrorResponse::from(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Run a scan on the blocking pool
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> awardlens::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError),
        Err(e) => Err(ApiError(Error::JobExecution(format!("request task failed: {}", e)))),
    }
}

/// Parse a body and run an engine operation with it
async fn run<R, T, F>(state: &Arc<AppState>, body: Value, f: F) -> ApiResult<Json<T>>
where
    R: serde::de::DeserializeOwned + Send + 'static,
    T: Serialize + Send + 'static,
    F: FnOnce(&AnalyticsEngine, &R) -> awardlens::Result<T> + Send + 'static,
{
    let request: R = parse_request(&body)?;
    let engine = state.engine.clone();
    blocking(move || f(&engine, &request)).await.map(Json)
}

// =============================================================================
// Health & Metrics
// =============================================================================

/// Health check
pub async fn health(State(state): SharedState) -> impl IntoResponse {
    let catalog = state.engine.query().catalog();
    let snapshot = catalog.snapshot();
    let (segment_loads, cache_hits) = catalog.cache_stats();
    let services = state.services.health();
    let healthy = services.healthy && !snapshot.is_empty();

    let body = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        catalog: CatalogHealth {
            generation: catalog.generation(),
            sources: snapshot.len(),
            skipped: snapshot.skipped().len(),
            segment_loads,
            cache_hits,
        },
        active_jobs: state.engine.orchestrator().active_jobs(),
        services,
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Prometheus metrics
pub async fn metrics() -> impl IntoResponse {
    match awardlens::metrics::gather_metrics() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            e,
        ),
    }
}

// =============================================================================
// Query Handlers
// =============================================================================

/// `POST /api/v1/search`
pub async fn search(State(state): SharedState, Json(body): Json<Value>) -> impl IntoResponse {
    run(&state, body, |e, r: &SearchRequest| e.query().search(r)).await
}

/// `POST /api/v1/aggregate`
pub async fn aggregate(State(state): SharedState, Json(body): Json<Value>) -> impl IntoResponse {
    run(&state, body, |e, r: &AggregateRequest| e.query().aggregate(r)).await
}

/// `POST /api/v1/aggregate/paginated`
pub async fn aggregate_paginated(
    State(state): SharedState,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    run(&state, body, |e, r: &PaginatedAggregateRequest| {
        e.query().aggregate_paginated(r)
    })
    .await
}

/// `POST /api/v1/distribution`
pub async fn value_distribution(
    State(state): SharedState,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    run(&state, body, |e, r: &DistributionRequest| {
        e.query().value_distribution(r)
    })
    .await
}

/// `POST /api/v1/rounding`
pub async fn rounding_patterns(
    State(state): SharedState,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    run(&state, body, |e, r: &FilterRequest| e.query().rounding_patterns(r)).await
}

// =============================================================================
// Export Handlers
// =============================================================================

/// `POST /api/v1/export/estimate`
pub async fn export_estimate(
    State(state): SharedState,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    run(&state, body, |e, r: &ExportRequest| e.query().estimate(r)).await
}

/// `POST /api/v1/export`
///
/// Small exports come back as `text/csv`; larger ones are queued and answer
/// `202 Accepted` with the job id.
pub async fn export(State(state): SharedState, Json(body): Json<Value>) -> ApiResult<Response> {
    let request: ExportRequest = parse_request(&body)?;
    let filename = match request.dimension {
        Some(d) => format!("{}_aggregates.csv", d),
        None => "contracts.csv".to_string(),
    };
    let engine = state.engine.clone();
    let response = blocking(move || engine.export(&request)).await?;

    match response.data {
        ExportOutcome::Inline { csv, summary, .. } => {
            Ok(csv_response(csv, &filename, summary.rows, response.warnings.len()))
        },
        ExportOutcome::Job { status, estimate } => Ok((
            StatusCode::ACCEPTED,
            Json(ExportJobResponse {
                job_id: status.job_id.to_string(),
                status,
                estimate,
                warnings: response.warnings,
            }),
        )
            .into_response()),
    }
}

fn csv_response(body: impl Into<Body>, filename: &str, rows: u64, warnings: usize) -> Response {
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/csv; charset=utf-8")),
            (header::CONTENT_DISPOSITION, disposition),
            (HeaderName::from_static("x-row-count"), HeaderValue::from(rows)),
            (HeaderName::from_static("x-filter-warnings"), HeaderValue::from(warnings)),
        ],
        body.into(),
    )
        .into_response()
}

// =============================================================================
// Job Handlers
// =============================================================================

/// `POST /api/v1/jobs`
pub async fn submit_job(State(state): SharedState, Json(body): Json<Value>) -> ApiResult<Response> {
    let request: JobRequest = parse_request(&body)?;
    let status = state.engine.submit_job(&request)?;
    Ok((StatusCode::ACCEPTED, Json(status)).into_response())
}

/// `GET /api/v1/jobs/:id`
pub async fn job_status(
    State(state): SharedState,
    Path(id): Path<String>,
) -> ApiResult<Json<JobStatus>> {
    let id = AnalyticsEngine::parse_job_id(&id)?;
    Ok(Json(state.engine.job_status(id)?))
}

/// `POST /api/v1/jobs/:id/cancel`
pub async fn cancel_job(
    State(state): SharedState,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelAck>> {
    let id = AnalyticsEngine::parse_job_id(&id)?;
    Ok(Json(state.engine.cancel_job(id)?))
}

/// `GET /api/v1/jobs/:id/artifact`
pub async fn job_artifact(
    State(state): SharedState,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id = AnalyticsEngine::parse_job_id(&id)?;
    let status = state.engine.job_status(id)?;
    match status.result {
        Some(JobResult::Artifact { path, rows, .. }) => {
            let file = tokio::fs::File::open(&path).await.map_err(Error::from)?;
            let body = Body::from_stream(ReaderStream::new(file));
            Ok(csv_response(body, &format!("{}.csv", id), rows, 0))
        },
        Some(JobResult::Inline { payload }) => Ok(Json(payload).into_response()),
        None => Err(ApiError(Error::Validation(format!(
            "job {} has no result (state {})",
            id, status.state
        )))),
    }
}

/// `GET /api/v1/jobs/:id/events`
///
/// Server-sent events: `subscribe_ack` first, then one `job_update` per
/// transition; the stream ends after the terminal state.
pub async fn job_events(
    State(state): SharedState,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let id = AnalyticsEngine::parse_job_id(&id)?;
    let subscription = state.engine.subscribe(id)?;

    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.next().await?;
        let sse = Event::default().event(event_name(&event)).json_data(&event);
        Some((sse, subscription))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn event_name(event: &JobEvent) -> &'static str {
    match event {
        JobEvent::JobUpdate { .. } => "job_update",
        JobEvent::SubscribeAck { .. } => "subscribe_ack",
        JobEvent::Error { .. } => "error",
    }
}

// =============================================================================
// Catalog Handlers
// =============================================================================

/// `GET /api/v1/options`
pub async fn filter_options(State(state): SharedState) -> impl IntoResponse {
    let engine = state.engine.clone();
    blocking(move || engine.query().filter_options()).await.map(Json)
}

/// `POST /api/v1/options/lookup`
pub async fn lookup(State(state): SharedState, Json(body): Json<Value>) -> impl IntoResponse {
    run(&state, body, |e, r: &EntityLookup| e.query().lookup(r)).await
}

/// `GET /api/v1/catalog`
pub async fn catalog(State(state): SharedState) -> impl IntoResponse {
    let sources = state.engine.query().catalog_sources();
    Json(serde_json::json!({
        "generation": state.engine.query().catalog().generation(),
        "sources": sources,
    }))
}

/// `POST /api/v1/catalog/reload`
pub async fn reload_catalog(State(state): SharedState) -> impl IntoResponse {
    let engine = state.engine.clone();
    blocking(move || engine.query().reload()).await.map(Json)
}

/// `POST /api/v1/catalog/verify`
pub async fn verify_catalog(State(state): SharedState) -> impl IntoResponse {
    let engine = state.engine.clone();
    blocking(move || Ok(engine.query().verify())).await.map(Json)
}
