//! Metrics and telemetry for the analytics core
//!
//! Prometheus metrics covering query latency, scan volume, routing decisions,
//! background jobs, exports and the reaper.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    // === Query Counters ===

    /// Total synchronous queries
    pub static ref QUERIES_TOTAL: CounterVec = register_counter_vec!(
        "awardlens_queries_total",
        "Total synchronous queries by operation and outcome",
        &["operation", "status"]
    ).unwrap();

    /// Rows scanned, by tier
    pub static ref ROWS_SCANNED: CounterVec = register_counter_vec!(
        "awardlens_rows_scanned_total",
        "Rows scanned by source tier",
        &["tier"]
    ).unwrap();

    /// Router decisions
    pub static ref ROUTE_SELECTIONS: CounterVec = register_counter_vec!(
        "awardlens_route_selections_total",
        "Tier router selections",
        &["tier", "fallback"]
    ).unwrap();

    /// Filter fields dropped by the compiler
    pub static ref FILTER_WARNINGS: CounterVec = register_counter_vec!(
        "awardlens_filter_warnings_total",
        "Filter fields dropped with a warning",
        &["field"]
    ).unwrap();

    // === Latency Histograms ===

    /// Synchronous query duration
    pub static ref QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "awardlens_query_duration_seconds",
        "Synchronous query latency in seconds",
        &["operation"],
        vec![0.005, 0.025, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Job execution duration
    pub static ref JOB_DURATION: HistogramVec = register_histogram_vec!(
        "awardlens_job_duration_seconds",
        "Background job latency in seconds",
        &["kind"],
        vec![0.1, 1.0, 5.0, 30.0, 120.0, 600.0]
    ).unwrap();

    // === Jobs ===

    /// Job outcomes
    pub static ref JOBS_TOTAL: CounterVec = register_counter_vec!(
        "awardlens_jobs_total",
        "Background jobs by kind and terminal state",
        &["kind", "state"]
    ).unwrap();

    /// Job retries
    pub static ref JOB_RETRIES: CounterVec = register_counter_vec!(
        "awardlens_job_retries_total",
        "Background job retries by kind",
        &["kind"]
    ).unwrap();

    /// Jobs currently executing
    pub static ref ACTIVE_JOBS: Gauge = register_gauge!(
        "awardlens_active_jobs",
        "Number of jobs currently executing"
    ).unwrap();

    // === Export / Reaper ===

    /// CSV bytes written
    pub static ref EXPORT_BYTES: CounterVec = register_counter_vec!(
        "awardlens_export_bytes_total",
        "CSV bytes written by export mode",
        &["mode"]
    ).unwrap();

    /// Artifacts and manifests removed by the reaper
    pub static ref REAPED_TOTAL: CounterVec = register_counter_vec!(
        "awardlens_reaped_total",
        "Files removed by the reaper",
        &["kind"]
    ).unwrap();

    // === Errors / Health ===

    /// Total errors by code and operation
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "awardlens_errors_total",
        "Total errors by code and operation",
        &["code", "operation"]
    ).unwrap();

    /// Catalog sources currently loaded
    pub static ref CATALOG_SOURCES: Gauge = register_gauge!(
        "awardlens_catalog_sources",
        "Number of sources in the current catalog snapshot"
    ).unwrap();

    /// Health status (0=unhealthy, 1=healthy)
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "awardlens_health_status",
        "System health status (0=unhealthy, 1=healthy)"
    ).unwrap();
}

/// Initialize metrics system
pub fn init() {
    HEALTH_STATUS.set(1.0);
    tracing::info!("Metrics system initialized");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record a synchronous query
#[inline]
pub fn record_query(operation: &str, duration_secs: f64, success: bool) {
    let status = if success { "success" } else { "error" };
    QUERIES_TOTAL.with_label_values(&[operation, status]).inc();
    QUERY_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}

/// Record rows scanned on a tier
#[inline]
pub fn record_rows_scanned(tier: &str, rows: u64) {
    ROWS_SCANNED.with_label_values(&[tier]).inc_by(rows as f64);
}

/// Record a router decision
#[inline]
pub fn record_route(tier: &str, fallback: bool) {
    let fallback = if fallback { "true" } else { "false" };
    ROUTE_SELECTIONS.with_label_values(&[tier, fallback]).inc();
}

/// Record a dropped filter field
#[inline]
pub fn record_filter_warning(field: &str) {
    FILTER_WARNINGS.with_label_values(&[field]).inc();
}

/// Record a terminal job state
#[inline]
pub fn record_job(kind: &str, state: &str, duration_secs: f64) {
    JOBS_TOTAL.with_label_values(&[kind, state]).inc();
    JOB_DURATION.with_label_values(&[kind]).observe(duration_secs);
}

/// Record a job retry
#[inline]
pub fn record_job_retry(kind: &str) {
    JOB_RETRIES.with_label_values(&[kind]).inc();
}

/// Record exported bytes
#[inline]
pub fn record_export_bytes(mode: &str, bytes: u64) {
    EXPORT_BYTES.with_label_values(&[mode]).inc_by(bytes as f64);
}

/// Record files removed by the reaper
#[inline]
pub fn record_reaped(kind: &str, count: usize) {
    if count > 0 {
        REAPED_TOTAL.with_label_values(&[kind]).inc_by(count as f64);
    }
}

/// Record an error
#[inline]
pub fn record_error(code: &str, operation: &str) {
    ERRORS_TOTAL.with_label_values(&[code, operation]).inc();
}

/// Update the catalog source gauge
#[inline]
pub fn update_catalog_sources(count: usize) {
    CATALOG_SOURCES.set(count as f64);
}
