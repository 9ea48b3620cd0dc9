//! Response types of the HTTP binding
//!
//! Operation bodies come from the library (`QueryResponse<T>`, `JobStatus`,
//! ...); this module only holds the envelopes the transport adds.

use awardlens::error::{Error, ErrorClass};
use awardlens::export::ExportEstimate;
use awardlens::query::FilterWarning;
use awardlens::services::ServiceHealth;
use awardlens::tasks::JobStatus;
use serde::Serialize;

// =============================================================================
// Errors
// =============================================================================

/// Error envelope
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Structured error
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Stable machine-readable code
    pub code: &'static str,
    /// Coarse class: fix the input, retry, or give up
    pub class: ErrorClass,
    pub message: String,
    /// Whether the same request may succeed later
    pub retryable: bool,
    /// Extra fields, e.g. the job kind to submit instead
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&Error> for ErrorResponse {
    fn from(e: &Error) -> Self {
        let details = match e {
            Error::ResourceExceeded(info) => serde_json::to_value(info).ok(),
            Error::SourceUnavailable { source_id, .. } => {
                Some(serde_json::json!({ "sourceId": source_id }))
            },
            _ => None,
        };
        Self {
            error: ErrorBody {
                code: e.code(),
                class: e.class(),
                message: e.to_string(),
                retryable: e.class() == ErrorClass::Retryable || e.is_retryable(),
                details,
            },
        }
    }
}

// =============================================================================
// Export
// =============================================================================

/// Response of an export routed to the background
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub estimate: ExportEstimate,
    pub warnings: Vec<FilterWarning>,
}

// =============================================================================
// Health
// =============================================================================

/// Health check body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub catalog: CatalogHealth,
    pub active_jobs: usize,
    pub services: ServiceHealth,
}

/// Catalog part of the health check
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogHealth {
    pub generation: u64,
    pub sources: usize,
    pub skipped: usize,
    pub segment_loads: u64,
    pub cache_hits: u64,
}
