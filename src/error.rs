//! Error types for the analytics core
//!
//! Every failure a caller can observe falls into one of a small number of
//! classes so that an HTTP binding (or any other transport) can tell
//! "your filters are wrong" apart from "the system couldn't complete this".

use crate::storage::SegmentError;
use serde::Serialize;
use thiserror::Error;

/// Source id of segment errors not yet tied to a catalog entry
pub(crate) const UNNAMED_SOURCE: &str = "<segment>";

/// Main error type for the analytics core
#[derive(Error, Debug)]
pub enum Error {
    /// The request as a whole could not be interpreted
    ///
    /// Individual malformed filter fields never produce this error; they are
    /// dropped with a warning by the filter compiler instead.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A required columnar source is missing or corrupt
    #[error("Source unavailable: {source_id}: {reason}")]
    SourceUnavailable {
        /// Catalog id of the source that failed
        source_id: String,
        /// What went wrong while opening or decoding it
        reason: String,
    },

    /// A synchronous request ran past its scan budget
    #[error("Resource exceeded: {0}")]
    ResourceExceeded(ResourceExceeded),

    /// A background job failed while executing
    #[error("Job execution failed: {0}")]
    JobExecution(String),

    /// No job with the given id exists (or it has already been reaped)
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Work stopped because a cancellation flag was raised
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Details attached to [`Error::ResourceExceeded`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceExceeded {
    /// Operation that ran out of budget (e.g. "aggregate")
    pub operation: String,
    /// Human readable reason
    pub reason: String,
    /// Job kind the caller should submit instead, if one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_job: Option<String>,
}

impl std::fmt::Display for ResourceExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.reason)?;
        if let Some(job) = &self.suggested_job {
            write!(f, " (submit a '{}' job instead)", job)?;
        }
        Ok(())
    }
}

/// Coarse classification used by transports to pick a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The caller should fix the request
    InvalidInput,
    /// The referenced entity does not exist
    NotFound,
    /// Retry later, or through the asynchronous job path
    Retryable,
    /// The dataset itself is unreadable
    Unavailable,
    /// The operation was cancelled by request
    Cancelled,
    /// Anything else
    Internal,
}

impl Error {
    /// Build a [`Error::ResourceExceeded`]
    pub fn resource_exceeded(
        operation: impl Into<String>,
        reason: impl Into<String>,
        suggested_job: Option<&str>,
    ) -> Self {
        Error::ResourceExceeded(ResourceExceeded {
            operation: operation.into(),
            reason: reason.into(),
            suggested_job: suggested_job.map(str::to_string),
        })
    }

    /// Build a [`Error::SourceUnavailable`]
    pub fn source_unavailable(source_id: impl Into<String>, reason: impl ToString) -> Self {
        Error::SourceUnavailable {
            source_id: source_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Attach a catalog id to an unavailable error raised below the catalog
    pub fn for_source(self, id: &str) -> Self {
        match self {
            Error::SourceUnavailable { source_id, reason } if source_id == UNNAMED_SOURCE => {
                Error::SourceUnavailable {
                    source_id: id.to_string(),
                    reason,
                }
            },
            other => other,
        }
    }

    /// Classify the error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Validation(_) => ErrorClass::InvalidInput,
            Error::JobNotFound(_) => ErrorClass::NotFound,
            Error::ResourceExceeded(_) => ErrorClass::Retryable,
            Error::SourceUnavailable { .. } => ErrorClass::Unavailable,
            Error::Cancelled => ErrorClass::Cancelled,
            Error::JobExecution(_)
            | Error::Configuration(_)
            | Error::Io(_)
            | Error::Serialization(_) => ErrorClass::Internal,
        }
    }

    /// Whether a background worker may retry the job that raised this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::SourceUnavailable { .. })
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::SourceUnavailable { .. } => "source_unavailable",
            Error::ResourceExceeded(_) => "resource_exceeded",
            Error::JobExecution(_) => "job_execution_error",
            Error::JobNotFound(_) => "job_not_found",
            Error::Cancelled => "cancelled",
            Error::Configuration(_) => "configuration_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<SegmentError> for Error {
    fn from(e: SegmentError) -> Self {
        Error::source_unavailable(UNNAMED_SOURCE, e)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
