//! Job model and lifecycle state machine
//!
//! ```text
//!            ┌──────────── cancel ─────────────┐
//!            │                                 ▼
//! Pending ─► Started{retries} ─► Progress{%} ─► Succeeded | Failed | Cancelled
//!               ▲      │              │
//!               └──────┴──── retry ───┘
//! ```
//!
//! A job is created once, mutated only through [`ExportJob::apply`], and
//! removed by the reaper after the retention window.

use crate::error::{Error, Result};
use crate::query::{FilterSpec, SearchPage};
use crate::types::Dimension;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// New random id
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(JobId)
            .map_err(|_| Error::JobNotFound(s.to_string()))
    }
}

/// What a job computes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum JobKind {
    /// CSV of every matching contract
    RowLevelExport,
    /// CSV of the groups of one dimension
    AggregatedExport {
        /// Grouping dimension
        dimension: Dimension,
    },
    /// Aggregate without the synchronous budget
    HeavyAggregate {
        /// Groups kept per dimension
        #[serde(rename = "topN", alias = "top_n")]
        top_n: usize,
    },
    /// Search without the synchronous budget
    FullTableSearch {
        /// Page window and ordering
        #[serde(flatten)]
        page: SearchPage,
    },
}

impl JobKind {
    /// Stable label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::RowLevelExport => "rowLevelExport",
            JobKind::AggregatedExport { .. } => "aggregatedExport",
            JobKind::HeavyAggregate { .. } => "heavyAggregate",
            JobKind::FullTableSearch { .. } => "fullTableSearch",
        }
    }

    /// Whether the job writes a CSV artifact
    pub fn is_export(&self) -> bool {
        matches!(self, JobKind::RowLevelExport | JobKind::AggregatedExport { .. })
    }

    /// Retries allowed after a retryable failure
    pub fn max_retries(&self) -> u32 {
        if self.is_export() {
            3
        } else {
            2
        }
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "phase")]
pub enum JobState {
    /// Queued, not picked up yet
    Pending,
    /// Picked up by a worker; `retries` counts restarted attempts
    Started {
        /// Attempts restarted after a retryable failure
        retries: u32,
    },
    /// Running, with a completion estimate
    Progress {
        /// 0..=100
        percent: u8,
    },
    /// Finished with a result
    Succeeded,
    /// Finished with an error
    Failed,
    /// Stopped on request
    Cancelled,
}

impl JobState {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }

    /// Stable label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Started { .. } => "started",
            JobState::Progress { .. } => "progress",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: &JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Pending, Started { retries: 0 }) => true,
            (Pending, Cancelled | Failed) => true,
            (Started { retries: a }, Started { retries: b }) => b > a,
            (Started { .. }, Progress { .. }) => true,
            (Progress { .. }, Started { retries }) => *retries > 0,
            (Progress { percent: a }, Progress { percent: b }) => b >= a,
            (Started { .. } | Progress { .. }, Succeeded | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Started { retries } if *retries > 0 => {
                write!(f, "started(retry {})", retries)
            },
            JobState::Progress { percent } => write!(f, "progress({})", percent),
            other => f.write_str(other.label()),
        }
    }
}

/// What a successful job produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum JobResult {
    /// A CSV file under the artifact directory
    Artifact {
        /// Artifact location
        path: PathBuf,
        /// Records written
        rows: u64,
        /// File size
        bytes: u64,
    },
    /// A JSON payload kept on the job record
    Inline {
        /// Response body
        payload: serde_json::Value,
    },
}

/// What a caller submits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Job kind
    pub kind: JobKind,
    /// Compiled filter
    #[serde(default)]
    pub filter: FilterSpec,
}

/// A tracked background job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    /// Job id
    pub id: JobId,
    /// Job kind
    pub kind: JobKind,
    /// Compiled filter
    pub filter: FilterSpec,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Last transition time
    pub updated_at: DateTime<Utc>,
    /// Current state
    pub state: JobState,
    /// Highest published progress
    pub progress: u8,
    /// Result once succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    /// Error once failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExportJob {
    /// New pending job
    pub fn new(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind: spec.kind,
            filter: spec.filter,
            created_at: now,
            updated_at: now,
            state: JobState::Pending,
            progress: 0,
            result: None,
            error: None,
        }
    }

    /// Move to `next`, keeping progress monotonic
    pub fn apply(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(&next) {
            return Err(Error::JobExecution(format!(
                "job {}: illegal transition {} -> {}",
                self.id, self.state, next
            )));
        }
        match next {
            JobState::Progress { percent } => self.progress = self.progress.max(percent.min(100)),
            JobState::Succeeded => self.progress = 100,
            _ => {},
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Status snapshot
    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id,
            kind: self.kind.clone(),
            state: self.state,
            progress: self.progress,
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Status payload of polls and push events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    /// Job id
    pub job_id: JobId,
    /// Job kind
    pub kind: JobKind,
    /// Current state
    pub state: JobState,
    /// Highest published progress
    pub progress: u8,
    /// Result once succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    /// Error once failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Last transition time
    pub updated_at: DateTime<Utc>,
}

/// Reply to a cancel request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelAck {
    /// Job id
    pub job_id: JobId,
    /// Whether this request cancelled the job
    pub cancelled: bool,
    /// State after the request
    pub state: JobState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ExportJob {
        ExportJob::new(JobSpec {
            kind: JobKind::RowLevelExport,
            filter: FilterSpec::default(),
        })
    }

    #[test]
    fn test_happy_path() {
        let mut j = job();
        j.apply(JobState::Started { retries: 0 }).unwrap();
        j.apply(JobState::Progress { percent: 40 }).unwrap();
        j.apply(JobState::Progress { percent: 60 }).unwrap();
        j.apply(JobState::Succeeded).unwrap();
        assert_eq!(j.progress, 100);
        assert!(j.state.is_terminal());
    }

    #[test]
    fn test_illegal_transitions() {
        let mut j = job();
        assert!(j.apply(JobState::Progress { percent: 10 }).is_err());
        j.apply(JobState::Started { retries: 0 }).unwrap();
        j.apply(JobState::Progress { percent: 40 }).unwrap();
        assert!(j.apply(JobState::Progress { percent: 30 }).is_err());
        j.apply(JobState::Cancelled).unwrap();
        assert!(j.apply(JobState::Succeeded).is_err());
        assert!(j.apply(JobState::Cancelled).is_err());
    }

    #[test]
    fn test_retry_keeps_progress() {
        let mut j = job();
        j.apply(JobState::Started { retries: 0 }).unwrap();
        j.apply(JobState::Progress { percent: 50 }).unwrap();
        j.apply(JobState::Started { retries: 1 }).unwrap();
        assert_eq!(j.progress, 50);
        assert!(j.apply(JobState::Started { retries: 1 }).is_err());
    }

    #[test]
    fn test_pending_can_be_cancelled() {
        let mut j = job();
        j.apply(JobState::Cancelled).unwrap();
        assert_eq!(j.state, JobState::Cancelled);
    }

    #[test]
    fn test_serialization_shapes() {
        let state = serde_json::to_value(JobState::Progress { percent: 40 }).unwrap();
        assert_eq!(state, serde_json::json!({"phase": "progress", "percent": 40}));
        let raw = serde_json::json!({"type": "aggregatedExport", "dimension": "area"});
        let kind: JobKind = serde_json::from_value(raw).unwrap();
        assert_eq!(kind, JobKind::AggregatedExport { dimension: Dimension::Area });
        let raw = serde_json::json!({"type": "heavyAggregate", "topN": 5});
        let kind: JobKind = serde_json::from_value(raw).unwrap();
        assert_eq!(kind.max_retries(), 2);
        assert_eq!(JobKind::RowLevelExport.max_retries(), 3);
    }

    #[test]
    fn test_job_id_parse() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("nope".parse::<JobId>().is_err());
    }
}
