//! Artifact and job retention
//!
//! A sweep removes, in order:
//!
//! 1. jobs that finished more than the retention window ago, with their
//!    artifact, partial file and manifest
//! 2. partial files left behind by failed or cancelled jobs
//! 3. artifact files that belong to no tracked job and are older than the
//!    retention window

use crate::error::Result;
use crate::metrics;
use crate::tasks::job::{JobId, JobState};
use crate::tasks::store::JobStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Files and jobs removed by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapReport {
    /// Expired jobs forgotten
    pub jobs: usize,
    /// Artifacts deleted
    pub artifacts: usize,
    /// Partial files deleted
    pub partials: usize,
    /// Files deleted that no job referenced
    pub orphans: usize,
}

impl ReapReport {
    /// Whether the sweep removed nothing
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Retention sweeper over a [`JobStore`]
#[derive(Debug, Clone)]
pub struct Reaper {
    store: Arc<JobStore>,
    retention: Duration,
}

impl Reaper {
    /// Sweeper that keeps finished jobs for `retention`
    pub fn new(store: Arc<JobStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    /// Retention window
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Run one sweep as of `now`
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let mut report = ReapReport::default();
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));

        for job in self.store.list() {
            if !job.state.is_terminal() {
                continue;
            }
            if job.updated_at + retention <= now {
                report.artifacts += remove_if_exists(&self.store.artifact_path(job.id));
                report.partials += remove_if_exists(&self.store.partial_path(job.id));
                if self.store.remove(job.id).is_some() {
                    report.jobs += 1;
                }
                debug!(job = %job.id, state = %job.state, "Reaped expired job");
            } else if matches!(job.state, JobState::Failed | JobState::Cancelled) {
                report.partials += remove_if_exists(&self.store.partial_path(job.id));
            }
        }

        for entry in fs::read_dir(self.store.artifact_dir())? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(id) = artifact_job_id(&path) else {
                continue;
            };
            if self.store.contains(id) {
                continue;
            }
            let modified: DateTime<Utc> = fs::metadata(&path)?.modified()?.into();
            if modified + retention <= now {
                report.orphans += remove_if_exists(&path);
            }
        }

        metrics::record_reaped("job", report.jobs);
        metrics::record_reaped("artifact", report.artifacts);
        metrics::record_reaped("partial", report.partials);
        metrics::record_reaped("orphan", report.orphans);
        if !report.is_empty() {
            info!(
                jobs = report.jobs,
                artifacts = report.artifacts,
                partials = report.partials,
                orphans = report.orphans,
                "Reaper sweep"
            );
        }
        Ok(report)
    }
}

/// Job id of an artifact or partial file name
fn artifact_job_id(path: &Path) -> Option<JobId> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("csv") | Some("partial") => path.file_stem()?.to_str()?.parse().ok(),
        _ => None,
    }
}

fn remove_if_exists(path: &Path) -> usize {
    match fs::remove_file(path) {
        Ok(()) => 1,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to delete file");
            0
        },
    }
}
