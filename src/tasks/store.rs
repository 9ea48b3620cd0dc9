//! Job store
//!
//! Jobs live in a concurrent map so status polls never wait on the worker
//! that owns a job. Terminal jobs are also written as JSON manifests under
//! `{artifact_dir}/jobs/` and restored at startup; a manifest found in a
//! non-terminal state belonged to a process that died, and is restored as
//! `Failed`.

use crate::error::{Error, Result};
use crate::metrics;
use crate::tasks::job::{ExportJob, JobId, JobState};
use dashmap::DashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const MANIFEST_DIR: &str = "jobs";
const INTERRUPTED: &str = "interrupted by restart";

/// Concurrent job map with on-disk manifests
#[derive(Debug)]
pub struct JobStore {
    jobs: DashMap<JobId, ExportJob>,
    artifact_dir: PathBuf,
}

impl JobStore {
    /// Open the store, creating directories and restoring manifests
    pub fn open(artifact_dir: impl Into<PathBuf>) -> Result<Self> {
        let artifact_dir = artifact_dir.into();
        fs::create_dir_all(artifact_dir.join(MANIFEST_DIR))?;
        let store = Self {
            jobs: DashMap::new(),
            artifact_dir,
        };
        let restored = store.restore()?;
        if restored > 0 {
            info!(jobs = restored, "Restored job manifests");
        }
        Ok(store)
    }

    fn restore(&self) -> Result<usize> {
        let mut restored = 0;
        for entry in fs::read_dir(self.manifest_dir())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let mut job: ExportJob = match fs::read(&path)
                .map_err(Error::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(Error::from))
            {
                Ok(job) => job,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable job manifest");
                    continue;
                },
            };
            if !job.state.is_terminal() {
                job.state = JobState::Failed;
                job.error = Some(INTERRUPTED.to_string());
                self.write_manifest(&job)?;
            }
            self.jobs.insert(job.id, job);
            restored += 1;
        }
        Ok(restored)
    }

    /// Artifact directory
    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    fn manifest_dir(&self) -> PathBuf {
        self.artifact_dir.join(MANIFEST_DIR)
    }

    /// Manifest location of a job
    pub fn manifest_path(&self, id: JobId) -> PathBuf {
        self.manifest_dir().join(format!("{}.json", id))
    }

    /// Final artifact location of a job
    pub fn artifact_path(&self, id: JobId) -> PathBuf {
        self.artifact_dir.join(format!("{}.csv", id))
    }

    /// In-progress artifact location of a job
    pub fn partial_path(&self, id: JobId) -> PathBuf {
        self.artifact_dir.join(format!("{}.partial", id))
    }

    /// Track a new job
    pub fn insert(&self, job: ExportJob) {
        self.jobs.insert(job.id, job);
    }

    /// Snapshot of a job
    pub fn get(&self, id: JobId) -> Option<ExportJob> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    /// Mutate a job in place and return a snapshot
    ///
    /// The manifest is written when the job ends up terminal. A failed write
    /// is logged and counted but does not undo the transition: the in-memory
    /// state is what status polls and subscribers see, and the job is then
    /// simply not restored after a restart.
    pub fn update<F>(&self, id: JobId, f: F) -> Result<ExportJob>
    where
        F: FnOnce(&mut ExportJob) -> Result<()>,
    {
        let snapshot = {
            let mut entry = self
                .jobs
                .get_mut(&id)
                .ok_or_else(|| Error::JobNotFound(id.to_string()))?;
            f(&mut entry)?;
            entry.clone()
        };
        if snapshot.state.is_terminal() {
            if let Err(e) = self.write_manifest(&snapshot) {
                error!(
                    job = %id,
                    state = %snapshot.state,
                    error = %e,
                    "Failed to write job manifest"
                );
                metrics::record_error(e.code(), "job_manifest");
            }
        }
        Ok(snapshot)
    }

    /// Apply a state transition
    pub fn transition(&self, id: JobId, next: JobState) -> Result<ExportJob> {
        self.update(id, |job| job.apply(next))
    }

    /// Forget a job and delete its manifest
    pub fn remove(&self, id: JobId) -> Option<ExportJob> {
        let removed = self.jobs.remove(&id).map(|(_, job)| job);
        let manifest = self.manifest_path(id);
        if manifest.exists() {
            if let Err(e) = fs::remove_file(&manifest) {
                warn!(job = %id, error = %e, "Failed to delete job manifest");
            }
        }
        removed
    }

    /// Snapshot of every job
    pub fn list(&self) -> Vec<ExportJob> {
        self.jobs.iter().map(|j| j.value().clone()).collect()
    }

    /// Number of tracked jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no job is tracked
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Whether a job id is tracked
    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    fn write_manifest(&self, job: &ExportJob) -> Result<()> {
        let path = self.manifest_path(job.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(job)?)?;
        fs::rename(&tmp, &path)?;
        debug!(job = %job.id, state = %job.state, "Job manifest written");
        Ok(())
    }
}
