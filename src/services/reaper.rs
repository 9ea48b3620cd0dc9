//! Reaper service
//!
//! Sweeps expired jobs and stale artifacts on a fixed interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::interval;

use crate::tasks::Reaper;

use super::framework::{RestartPolicy, Service, ServiceError, ServiceStatus};
use super::job_workers::JobWorkerService;

/// Periodic [`Reaper`] sweeps
pub struct ReaperService {
    reaper: Reaper,
    interval: Duration,
    status: RwLock<ServiceStatus>,
    sweeps: AtomicU64,
}

impl ReaperService {
    /// Sweep every `interval`
    pub fn new(reaper: Reaper, interval: Duration) -> Self {
        Self {
            reaper,
            interval: interval.max(Duration::from_millis(10)),
            status: RwLock::new(ServiceStatus::Stopped),
            sweeps: AtomicU64::new(0),
        }
    }

    /// Sweeps completed
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl Service for ReaperService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        tracing::debug!(
            interval_secs = self.interval.as_secs(),
            retention_secs = self.reaper.retention().as_secs(),
            "Reaper started"
        );
        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
                _ = ticker.tick() => {
                    let reaper = self.reaper.clone();
                    match tokio::task::spawn_blocking(move || reaper.sweep(Utc::now())).await {
                        Ok(Ok(_)) => {
                            self.sweeps.fetch_add(1, Ordering::Relaxed);
                        },
                        Ok(Err(e)) => tracing::error!(error = %e, "Reaper sweep failed"),
                        Err(e) => {
                            let reason = format!("sweep panicked: {}", e);
                            *self.status.write() = ServiceStatus::Failed(reason.clone());
                            return Err(ServiceError::RuntimeError(reason));
                        },
                    }
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::debug!("Reaper stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "reaper"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![JobWorkerService::NAME]
    }

    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::OnFailure {
            max_retries: 3,
            backoff: Duration::from_secs(30),
        }
    }
}
