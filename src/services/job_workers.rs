//! Job worker service
//!
//! Runs the [`TaskOrchestrator`] worker pool under the service manager.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::tasks::TaskOrchestrator;

use super::framework::{RestartPolicy, Service, ServiceError, ServiceStatus};

/// Service wrapper around the orchestrator's workers
pub struct JobWorkerService {
    orchestrator: Arc<TaskOrchestrator>,
    status: RwLock<ServiceStatus>,
}

impl JobWorkerService {
    /// Name other services depend on
    pub const NAME: &'static str = "job_workers";

    /// Wrap an orchestrator
    pub fn new(orchestrator: Arc<TaskOrchestrator>) -> Self {
        Self {
            orchestrator,
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }
}

#[async_trait::async_trait]
impl Service for JobWorkerService {
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        self.orchestrator.run_workers(shutdown).await;
        *self.status.write() = ServiceStatus::Stopped;
        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }

    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::Always {
            backoff: Duration::from_secs(1),
        }
    }
}
