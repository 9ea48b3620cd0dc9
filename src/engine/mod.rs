//! Analytics engine facade
//!
//! ```text
//!                  ┌──────────────────────┐
//!   requests ────▶ │   AnalyticsEngine    │
//!                  └──────────────────────┘
//!                     │               │
//!          synchronous│               │ background
//!                     ▼               ▼
//!           ┌──────────────┐   ┌──────────────────┐
//!           │ QueryEngine  │◀──│ TaskOrchestrator │  (QueryEngine is the JobRunner)
//!           └──────────────┘   └──────────────────┘
//!                  │                    │
//!                  ▼                    ▼
//!           CatalogHandle            JobStore ── ProgressChannel
//! ```
//!
//! Synchronous operations run on the caller's thread and fail with
//! [`Error::ResourceExceeded`] past their budget, naming the job kind that
//! runs the same request in the background.

pub mod builder;
pub mod query;
pub mod request;
mod runner;

pub use builder::AnalyticsEngineBuilder;
pub use query::{CatalogReload, QueryEngine};
pub use request::{
    parse_request, AggregateRequest, DistributionRequest, ExportOutcome, ExportRequest,
    JobRequest, PaginatedAggregateRequest, QueryResponse, RouteInfo, SearchRequest,
};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::query::ScanBudget;
use crate::services::{JobWorkerService, ReaperService, ServiceConfig, ServiceManager};
use crate::tasks::{
    CancelAck, JobId, JobKind, JobSpec, JobStatus, JobSubscription, Reaper, TaskOrchestrator,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Query side plus background jobs
#[derive(Clone)]
pub struct AnalyticsEngine {
    query: Arc<QueryEngine>,
    orchestrator: Arc<TaskOrchestrator>,
}

impl AnalyticsEngine {
    /// Start building an engine
    pub fn builder() -> AnalyticsEngineBuilder {
        AnalyticsEngineBuilder::new()
    }

    /// Synchronous operations
    pub fn query(&self) -> &Arc<QueryEngine> {
        &self.query
    }

    /// Background jobs
    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        self.query.config()
    }

    /// Export inline when small enough, otherwise as a background job
    pub fn export(&self, request: &ExportRequest) -> Result<QueryResponse<ExportOutcome>> {
        let (spec, warnings) = self.query.compile(&request.filter);
        let target = request.target();
        let budget = ScanBudget::synchronous(
            "export",
            &self.config().query,
            Some(query::export_job(target)),
        );
        let mut route = RouteInfo::default();
        let estimate = self.query.estimate_with(&spec, target, &budget, &mut route)?;

        let data = if estimate.inline && !request.background {
            let (csv, summary) = self.query.export_inline(&spec, target, estimate.row_count)?;
            ExportOutcome::Inline {
                csv,
                summary,
                estimate,
            }
        } else {
            let kind = match request.dimension {
                Some(dimension) => JobKind::AggregatedExport { dimension },
                None => JobKind::RowLevelExport,
            };
            let status = self.orchestrator.submit(JobSpec { kind, filter: spec })?;
            info!(
                job = %status.job_id,
                rows = estimate.row_count,
                bytes = estimate.estimated_bytes,
                "Export routed to background"
            );
            ExportOutcome::Job { status, estimate }
        };

        route.rows_scanned = budget.rows_scanned();
        route.elapsed_ms = budget.elapsed().as_millis() as u64;
        Ok(QueryResponse {
            data,
            warnings,
            route,
        })
    }

    /// Queue a background job
    pub fn submit_job(&self, request: &JobRequest) -> Result<JobStatus> {
        match &request.job {
            JobKind::HeavyAggregate { top_n } => {
                self.query.validate_top_n(*top_n)?;
            },
            JobKind::FullTableSearch { page } => self.query.validate_search_page(page)?,
            JobKind::RowLevelExport | JobKind::AggregatedExport { .. } => {},
        }
        let (filter, _) = self.query.compile(&request.filter);
        self.orchestrator.submit(JobSpec {
            kind: request.job.clone(),
            filter,
        })
    }

    /// Status of a job
    pub fn job_status(&self, id: JobId) -> Result<JobStatus> {
        self.orchestrator.status(id)
    }

    /// Request cancellation; a no-op for finished jobs
    pub fn cancel_job(&self, id: JobId) -> Result<CancelAck> {
        self.orchestrator.cancel(id)
    }

    /// Follow a job's progress
    pub fn subscribe(&self, id: JobId) -> Result<JobSubscription> {
        self.orchestrator.subscribe(id)
    }

    /// Parse a job id from a path segment
    pub fn parse_job_id(raw: &str) -> Result<JobId> {
        raw.parse()
            .map_err(|_| Error::Validation(format!("invalid job id '{}'", raw)))
    }

    /// Service manager running the job workers and the reaper
    pub fn services(&self, config: ServiceConfig) -> Result<ServiceManager> {
        let tasks = &self.config().tasks;
        let manager = ServiceManager::new(config);
        let reaper = Reaper::new(
            self.orchestrator.store().clone(),
            Duration::from_secs(tasks.retention_secs),
        );
        manager
            .register(Arc::new(JobWorkerService::new(self.orchestrator.clone())))
            .and_then(|()| {
                manager.register(Arc::new(ReaperService::new(
                    reaper,
                    Duration::from_secs(tasks.reaper_interval_secs),
                )))
            })
            .map_err(|e| Error::Configuration(e.to_string()))?;
        Ok(manager)
    }
}
