//! Background execution of job kinds
//!
//! Exports stream into `{jobId}.partial` and are renamed on success; the
//! other kinds keep their JSON response on the job record. Non-export jobs
//! publish fixed milestones (10 started, 50 scanned, 90 serialized).

use super::query::{requested_dimensions, QueryEngine};
use super::request::RouteInfo;
use crate::error::{Error, Result};
use crate::export::ExportProgress;
use crate::metrics;
use crate::tasks::{ExportJob, JobContext, JobKind, JobResult, JobRunner};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use tracing::{debug, info};

impl JobRunner for QueryEngine {
    fn run(&self, job: &ExportJob, ctx: &JobContext) -> Result<JobResult> {
        let budget = ctx.budget(job.kind.label());
        let mut route = RouteInfo::default();

        match &job.kind {
            JobKind::RowLevelExport => {
                let expected = self.count_matching(&job.filter, &budget, &mut route)?;
                ctx.report(1)?;
                let mut out = BufWriter::new(File::create(ctx.partial_path())?);
                let summary = self.export_rows_to(
                    &job.filter,
                    &mut out,
                    expected,
                    &budget,
                    &mut progress_reporter(ctx),
                )?;
                finish_file(out)?;
                metrics::record_export_bytes("job", summary.bytes);
                info!(
                    job = %ctx.id(),
                    rows = summary.rows,
                    chunks = summary.chunks,
                    "Row export written"
                );
                ctx.commit_artifact(summary.rows, summary.bytes)
            },
            JobKind::AggregatedExport { dimension } => {
                ctx.report(1)?;
                let mut out = BufWriter::new(File::create(ctx.partial_path())?);
                let summary = self.export_aggregated_to(
                    &job.filter,
                    *dimension,
                    &mut out,
                    &budget,
                    &mut progress_reporter(ctx),
                )?;
                finish_file(out)?;
                metrics::record_export_bytes("job", summary.bytes);
                info!(
                    job = %ctx.id(),
                    dimension = %dimension,
                    groups = summary.rows,
                    "Aggregated export written"
                );
                ctx.commit_artifact(summary.rows, summary.bytes)
            },
            JobKind::HeavyAggregate { top_n } => {
                let top_n = self.validate_top_n(*top_n)?;
                ctx.report(10)?;
                let response = self.aggregate_with(
                    &job.filter,
                    &requested_dimensions(None),
                    true,
                    top_n,
                    &budget,
                    &mut route,
                )?;
                ctx.report(50)?;
                let payload = to_payload(&response)?;
                ctx.report(90)?;
                debug!(job = %ctx.id(), tiers = ?route.tiers, "Heavy aggregate computed");
                Ok(JobResult::Inline { payload })
            },
            JobKind::FullTableSearch { page } => {
                self.validate_search_page(page)?;
                ctx.report(10)?;
                let response = self.search_with(&job.filter, page, &budget, &mut route)?;
                ctx.report(50)?;
                let payload = to_payload(&response)?;
                ctx.report(90)?;
                debug!(
                    job = %ctx.id(),
                    total = response.pagination.total_count,
                    "Full table search computed"
                );
                Ok(JobResult::Inline { payload })
            },
        }
    }
}

/// Forward export chunk progress to the job record
///
/// A failed report means the job was cancelled; the budget check at the same
/// chunk boundary stops the export.
fn progress_reporter(ctx: &JobContext) -> impl FnMut(ExportProgress) + '_ {
    move |progress| {
        if let Err(e) = ctx.report(progress.percent()) {
            debug!(job = %ctx.id(), error = %e, "Progress not recorded");
        }
    }
}

fn finish_file(mut out: BufWriter<File>) -> Result<()> {
    out.flush()?;
    let file = out
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

fn to_payload<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| Error::Serialization(e.to_string()))
}
