//! Synchronous query operations
//!
//! Every operation follows the same path: compile the raw filters, route to
//! the narrowest sufficient tier, load the plan's sources through the shared
//! [`CatalogHandle`], then scan under a [`ScanBudget`]. Synchronous calls get
//! the configured wall-clock and row budget; the background job runner calls
//! the same `*_with` functions with an unlimited, cancellable budget.

use super::request::{
    AggregateRequest, DistributionRequest, ExportRequest, PaginatedAggregateRequest, QueryResponse,
    RouteInfo, SearchRequest,
};
use crate::catalog::{CatalogHandle, DatasetSource, VerifyReport};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::export::{ExportEstimate, ExportPipeline, ExportProgress, ExportSummary, ExportTarget};
use crate::metrics;
use crate::query::aggregate::validate_page;
use crate::query::histogram::{collect_amounts, value_distribution};
use crate::query::options::{filter_options, lookup_entities};
use crate::query::rounding::rounding_patterns;
use crate::query::scan::{count_rows, load_plan};
use crate::query::search::search;
use crate::query::{
    select_source, AggregateResponse, Aggregation, EntityLookup, EntityLookupResponse,
    FilterCompiler, FilterOptions, FilterRequest, FilterSpec, FilterWarning, LoadedSource,
    PaginatedAggregate, RequestedGrain, RoundingReport, RoutePlan, ScanBudget, SearchPage,
    SearchResponse, SortKey, ValueDistribution,
};
use crate::types::{Dimension, SortDirection};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Job kinds suggested when a synchronous budget runs out
pub(crate) const SEARCH_JOB: &str = "fullTableSearch";
pub(crate) const AGGREGATE_JOB: &str = "heavyAggregate";
pub(crate) const ROW_EXPORT_JOB: &str = "rowLevelExport";
pub(crate) const AGGREGATED_EXPORT_JOB: &str = "aggregatedExport";

/// Outcome of a catalog reload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogReload {
    /// Generation after the swap
    pub generation: u64,
    /// Sources discovered
    pub sources: usize,
}

/// Read-only query side of the engine
#[derive(Debug, Clone)]
pub struct QueryEngine {
    config: Arc<Config>,
    catalog: Arc<CatalogHandle>,
    exports: ExportPipeline,
}

impl QueryEngine {
    /// Bind to a catalog
    pub fn new(config: Arc<Config>, catalog: Arc<CatalogHandle>) -> Self {
        let exports = ExportPipeline::new(&config.export);
        Self {
            config,
            catalog,
            exports,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared catalog
    pub fn catalog(&self) -> &Arc<CatalogHandle> {
        &self.catalog
    }

    /// Export settings
    pub fn exports(&self) -> &ExportPipeline {
        &self.exports
    }

    // ========================================================================
    // Filters and routing
    // ========================================================================

    /// Compile raw filters against the current catalog's year window
    pub fn compile(&self, request: &FilterRequest) -> (FilterSpec, Vec<FilterWarning>) {
        let snapshot = self.catalog.snapshot();
        let fallback = (self.config.dataset.first_year, self.config.dataset.last_year);
        let (spec, warnings) = FilterCompiler::for_catalog(&snapshot, fallback).compile(request);
        if !warnings.is_empty() {
            warn!(
                dropped = warnings.len(),
                fields = ?warnings.iter().map(|w| w.field.as_str()).collect::<Vec<_>>(),
                "Filter fields dropped"
            );
        }
        (spec, warnings)
    }

    /// Route and load
    fn plan(
        &self,
        spec: &FilterSpec,
        grain: RequestedGrain,
    ) -> Result<(RoutePlan, Vec<LoadedSource>)> {
        let plan = select_source(&self.catalog.snapshot(), spec, grain)?;
        let sources = load_plan(&self.catalog, &plan)?;
        Ok((plan, sources))
    }

    fn resolve_top_n(&self, top_n: Option<usize>) -> Result<usize> {
        let max = self.config.query.max_top_n;
        match top_n {
            None => Ok(self.config.query.default_top_n.min(max)),
            Some(n) if n >= 1 && n <= max => Ok(n),
            Some(_) => Err(Error::Validation(format!("topN must be between 1 and {}", max))),
        }
    }

    fn resolve_num_bins(&self, num_bins: Option<usize>) -> Result<usize> {
        let max = self.config.query.max_num_bins;
        match num_bins {
            None => Ok(self.config.query.default_num_bins.min(max)),
            Some(n) if n >= 1 && n <= max => Ok(n),
            Some(_) => Err(Error::Validation(format!("numBins must be between 1 and {}", max))),
        }
    }

    pub(crate) fn validate_search_page(&self, page: &SearchPage) -> Result<()> {
        validate_page(page.page, page.page_size, self.config.query.max_page_size)
    }

    pub(crate) fn validate_top_n(&self, top_n: usize) -> Result<usize> {
        self.resolve_top_n(Some(top_n))
    }

    fn budget(&self, operation: &'static str, suggested_job: Option<&'static str>) -> ScanBudget {
        ScanBudget::synchronous(operation, &self.config.query, suggested_job)
    }

    /// Time an operation and record its outcome
    fn observe<T>(&self, operation: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let result = f();
        let secs = started.elapsed().as_secs_f64();
        metrics::record_query(operation, secs, result.is_ok());
        if let Err(e) = &result {
            metrics::record_error(e.code(), operation);
            match e {
                Error::Validation(_) | Error::ResourceExceeded(_) => {
                    debug!(operation, error = %e, "Query rejected")
                },
                _ => warn!(operation, error = %e, "Query failed"),
            }
        }
        result
    }

    fn respond<T>(
        data: T,
        warnings: Vec<FilterWarning>,
        mut route: RouteInfo,
        budget: &ScanBudget,
    ) -> QueryResponse<T> {
        route.rows_scanned = budget.rows_scanned();
        route.elapsed_ms = budget.elapsed().as_millis() as u64;
        QueryResponse {
            data,
            warnings,
            route,
        }
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// One page of matching contracts
    pub fn search(&self, request: &SearchRequest) -> Result<QueryResponse<SearchResponse>> {
        self.observe("search", || {
            self.validate_search_page(&request.page)?;
            let (spec, warnings) = self.compile(&request.filter);
            let budget = self.budget("search", Some(SEARCH_JOB));
            let mut route = RouteInfo::default();
            let data = self.search_with(&spec, &request.page, &budget, &mut route)?;
            Ok(Self::respond(data, warnings, route, &budget))
        })
    }

    /// Search under a caller-supplied budget
    pub fn search_with(
        &self,
        spec: &FilterSpec,
        page: &SearchPage,
        budget: &ScanBudget,
        route: &mut RouteInfo,
    ) -> Result<SearchResponse> {
        let (plan, sources) = self.plan(spec, RequestedGrain::RowLevel)?;
        budget.admit(plan.row_count())?;
        route.add(&plan);
        scanned(&plan, budget, || {
            search(
                &sources,
                &plan.predicate(spec),
                page,
                self.config.query.max_page_size,
                self.config.query.morsel_rows,
                budget,
            )
        })
    }

    // ========================================================================
    // Aggregation
    // ========================================================================

    /// Top groups per dimension plus the global summary
    pub fn aggregate(
        &self,
        request: &AggregateRequest,
    ) -> Result<QueryResponse<AggregateResponse>> {
        self.observe("aggregate", || {
            let top_n = self.resolve_top_n(request.top_n)?;
            let dimensions = requested_dimensions(request.dimensions.as_deref());
            let (spec, warnings) = self.compile(&request.filter);
            let budget = self.budget("aggregate", Some(AGGREGATE_JOB));
            let mut route = RouteInfo::default();
            let data = self.aggregate_with(
                &spec,
                &dimensions,
                request.time_series,
                top_n,
                &budget,
                &mut route,
            )?;
            Ok(Self::respond(data, warnings, route, &budget))
        })
    }

    /// Aggregate under a caller-supplied budget
    ///
    /// Without a time series, and when every dimension has a sufficient
    /// rollup, each dimension is read from its rollup and the summary from
    /// the first one. Otherwise a single fact pass feeds every dimension.
    pub fn aggregate_with(
        &self,
        spec: &FilterSpec,
        dimensions: &[Dimension],
        time_series: bool,
        top_n: usize,
        budget: &ScanBudget,
        route: &mut RouteInfo,
    ) -> Result<AggregateResponse> {
        let morsel_rows = self.config.query.morsel_rows;

        if !time_series && !dimensions.is_empty() {
            let snapshot = self.catalog.snapshot();
            let plans = dimensions
                .iter()
                .map(|d| select_source(&snapshot, spec, RequestedGrain::Dimension(*d)))
                .collect::<Result<Vec<_>>>()?;
            if plans.iter().all(|p| p.tier.rollup_dimension().is_some()) {
                budget.admit(plans.iter().map(RoutePlan::row_count).sum())?;
                let mut response = AggregateResponse::default();
                for (i, (dimension, plan)) in dimensions.iter().zip(&plans).enumerate() {
                    let sources = load_plan(&self.catalog, plan)?;
                    route.add(plan);
                    let aggregation = scanned(plan, budget, || {
                        Aggregation::compute(
                            &sources,
                            &plan.predicate(spec),
                            &[*dimension],
                            false,
                            morsel_rows,
                            budget,
                        )
                    })?;
                    if i == 0 {
                        response.summary = aggregation.summary();
                    }
                    let mut rows = aggregation.sorted_rows(
                        *dimension,
                        SortKey::TotalValue,
                        SortDirection::Desc,
                    );
                    rows.truncate(top_n);
                    *response.rows_mut(*dimension) = rows;
                }
                return Ok(response);
            }
        }

        let (plan, sources) = self.plan(spec, RequestedGrain::Summary)?;
        budget.admit(plan.row_count())?;
        route.add(&plan);
        let aggregation = scanned(&plan, budget, || {
            Aggregation::compute(
                &sources,
                &plan.predicate(spec),
                dimensions,
                time_series,
                morsel_rows,
                budget,
            )
        })?;
        Ok(aggregation.into_response(top_n))
    }

    /// One page of a single dimension's groups
    pub fn aggregate_paginated(
        &self,
        request: &PaginatedAggregateRequest,
    ) -> Result<QueryResponse<PaginatedAggregate>> {
        self.observe("aggregate_paginated", || {
            validate_page(request.page, request.page_size, self.config.query.max_page_size)?;
            let (spec, warnings) = self.compile(&request.filter);
            let budget = self.budget("aggregate_paginated", Some(AGGREGATE_JOB));
            let mut route = RouteInfo::default();
            let aggregation = self.group_by(&spec, request.dimension, &budget, &mut route)?;
            let data = aggregation.paginate(
                request.dimension,
                request.page,
                request.page_size,
                request.sort_by,
                request.sort_dir,
            );
            Ok(Self::respond(data, warnings, route, &budget))
        })
    }

    /// Every group of one dimension
    fn group_by(
        &self,
        spec: &FilterSpec,
        dimension: Dimension,
        budget: &ScanBudget,
        route: &mut RouteInfo,
    ) -> Result<Aggregation> {
        let (plan, sources) = self.plan(spec, RequestedGrain::Dimension(dimension))?;
        budget.admit(plan.row_count())?;
        route.add(&plan);
        scanned(&plan, budget, || {
            Aggregation::compute(
                &sources,
                &plan.predicate(spec),
                &[dimension],
                false,
                self.config.query.morsel_rows,
                budget,
            )
        })
    }

    // ========================================================================
    // Distribution
    // ========================================================================

    /// Histogram of matching contract amounts
    pub fn value_distribution(
        &self,
        request: &DistributionRequest,
    ) -> Result<QueryResponse<ValueDistribution>> {
        self.observe("value_distribution", || {
            let num_bins = self.resolve_num_bins(request.num_bins)?;
            let (spec, warnings) = self.compile(&request.filter);
            let budget = self.budget("value_distribution", None);
            let mut route = RouteInfo::default();
            let (plan, sources) = self.plan(&spec, RequestedGrain::Summary)?;
            budget.admit(plan.row_count())?;
            route.add(&plan);
            let sample = scanned(&plan, &budget, || {
                collect_amounts(
                    &sources,
                    &plan.predicate(&spec),
                    self.config.query.morsel_rows,
                    &budget,
                )
            })?;
            let data = value_distribution(&sample, num_bins);
            Ok(Self::respond(data, warnings, route, &budget))
        })
    }

    /// Rounding heuristic over matching contract amounts
    pub fn rounding_patterns(
        &self,
        request: &FilterRequest,
    ) -> Result<QueryResponse<RoundingReport>> {
        self.observe("rounding_patterns", || {
            let (spec, warnings) = self.compile(request);
            let budget = self.budget("rounding_patterns", None);
            let mut route = RouteInfo::default();
            let (plan, sources) = self.plan(&spec, RequestedGrain::Summary)?;
            budget.admit(plan.row_count())?;
            route.add(&plan);
            let sample = scanned(&plan, &budget, || {
                collect_amounts(
                    &sources,
                    &plan.predicate(&spec),
                    self.config.query.morsel_rows,
                    &budget,
                )
            })?;
            let data = rounding_patterns(&sample, &self.config.rounding);
            if data.is_suspicious {
                debug!(
                    score = data.suspicion_score,
                    reasons = ?data.reasons,
                    "Suspicious rounding"
                );
            }
            Ok(Self::respond(data, warnings, route, &budget))
        })
    }

    // ========================================================================
    // Export
    // ========================================================================

    /// Size of an export without producing it
    pub fn estimate(&self, request: &ExportRequest) -> Result<QueryResponse<ExportEstimate>> {
        self.observe("export_estimate", || {
            let (spec, warnings) = self.compile(&request.filter);
            let target = request.target();
            let budget = self.budget("export_estimate", Some(export_job(target)));
            let mut route = RouteInfo::default();
            let data = self.estimate_with(&spec, target, &budget, &mut route)?;
            Ok(Self::respond(data, warnings, route, &budget))
        })
    }

    /// Estimate under a caller-supplied budget
    pub fn estimate_with(
        &self,
        spec: &FilterSpec,
        target: ExportTarget,
        budget: &ScanBudget,
        route: &mut RouteInfo,
    ) -> Result<ExportEstimate> {
        let records = match target {
            ExportTarget::Rows => self.count_matching(spec, budget, route)?,
            ExportTarget::Aggregated { dimension } => {
                self.group_by(spec, dimension, budget, route)?.group_count(dimension) as u64
            },
        };
        Ok(self.exports.estimate(target, records))
    }

    /// Number of contracts matching a filter
    pub fn count_matching(
        &self,
        spec: &FilterSpec,
        budget: &ScanBudget,
        route: &mut RouteInfo,
    ) -> Result<u64> {
        let (plan, sources) = self.plan(spec, RequestedGrain::RowLevel)?;
        route.add(&plan);
        let predicate = plan.predicate(spec);
        scanned(&plan, budget, || {
            sources.iter().try_fold(0u64, |total, source| {
                let bound = source.bind(&predicate)?;
                let n = count_rows(
                    source.data.row_count(),
                    &bound,
                    self.config.query.morsel_rows,
                    budget,
                )?;
                Ok(total + n)
            })
        })
    }

    /// Stream matching contracts as CSV
    pub fn export_rows_to<W: Write>(
        &self,
        spec: &FilterSpec,
        sink: W,
        expected_rows: u64,
        budget: &ScanBudget,
        progress: &mut dyn FnMut(ExportProgress),
    ) -> Result<ExportSummary> {
        let (plan, sources) = self.plan(spec, RequestedGrain::RowLevel)?;
        scanned(&plan, budget, || {
            self.exports.export_rows(
                &sources,
                &plan.predicate(spec),
                sink,
                expected_rows,
                budget,
                progress,
            )
        })
    }

    /// Write every group of a dimension as CSV, largest total first
    pub fn export_aggregated_to<W: Write>(
        &self,
        spec: &FilterSpec,
        dimension: Dimension,
        sink: W,
        budget: &ScanBudget,
        progress: &mut dyn FnMut(ExportProgress),
    ) -> Result<ExportSummary> {
        let mut route = RouteInfo::default();
        let rows = self
            .group_by(spec, dimension, budget, &mut route)?
            .sorted_rows(dimension, SortKey::TotalValue, SortDirection::Desc);
        self.exports.export_aggregated(&rows, sink, budget, progress)
    }

    /// Produce a small export in memory
    pub fn export_inline(
        &self,
        spec: &FilterSpec,
        target: ExportTarget,
        expected_rows: u64,
    ) -> Result<(Vec<u8>, ExportSummary)> {
        let budget = self.budget("export", Some(export_job(target)));
        let mut csv = Vec::new();
        let summary = match target {
            ExportTarget::Rows => {
                self.export_rows_to(spec, &mut csv, expected_rows, &budget, &mut |_| {})?
            },
            ExportTarget::Aggregated { dimension } => {
                self.export_aggregated_to(spec, dimension, &mut csv, &budget, &mut |_| {})?
            },
        };
        metrics::record_export_bytes("inline", summary.bytes);
        debug!(rows = summary.rows, bytes = summary.bytes, "Inline export written");
        Ok((csv, summary))
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    /// Distinct entity values and covered years
    pub fn filter_options(&self) -> Result<FilterOptions> {
        self.observe("filter_options", || {
            filter_options(
                &self.catalog,
                (self.config.dataset.first_year, self.config.dataset.last_year),
            )
        })
    }

    /// Entity labels matching a lookup
    pub fn lookup(&self, request: &EntityLookup) -> Result<EntityLookupResponse> {
        self.observe("lookup", || {
            lookup_entities(&self.catalog, request, self.config.query.max_top_n)
        })
    }

    /// Sources of the current snapshot
    pub fn catalog_sources(&self) -> Vec<Arc<DatasetSource>> {
        self.catalog.snapshot().sources()
    }

    /// Rediscover the dataset directory and swap the snapshot
    pub fn reload(&self) -> Result<CatalogReload> {
        let snapshot = self.catalog.reload()?;
        metrics::update_catalog_sources(snapshot.len());
        let reload = CatalogReload {
            generation: self.catalog.generation(),
            sources: snapshot.len(),
        };
        info!(generation = reload.generation, sources = reload.sources, "Catalog reloaded");
        Ok(reload)
    }

    /// Checksum every source
    pub fn verify(&self) -> VerifyReport {
        let report = self.catalog.verify();
        if !report.is_healthy() {
            warn!(
                generation = report.generation,
                failed = report.sources.iter().filter(|s| !s.ok).count(),
                "Catalog verification failed"
            );
        }
        report
    }
}

/// Job kind that produces the same export in the background
pub(crate) fn export_job(target: ExportTarget) -> &'static str {
    match target {
        ExportTarget::Rows => ROW_EXPORT_JOB,
        ExportTarget::Aggregated { .. } => AGGREGATED_EXPORT_JOB,
    }
}

/// Requested dimensions in order, without duplicates; all four when absent
pub(crate) fn requested_dimensions(requested: Option<&[Dimension]>) -> Vec<Dimension> {
    match requested {
        Some(dimensions) if !dimensions.is_empty() => {
            let mut out = Vec::with_capacity(dimensions.len());
            for d in dimensions {
                if !out.contains(d) {
                    out.push(*d);
                }
            }
            out
        },
        _ => Dimension::ALL.to_vec(),
    }
}

/// Run a scan and attribute the rows it read to the plan's tier
fn scanned<T>(plan: &RoutePlan, budget: &ScanBudget, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let before = budget.rows_scanned();
    let result = f();
    metrics::record_rows_scanned(plan.tier.label(), budget.rows_scanned().saturating_sub(before));
    result
}
