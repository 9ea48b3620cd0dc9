//! Request and response envelopes of the engine operations
//!
//! Every request embeds the raw filter fields at the top level, next to the
//! operation's own parameters:
//!
//! ```json
//! { "contractors": ["Acme Corp"], "valueRange": {"max": 1000000}, "page": 1, "pageSize": 20 }
//! ```

use crate::error::{Error, Result};
use crate::export::{ExportEstimate, ExportSummary, ExportTarget};
use crate::query::{FilterRequest, FilterWarning, RoutePlan, SearchPage, SortKey};
use crate::tasks::{JobKind, JobStatus};
use crate::types::{Dimension, SortDirection};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parse an operation request from a JSON body
///
/// A body that is not an object, or a field of the wrong JSON shape, is a
/// [`Error::Validation`].
pub fn parse_request<T: DeserializeOwned>(body: &Value) -> Result<T> {
    if !body.is_object() {
        return Err(Error::Validation("request body must be a JSON object".to_string()));
    }
    serde_json::from_value(body.clone())
        .map_err(|e| Error::Validation(format!("malformed request: {}", e)))
}

/// Row search
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    /// Filters
    #[serde(flatten)]
    pub filter: FilterRequest,
    /// Page window and ordering
    #[serde(flatten)]
    pub page: SearchPage,
}

/// Grouped aggregate
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRequest {
    /// Filters
    #[serde(flatten)]
    pub filter: FilterRequest,
    /// Groups kept per dimension
    #[serde(default, alias = "top_n")]
    pub top_n: Option<usize>,
    /// Dimensions to group by; all four when absent
    #[serde(default)]
    pub dimensions: Option<Vec<Dimension>>,
    /// Include `byYear` and `byMonth`
    #[serde(default, alias = "time_series")]
    pub time_series: bool,
}

/// One dimension, paginated
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedAggregateRequest {
    /// Filters
    #[serde(flatten)]
    pub filter: FilterRequest,
    /// Grouping dimension
    pub dimension: Dimension,
    /// 1-based page
    #[serde(default = "default_page")]
    pub page: u32,
    /// Groups per page
    #[serde(default = "default_page_size", alias = "page_size")]
    pub page_size: u32,
    /// Sort key
    #[serde(default, alias = "sort_by")]
    pub sort_by: SortKey,
    /// Sort direction
    #[serde(default, alias = "sort_dir", alias = "sortDirection")]
    pub sort_dir: SortDirection,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

/// Histogram or rounding analysis
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionRequest {
    /// Filters
    #[serde(flatten)]
    pub filter: FilterRequest,
    /// Histogram bins; the configured default when absent
    #[serde(default, alias = "num_bins", alias = "bins")]
    pub num_bins: Option<usize>,
}

/// Export estimate or export
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    /// Filters
    #[serde(flatten)]
    pub filter: FilterRequest,
    /// Aggregate by this dimension instead of exporting rows
    #[serde(default)]
    pub dimension: Option<Dimension>,
    /// Always run as a background job
    #[serde(default)]
    pub background: bool,
}

impl ExportRequest {
    /// What the export produces
    pub fn target(&self) -> ExportTarget {
        match self.dimension {
            Some(dimension) => ExportTarget::Aggregated { dimension },
            None => ExportTarget::Rows,
        }
    }
}

/// Background job submission
///
/// ```json
/// { "job": {"type": "heavyAggregate", "topN": 50}, "areas": ["Cebu"] }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    /// Filters
    #[serde(flatten)]
    pub filter: FilterRequest,
    /// What to run
    pub job: JobKind,
}

/// How a response was computed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
    /// Tiers read, one per plan
    pub tiers: Vec<String>,
    /// Source ids read
    pub sources: Vec<String>,
    /// Why narrower tiers were skipped
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<String>,
    /// Rows scanned
    pub rows_scanned: u64,
    /// Wall-clock time
    pub elapsed_ms: u64,
}

impl RouteInfo {
    /// Record a plan
    pub fn add(&mut self, plan: &RoutePlan) {
        self.tiers.push(plan.tier.to_string());
        self.sources
            .extend(plan.sources.iter().map(|s| s.id.clone()));
        if let Some(fallback) = &plan.fallback {
            self.fallbacks.push(fallback.clone());
        }
    }
}

/// Response body plus the filter warnings and route of the request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse<T> {
    /// Operation result
    #[serde(flatten)]
    pub data: T,
    /// Filter fields that were dropped
    pub warnings: Vec<FilterWarning>,
    /// Sources and tiers used
    pub route: RouteInfo,
}

/// Outcome of an export request
#[derive(Debug, Clone)]
pub enum ExportOutcome {
    /// CSV produced synchronously
    Inline {
        /// CSV bytes, header included
        csv: Vec<u8>,
        /// Records and bytes written
        summary: ExportSummary,
        /// Estimate that selected the inline path
        estimate: ExportEstimate,
    },
    /// Background job submitted
    Job {
        /// Initial job status
        status: JobStatus,
        /// Estimate that selected the job path
        estimate: ExportEstimate,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SearchSort;
    use serde_json::json;

    #[test]
    fn test_search_request_flattens_filters() {
        let req: SearchRequest = parse_request(&json!({
            "contractors": ["Acme Corp"],
            "valueRange": {"min": 0, "max": 1000000},
            "page": 2,
            "pageSize": 50,
            "sortBy": "contractAmount",
            "sortDir": "asc"
        }))
        .unwrap();
        assert_eq!(req.filter.contractors, vec!["Acme Corp"]);
        assert_eq!(req.page.page, 2);
        assert_eq!(req.page.page_size, 50);
        assert_eq!(req.page.sort_by, SearchSort::ContractAmount);
        assert_eq!(req.page.sort_dir, SortDirection::Asc);
    }

    #[test]
    fn test_defaults() {
        let req: PaginatedAggregateRequest =
            parse_request(&json!({"dimension": "contractor"})).unwrap();
        assert_eq!((req.page, req.page_size), (1, 20));
        assert_eq!(req.sort_by, SortKey::TotalValue);
        assert_eq!(req.sort_dir, SortDirection::Desc);

        let req: AggregateRequest = parse_request(&json!({"topN": 5})).unwrap();
        assert_eq!(req.top_n, Some(5));
        assert!(!req.time_series);
    }

    #[test]
    fn test_malformed_bodies() {
        assert!(matches!(
            parse_request::<SearchRequest>(&json!([1, 2])),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            parse_request::<SearchRequest>(&json!({"contractors": 7})),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_job_request() {
        let req: JobRequest = parse_request(&json!({
            "job": {"type": "heavyAggregate", "topN": 50},
            "areas": ["Cebu"]
        }))
        .unwrap();
        assert_eq!(req.job, JobKind::HeavyAggregate { top_n: 50 });
        assert_eq!(req.filter.areas, vec!["Cebu"]);
        assert!(parse_request::<JobRequest>(&json!({"areas": []})).is_err());
    }

    #[test]
    fn test_export_target() {
        let req: ExportRequest = parse_request(&json!({"dimension": "area"})).unwrap();
        assert_eq!(req.target(), ExportTarget::Aggregated { dimension: Dimension::Area });
        assert_eq!(ExportRequest::default().target(), ExportTarget::Rows);
    }
}
