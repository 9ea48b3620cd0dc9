//! Tier router
//!
//! [`select_source`] picks the narrowest precomputed source that can answer a
//! request exactly. It is a pure function of the catalog snapshot, the
//! compiled filter and the requested grain.
//!
//! ```text
//! keywords or row-level ─────────────► title-search facts (+ specialized)
//! pure dimension rollup ─────────────► agg_<dimension>
//! one year / one quarter ────────────► partition rollup or facts
//! anything else ─────────────────────► full facts (+ specialized)
//! ```
//!
//! Missing precomputed tables are never fatal: the plan falls through to the
//! next rule and records why. Only a missing base fact table is an error.

use crate::catalog::{Catalog, DatasetSource, FactVariant, PartitionContent, Period};
use crate::error::{Error, Result};
use crate::query::filter::{FilterSpec, TimeRange};
use crate::query::predicate::{ColumnLayout, Predicate};
use crate::types::Dimension;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Catalog id reported when the base fact table is missing
pub const BASE_FACT_ID: &str = "facts_awards_all_time";

/// Shape of the answer the caller needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedGrain {
    /// Individual contracts (search, row export)
    RowLevel,
    /// Global totals only
    Summary,
    /// Groups keyed by one dimension
    Dimension(Dimension),
}

/// Tier a plan reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "tier")]
pub enum Tier {
    /// Fact table with precomputed search text
    TitleSearch,
    /// Full raw fact table
    FullFact,
    /// All-time rollup
    DimensionRollup {
        /// Rollup dimension
        dimension: Dimension,
    },
    /// Time partition
    Partition {
        /// Covered period
        period: Period,
        /// Facts or rollup
        content: PartitionContent,
    },
}

impl Tier {
    /// Short label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            Tier::TitleSearch => "title_search",
            Tier::FullFact => "full_fact",
            Tier::DimensionRollup { .. } => "rollup",
            Tier::Partition {
                content: PartitionContent::Facts,
                ..
            } => "partition_facts",
            Tier::Partition {
                content: PartitionContent::Rollup(_),
                ..
            } => "partition_rollup",
        }
    }

    /// Rollup dimension if the tier is aggregated
    pub fn rollup_dimension(&self) -> Option<Dimension> {
        match self {
            Tier::DimensionRollup { dimension } => Some(*dimension),
            Tier::Partition {
                content: PartitionContent::Rollup(d),
                ..
            } => Some(*d),
            _ => None,
        }
    }

    /// Whether rows of this tier are individual contracts
    pub fn is_row_level(&self) -> bool {
        self.rollup_dimension().is_none()
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Partition { period, .. } => write!(f, "{}:{}", self.label(), period),
            Tier::DimensionRollup { dimension } => write!(f, "{}:{}", self.label(), dimension),
            _ => f.write_str(self.label()),
        }
    }
}

/// Sources chosen for a request
#[derive(Debug, Clone)]
pub struct RoutePlan {
    /// Primary tier
    pub tier: Tier,
    /// Sources to scan, primary first
    pub sources: Vec<Arc<DatasetSource>>,
    /// Why a narrower tier could not be used
    pub fallback: Option<String>,
}

impl RoutePlan {
    /// Predicate to apply on this plan's sources
    ///
    /// Fact tiers re-apply the whole filter. Rollup tiers are only chosen when
    /// the filter reduces to entity terms on the rollup dimension (plus the
    /// period the partition already represents), so only those terms remain.
    pub fn predicate(&self, spec: &FilterSpec) -> Predicate {
        match self.tier.rollup_dimension() {
            None => spec.predicate(),
            Some(dimension) => {
                let mut entity_only = FilterSpec::default();
                match dimension {
                    Dimension::Contractor => entity_only.contractors = spec.contractors.clone(),
                    Dimension::Organization => {
                        entity_only.organizations = spec.organizations.clone()
                    },
                    Dimension::Area => entity_only.areas = spec.areas.clone(),
                    Dimension::BusinessCategory => {
                        entity_only.business_categories = spec.business_categories.clone()
                    },
                }
                entity_only.predicate()
            },
        }
    }

    /// Column layout of a source in this plan
    pub fn layout(source: &DatasetSource) -> ColumnLayout {
        match source.grain.rollup_dimension() {
            Some(d) => ColumnLayout::Rollup(d),
            None => ColumnLayout::Fact,
        }
    }

    /// Rows the plan reads, from catalog metadata
    pub fn row_count(&self) -> u64 {
        self.sources.iter().map(|s| s.row_count).sum()
    }

    /// Source ids, for logging
    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.id.as_str()).collect()
    }
}

struct Planner<'a> {
    catalog: &'a Catalog,
    spec: &'a FilterSpec,
    notes: Vec<String>,
}

impl<'a> Planner<'a> {
    fn note(&mut self, what: impl Into<String>) {
        self.notes.push(what.into());
    }

    /// Rollup tiers need the filter to reduce to entity terms on `dimension`
    fn is_pure_for(&self, dimension: Dimension) -> bool {
        !self.spec.has_keywords()
            && self.spec.value_range.is_unconstrained()
            && !self.spec.include_specialized
            && self
                .spec
                .constrained_dimensions()
                .iter()
                .all(|d| *d == dimension)
    }

    fn with_specialized(
        &mut self,
        mut sources: Vec<Arc<DatasetSource>>,
    ) -> Vec<Arc<DatasetSource>> {
        if self.spec.include_specialized {
            match self.catalog.fact_table(FactVariant::Specialized) {
                Some(s) => sources.push(s),
                None => self.note("specialized dataset not available"),
            }
        }
        sources
    }

    fn finish(mut self, tier: Tier, sources: Vec<Arc<DatasetSource>>) -> RoutePlan {
        let sources = if tier.is_row_level() {
            self.with_specialized(sources)
        } else {
            sources
        };
        let fallback = if self.notes.is_empty() {
            None
        } else {
            Some(self.notes.join("; "))
        };
        RoutePlan {
            tier,
            sources,
            fallback,
        }
    }

    fn title_search(mut self) -> Result<RoutePlan> {
        if let Some(s) = self.catalog.fact_table(FactVariant::TitleSearch) {
            return Ok(self.finish(Tier::TitleSearch, vec![s]));
        }
        self.note("title-search table not available");
        self.full_fact()
    }

    fn full_fact(self) -> Result<RoutePlan> {
        match self.catalog.fact_table(FactVariant::Full) {
            Some(s) => Ok(self.finish(Tier::FullFact, vec![s])),
            None => Err(Error::source_unavailable(
                BASE_FACT_ID,
                "base fact table is missing from the catalog",
            )),
        }
    }

    fn partition(
        &mut self,
        period: Period,
        content: PartitionContent,
    ) -> Option<(Tier, Arc<DatasetSource>)> {
        match self.catalog.partition(period, content) {
            Some(s) => Some((Tier::Partition { period, content }, s)),
            None => {
                let what = match content {
                    PartitionContent::Facts => "facts".to_string(),
                    PartitionContent::Rollup(d) => format!("{} rollup", d),
                };
                self.note(format!("no {} partition for {}", what, period));
                None
            },
        }
    }

    /// Partitions to try, narrowest first, when every range falls in one period
    fn partition_candidates(&self, grain: RequestedGrain) -> Vec<(Period, PartitionContent)> {
        let ranges = &self.spec.time_ranges;
        let Some(first) = ranges.first() else {
            return Vec::new();
        };
        let (year, last_year) = first.years();
        if year != last_year || ranges.iter().any(|r| r.years() != (year, year)) {
            return Vec::new();
        }

        let rollup = match grain {
            RequestedGrain::Dimension(d) if self.is_pure_for(d) => Some(d),
            _ => None,
        };
        let mut candidates = Vec::new();
        if let [TimeRange::Quarterly { quarter, .. }] = ranges.as_slice() {
            let period = Period::Quarter {
                year,
                quarter: *quarter,
            };
            if let Some(d) = rollup {
                candidates.push((period, PartitionContent::Rollup(d)));
            }
            candidates.push((period, PartitionContent::Facts));
        }
        let whole_year = matches!(ranges.as_slice(), [TimeRange::Yearly { .. }]);
        if let (Some(d), true) = (rollup, whole_year) {
            candidates.push((Period::Year { year }, PartitionContent::Rollup(d)));
        }
        candidates.push((Period::Year { year }, PartitionContent::Facts));
        candidates
    }
}

/// Pick the narrowest sufficient sources for a request
pub fn select_source(
    catalog: &Catalog,
    spec: &FilterSpec,
    grain: RequestedGrain,
) -> Result<RoutePlan> {
    let mut planner = Planner {
        catalog,
        spec,
        notes: Vec::new(),
    };

    let plan = if spec.has_keywords() || grain == RequestedGrain::RowLevel {
        planner.title_search()?
    } else {
        route_aggregate(planner, grain)?
    };

    debug!(
        tier = %plan.tier,
        sources = ?plan.source_ids(),
        fallback = plan.fallback.as_deref().unwrap_or("-"),
        "Route selected"
    );
    crate::metrics::record_route(plan.tier.label(), plan.fallback.is_some());
    Ok(plan)
}

fn route_aggregate(mut planner: Planner<'_>, grain: RequestedGrain) -> Result<RoutePlan> {
    if let RequestedGrain::Dimension(d) = grain {
        if planner.spec.time_ranges.is_empty() && planner.is_pure_for(d) {
            if let Some(s) = planner.catalog.rollup(d) {
                return Ok(planner.finish(Tier::DimensionRollup { dimension: d }, vec![s]));
            }
            planner.note(format!("no {} rollup", d));
        }
    }

    for (period, content) in planner.partition_candidates(grain) {
        if let Some((tier, source)) = planner.partition(period, content) {
            return Ok(planner.finish(tier, vec![source]));
        }
    }

    planner.full_fact()
}
