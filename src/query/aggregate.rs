//! Aggregation engine
//!
//! One pass over the planned sources produces, for every requested
//! dimension, a complete map of label → accumulator, plus the global summary
//! and optional per-year / per-month series. Fact segments are folded in
//! parallel morsels keyed by borrowed labels; partial maps are converted to
//! owned labels once per segment and merged.
//!
//! Sums are accumulated as `i128` minor units so totals are exact over any
//! number of rows. Null or blank labels are bucketed under
//! [`UNKNOWN_LABEL`], which keeps `Σ count == filtered rows` for every
//! dimension.

use crate::error::{Error, Result};
use crate::query::budget::ScanBudget;
use crate::query::predicate::{ColumnLayout, Predicate};
use crate::query::scan::{scan_fold, LoadedSource};
use crate::storage::schema::{fact, rollup};
use crate::storage::segment::{DateColumn, Int64Column};
use crate::storage::TextColumn;
use crate::types::{days_to_date, Dimension, Money, Pagination, SortDirection, UNKNOWN_LABEL};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;

// ============================================================================
// Public types
// ============================================================================

/// Key aggregated groups are sorted by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    /// Summed contract value
    #[default]
    #[serde(alias = "total_value", alias = "total_contract_value", alias = "value")]
    TotalValue,
    /// Number of contracts
    #[serde(alias = "contract_count")]
    Count,
    /// Average contract value
    #[serde(alias = "avg_value", alias = "average_value")]
    AvgValue,
    /// Group label
    #[serde(alias = "name", alias = "entity")]
    Label,
}

/// One aggregated group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationRow {
    /// Entity label, `Unknown` for null values
    pub label: String,
    /// Contracts in the group
    pub count: u64,
    /// Summed value
    pub total_value: Money,
    /// `total_value / count`
    pub avg_value: Money,
    /// Earliest award date
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub first_date: Option<NaiveDate>,
    /// Latest award date
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_date: Option<NaiveDate>,
    /// Distinct business categories, when known
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub category_count: Option<u64>,
}

/// Global totals of the filtered rows
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    /// Filtered rows
    pub count: u64,
    /// Summed value
    pub total_value: Money,
    /// `total_value / count`
    pub avg_value: Money,
    /// Earliest award date
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub first_date: Option<NaiveDate>,
    /// Latest award date
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_date: Option<NaiveDate>,
}

/// One point of a time series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBucket {
    /// `YYYY` or `YYYY-MM`
    pub period: String,
    /// Contracts in the period
    pub count: u64,
    /// Summed value
    pub total_value: Money,
}

/// Response of the aggregate operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResponse {
    /// Top contractors
    pub by_contractor: Vec<AggregationRow>,
    /// Top organizations
    pub by_organization: Vec<AggregationRow>,
    /// Top areas
    pub by_area: Vec<AggregationRow>,
    /// Top business categories
    pub by_category: Vec<AggregationRow>,
    /// Global totals
    pub summary: Summary,
    /// Yearly series
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub by_year: Vec<TimeBucket>,
    /// Monthly series
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub by_month: Vec<TimeBucket>,
}

impl AggregateResponse {
    /// Rows of one dimension
    pub fn rows(&self, dimension: Dimension) -> &[AggregationRow] {
        match dimension {
            Dimension::Contractor => &self.by_contractor,
            Dimension::Organization => &self.by_organization,
            Dimension::Area => &self.by_area,
            Dimension::BusinessCategory => &self.by_category,
        }
    }

    /// Mutable rows of one dimension
    pub fn rows_mut(&mut self, dimension: Dimension) -> &mut Vec<AggregationRow> {
        match dimension {
            Dimension::Contractor => &mut self.by_contractor,
            Dimension::Organization => &mut self.by_organization,
            Dimension::Area => &mut self.by_area,
            Dimension::BusinessCategory => &mut self.by_category,
        }
    }
}

/// Response of the paginated aggregate operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedAggregate {
    /// Grouping dimension
    pub dimension: Dimension,
    /// Groups of the requested page
    pub rows: Vec<AggregationRow>,
    /// Page window over all groups
    pub pagination: Pagination,
}

// ============================================================================
// Accumulators
// ============================================================================

#[derive(Debug, Clone)]
struct GroupAcc<K> {
    count: u64,
    total: i128,
    first: Option<i32>,
    last: Option<i32>,
    categories: HashSet<K>,
    categories_tracked: bool,
    rollup_categories: Option<u64>,
}

impl<K> Default for GroupAcc<K> {
    fn default() -> Self {
        Self {
            count: 0,
            total: 0,
            first: None,
            last: None,
            categories: HashSet::new(),
            categories_tracked: false,
            rollup_categories: None,
        }
    }
}

impl<K: Eq + Hash> GroupAcc<K> {
    fn add_dates(&mut self, first: Option<i32>, last: Option<i32>) {
        self.first = min_opt(self.first, first);
        self.last = max_opt(self.last, last);
    }

    fn merge(&mut self, other: GroupAcc<K>) {
        self.count += other.count;
        self.total += other.total;
        self.add_dates(other.first, other.last);
        self.categories.extend(other.categories);
        self.categories_tracked |= other.categories_tracked;
        self.rollup_categories = match (self.rollup_categories, other.rollup_categories) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

impl<'a> GroupAcc<&'a str> {
    fn into_owned(self) -> GroupAcc<String> {
        GroupAcc {
            count: self.count,
            total: self.total,
            first: self.first,
            last: self.last,
            categories: self.categories.into_iter().map(str::to_string).collect(),
            categories_tracked: self.categories_tracked,
            rollup_categories: self.rollup_categories,
        }
    }
}

fn min_opt(a: Option<i32>, b: Option<i32>) -> Option<i32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

fn max_opt(a: Option<i32>, b: Option<i32>) -> Option<i32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    count: u64,
    total: i128,
}

impl Bucket {
    fn merge(&mut self, other: Bucket) {
        self.count += other.count;
        self.total += other.total;
    }
}

/// Complete, unsorted aggregation state
#[derive(Debug, Default)]
pub struct Aggregation {
    groups: BTreeMap<Dimension, HashMap<String, GroupAcc<String>>>,
    summary: GroupAcc<String>,
    years: BTreeMap<i32, Bucket>,
    months: BTreeMap<(i32, u32), Bucket>,
}

/// Label of an entity value
#[inline]
fn label(value: Option<&str>) -> &str {
    match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => UNKNOWN_LABEL,
    }
}

/// Fold state of one fact segment, keyed by labels borrowed from it
struct FactPartial<'a> {
    groups: Vec<HashMap<&'a str, GroupAcc<&'a str>>>,
    summary: GroupAcc<&'a str>,
    years: BTreeMap<i32, Bucket>,
    months: BTreeMap<(i32, u32), Bucket>,
}

impl<'a> FactPartial<'a> {
    fn new(dimensions: usize) -> Self {
        Self {
            groups: (0..dimensions).map(|_| HashMap::new()).collect(),
            summary: GroupAcc::default(),
            years: BTreeMap::new(),
            months: BTreeMap::new(),
        }
    }

    fn merge(mut self, other: FactPartial<'a>) -> Self {
        for (mine, theirs) in self.groups.iter_mut().zip(other.groups) {
            for (key, acc) in theirs {
                mine.entry(key).or_default().merge(acc);
            }
        }
        self.summary.merge(other.summary);
        for (k, b) in other.years {
            self.years.entry(k).or_default().merge(b);
        }
        for (k, b) in other.months {
            self.months.entry(k).or_default().merge(b);
        }
        self
    }
}

struct FactColumns<'a> {
    dimensions: Vec<(Dimension, TextColumn<'a>)>,
    category: Option<TextColumn<'a>>,
    amount: &'a Int64Column,
    date: Option<&'a DateColumn>,
}

impl Aggregation {
    /// Aggregate every source of a plan
    ///
    /// `dimensions` are grouped on fact sources; rollup sources contribute
    /// only to their own dimension and the summary.
    pub fn compute(
        sources: &[LoadedSource],
        predicate: &Predicate,
        dimensions: &[Dimension],
        time_series: bool,
        morsel_rows: usize,
        budget: &ScanBudget,
    ) -> Result<Self> {
        let mut aggregation = Aggregation::default();
        for d in dimensions {
            aggregation.groups.entry(*d).or_default();
        }
        for source in sources {
            match source.layout() {
                ColumnLayout::Fact => aggregation.fold_facts(
                    source,
                    predicate,
                    dimensions,
                    time_series,
                    morsel_rows,
                    budget,
                )?,
                ColumnLayout::Rollup(d) => aggregation.fold_rollup(source, predicate, d, budget)?,
            }
        }
        Ok(aggregation)
    }

    fn fold_facts(
        &mut self,
        source: &LoadedSource,
        predicate: &Predicate,
        dimensions: &[Dimension],
        time_series: bool,
        morsel_rows: usize,
        budget: &ScanBudget,
    ) -> Result<()> {
        let data = &source.data;
        let bound = source.bind(predicate)?;
        let columns = FactColumns {
            dimensions: dimensions
                .iter()
                .map(|d| data.text(d.fact_column()).map(|c| (*d, c)))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| source.unavailable(e))?,
            category: data
                .text_opt(fact::BUSINESS_CATEGORY)
                .map_err(|e| source.unavailable(e))?,
            amount: data
                .int64(fact::CONTRACT_AMOUNT)
                .map_err(|e| source.unavailable(e))?,
            date: data.date32(fact::AWARD_DATE).ok(),
        };

        let partial = scan_fold(
            data.row_count(),
            &bound,
            morsel_rows,
            budget,
            || FactPartial::new(columns.dimensions.len()),
            |state, row| {
                let amount = columns.amount.get(row).unwrap_or(0) as i128;
                let day = columns.date.and_then(|c| c.get(row));
                let category = columns.category.and_then(|c| c.get(row)).map(|c| label(Some(c)));

                for (i, (dimension, column)) in columns.dimensions.iter().enumerate() {
                    let acc = state.groups[i].entry(label(column.get(row))).or_default();
                    acc.count += 1;
                    acc.total += amount;
                    acc.add_dates(day, day);
                    if *dimension != Dimension::BusinessCategory {
                        acc.categories_tracked = true;
                        if let Some(c) = category {
                            acc.categories.insert(c);
                        }
                    }
                }

                state.summary.count += 1;
                state.summary.total += amount;
                state.summary.add_dates(day, day);

                if time_series {
                    if let Some(date) = day.and_then(days_to_date) {
                        let y = state.years.entry(date.year()).or_default();
                        y.count += 1;
                        y.total += amount;
                        let m = state.months.entry((date.year(), date.month())).or_default();
                        m.count += 1;
                        m.total += amount;
                    }
                }
            },
            FactPartial::merge,
        )?;

        for ((dimension, _), groups) in columns.dimensions.iter().zip(partial.groups) {
            let target = self.groups.entry(*dimension).or_default();
            for (key, acc) in groups {
                match target.get_mut(key) {
                    Some(existing) => existing.merge(acc.into_owned()),
                    None => {
                        target.insert(key.to_string(), acc.into_owned());
                    },
                }
            }
        }
        self.summary.merge(partial.summary.into_owned());
        for (k, b) in partial.years {
            self.years.entry(k).or_default().merge(b);
        }
        for (k, b) in partial.months {
            self.months.entry(k).or_default().merge(b);
        }
        Ok(())
    }

    fn fold_rollup(
        &mut self,
        source: &LoadedSource,
        predicate: &Predicate,
        dimension: Dimension,
        budget: &ScanBudget,
    ) -> Result<()> {
        let data = &source.data;
        let bound = source.bind(predicate)?;
        let entity = data.text(rollup::ENTITY).map_err(|e| source.unavailable(e))?;
        let counts = data
            .int64(rollup::CONTRACT_COUNT)
            .map_err(|e| source.unavailable(e))?;
        let totals = data
            .int64(rollup::TOTAL_CONTRACT_VALUE)
            .map_err(|e| source.unavailable(e))?;
        let first = data.date32(rollup::FIRST_CONTRACT_DATE).ok();
        let last = data.date32(rollup::LAST_CONTRACT_DATE).ok();
        let categories = data.int64(rollup::CATEGORY_COUNT).ok();

        budget.charge(data.row_count() as u64)?;
        let target = self.groups.entry(dimension).or_default();
        for row in (0..data.row_count()).filter(|&r| bound.matches(r)) {
            let count = counts.get(row).unwrap_or(0);
            if count < 0 {
                return Err(source.unavailable(format!("negative contract_count at row {}", row)));
            }
            let mut acc = GroupAcc {
                count: count as u64,
                total: totals.get(row).unwrap_or(0) as i128,
                rollup_categories: categories.and_then(|c| c.get(row)).map(|c| c.max(0) as u64),
                ..GroupAcc::default()
            };
            acc.add_dates(
                first.and_then(|c| c.get(row)),
                last.and_then(|c| c.get(row)),
            );

            self.summary.count += acc.count;
            self.summary.total += acc.total;
            self.summary.add_dates(acc.first, acc.last);

            let key = label(entity.get(row));
            match target.get_mut(key) {
                Some(existing) => existing.merge(acc),
                None => {
                    target.insert(key.to_string(), acc);
                },
            }
        }
        Ok(())
    }

    /// Global totals
    pub fn summary(&self) -> Summary {
        Summary {
            count: self.summary.count,
            total_value: Money::from_accumulator(self.summary.total),
            avg_value: Money::average(self.summary.total, self.summary.count),
            first_date: self.summary.first.and_then(days_to_date),
            last_date: self.summary.last.and_then(days_to_date),
        }
    }

    /// Number of groups of a dimension
    pub fn group_count(&self, dimension: Dimension) -> usize {
        self.groups.get(&dimension).map_or(0, HashMap::len)
    }

    /// Every group of a dimension, sorted
    pub fn sorted_rows(
        &self,
        dimension: Dimension,
        key: SortKey,
        direction: SortDirection,
    ) -> Vec<AggregationRow> {
        let mut rows: Vec<AggregationRow> = self
            .groups
            .get(&dimension)
            .map(|groups| {
                groups
                    .iter()
                    .map(|(label, acc)| finalize(dimension, label, acc))
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| compare_rows(a, b, key, direction));
        rows
    }

    /// Yearly series, ascending
    pub fn by_year(&self) -> Vec<TimeBucket> {
        self.years
            .iter()
            .map(|(year, b)| TimeBucket {
                period: year.to_string(),
                count: b.count,
                total_value: Money::from_accumulator(b.total),
            })
            .collect()
    }

    /// Monthly series, ascending
    pub fn by_month(&self) -> Vec<TimeBucket> {
        self.months
            .iter()
            .map(|((year, month), b)| TimeBucket {
                period: format!("{:04}-{:02}", year, month),
                count: b.count,
                total_value: Money::from_accumulator(b.total),
            })
            .collect()
    }

    /// Build the aggregate response, truncating each dimension to `top_n`
    pub fn into_response(self, top_n: usize) -> AggregateResponse {
        let mut response = AggregateResponse {
            summary: self.summary(),
            by_year: self.by_year(),
            by_month: self.by_month(),
            ..Default::default()
        };
        for dimension in self.groups.keys() {
            let mut rows = self.sorted_rows(*dimension, SortKey::TotalValue, SortDirection::Desc);
            rows.truncate(top_n);
            *response.rows_mut(*dimension) = rows;
        }
        response
    }

    /// One page of a dimension's groups
    pub fn paginate(
        &self,
        dimension: Dimension,
        page: u32,
        page_size: u32,
        key: SortKey,
        direction: SortDirection,
    ) -> PaginatedAggregate {
        let rows = self.sorted_rows(dimension, key, direction);
        let pagination = Pagination::new(page, page_size, rows.len() as u64);
        let rows = rows
            .into_iter()
            .skip(pagination.offset())
            .take(page_size as usize)
            .collect();
        PaginatedAggregate {
            dimension,
            rows,
            pagination,
        }
    }
}

fn finalize(dimension: Dimension, label: &str, acc: &GroupAcc<String>) -> AggregationRow {
    let category_count = if dimension == Dimension::BusinessCategory {
        None
    } else if acc.categories_tracked {
        Some(acc.categories.len() as u64)
    } else {
        acc.rollup_categories
    };
    AggregationRow {
        label: label.to_string(),
        count: acc.count,
        total_value: Money::from_accumulator(acc.total),
        avg_value: Money::average(acc.total, acc.count),
        first_date: acc.first.and_then(days_to_date),
        last_date: acc.last.and_then(days_to_date),
        category_count,
    }
}

/// Requested key first, then total value descending, then label ascending
pub fn compare_rows(
    a: &AggregationRow,
    b: &AggregationRow,
    key: SortKey,
    direction: SortDirection,
) -> Ordering {
    let primary = match key {
        SortKey::TotalValue => a.total_value.cmp(&b.total_value),
        SortKey::Count => a.count.cmp(&b.count),
        SortKey::AvgValue => a.avg_value.cmp(&b.avg_value),
        SortKey::Label => a.label.cmp(&b.label),
    };
    let primary = match direction {
        SortDirection::Asc => primary,
        SortDirection::Desc => primary.reverse(),
    };
    primary
        .then_with(|| b.total_value.cmp(&a.total_value))
        .then_with(|| a.label.cmp(&b.label))
}

/// Validate paging parameters
pub fn validate_page(page: u32, page_size: u32, max_page_size: u32) -> Result<()> {
    if page == 0 {
        return Err(Error::Validation("page must be >= 1".to_string()));
    }
    if page_size == 0 || page_size > max_page_size {
        return Err(Error::Validation(format!(
            "pageSize must be between 1 and {}",
            max_page_size
        )));
    }
    Ok(())
}
