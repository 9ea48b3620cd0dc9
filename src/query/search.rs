//! Row-level search
//!
//! Collects matching rows of every planned source, sorts the hit list by a
//! single column and materializes [`ContractRow`]s for the requested page
//! only. Nulls sort last in both directions; ties break by source order and
//! then row order, so pages are stable across calls.

use crate::error::Result;
use crate::query::aggregate::validate_page;
use crate::query::budget::ScanBudget;
use crate::query::predicate::Predicate;
use crate::query::scan::{matching_rows, LoadedSource};
use crate::storage::schema::fact;
use crate::storage::{ContractReader, TextColumn};
use crate::types::{ContractRow, Pagination, SortDirection};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Column a search result is ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SearchSort {
    /// Award date
    #[default]
    #[serde(alias = "award_date")]
    AwardDate,
    /// Contract amount
    #[serde(alias = "contract_amount")]
    ContractAmount,
    /// Awardee name
    #[serde(alias = "awardee_name")]
    AwardeeName,
    /// Organization name
    #[serde(alias = "organization_name")]
    OrganizationName,
    /// Award title
    #[serde(alias = "award_title")]
    AwardTitle,
    /// Contract number
    #[serde(alias = "contract_no")]
    ContractNo,
}

impl SearchSort {
    fn text_column(self) -> Option<&'static str> {
        match self {
            SearchSort::AwardeeName => Some(fact::AWARDEE_NAME),
            SearchSort::OrganizationName => Some(fact::ORGANIZATION_NAME),
            SearchSort::AwardTitle => Some(fact::AWARD_TITLE),
            SearchSort::ContractNo => Some(fact::CONTRACT_NO),
            SearchSort::AwardDate | SearchSort::ContractAmount => None,
        }
    }
}

/// Page window and ordering of a search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchPage {
    /// 1-based page
    pub page: u32,
    /// Rows per page
    #[serde(alias = "page_size")]
    pub page_size: u32,
    /// Sort column
    #[serde(alias = "sort_by")]
    pub sort_by: SearchSort,
    /// Sort direction
    #[serde(alias = "sort_dir", alias = "sortDirection")]
    pub sort_dir: SortDirection,
}

impl Default for SearchPage {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
            sort_by: SearchSort::default(),
            sort_dir: SortDirection::Desc,
        }
    }
}

/// Response of the search operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    /// Rows of the page
    pub rows: Vec<ContractRow>,
    /// Page window over all matches
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Copy)]
enum SortValue<'a> {
    Text(Option<&'a str>),
    Number(Option<i64>),
}

impl SortValue<'_> {
    fn compare(&self, other: &Self, direction: SortDirection) -> Ordering {
        let ordered = |o: Ordering| match direction {
            SortDirection::Asc => o,
            SortDirection::Desc => o.reverse(),
        };
        match (self, other) {
            (SortValue::Text(a), SortValue::Text(b)) => nulls_last(*a, *b, ordered),
            (SortValue::Number(a), SortValue::Number(b)) => nulls_last(*a, *b, ordered),
            _ => Ordering::Equal,
        }
    }
}

fn nulls_last<T: Ord>(
    a: Option<T>,
    b: Option<T>,
    ordered: impl Fn(Ordering) -> Ordering,
) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => ordered(a.cmp(&b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Matching rows of every source, in source then row order
pub fn collect_hits(
    sources: &[LoadedSource],
    predicate: &Predicate,
    morsel_rows: usize,
    budget: &ScanBudget,
) -> Result<Vec<Vec<u32>>> {
    sources
        .iter()
        .map(|source| {
            let bound = source.bind(predicate)?;
            matching_rows(source.data.row_count(), &bound, morsel_rows, budget)
        })
        .collect()
}

/// Run a search over loaded row-level sources
pub fn search(
    sources: &[LoadedSource],
    predicate: &Predicate,
    page: &SearchPage,
    max_page_size: u32,
    morsel_rows: usize,
    budget: &ScanBudget,
) -> Result<SearchResponse> {
    validate_page(page.page, page.page_size, max_page_size)?;
    let hits = collect_hits(sources, predicate, morsel_rows, budget)?;

    let readers = sources
        .iter()
        .map(|s| ContractReader::new(&s.data).map_err(|e| s.unavailable(e)))
        .collect::<Result<Vec<_>>>()?;

    let total: usize = hits.iter().map(Vec::len).sum();
    let mut keyed: Vec<(SortValue<'_>, usize, u32)> = Vec::with_capacity(total);
    for (i, rows) in hits.iter().enumerate() {
        let reader = &readers[i];
        let text: Option<TextColumn<'_>> = page.sort_by.text_column().and_then(|c| reader.text(c));
        for &row in rows {
            let r = row as usize;
            let value = match page.sort_by {
                SearchSort::AwardDate => SortValue::Number(reader.dates().get(r).map(i64::from)),
                SearchSort::ContractAmount => SortValue::Number(reader.amounts().get(r)),
                _ => SortValue::Text(text.and_then(|c| c.get(r))),
            };
            keyed.push((value, i, row));
        }
    }

    let direction = page.sort_dir;
    keyed.par_sort_unstable_by(|a, b| {
        a.0.compare(&b.0, direction)
            .then(a.1.cmp(&b.1))
            .then(a.2.cmp(&b.2))
    });

    let pagination = Pagination::new(page.page, page.page_size, keyed.len() as u64);
    let rows = keyed
        .iter()
        .skip(pagination.offset())
        .take(page.page_size as usize)
        .map(|(_, source, row)| readers[*source].read(*row as usize))
        .collect();

    Ok(SearchResponse { rows, pagination })
}
