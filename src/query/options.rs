//! Filter options and entity lookup
//!
//! Distinct entity values come from the dimension rollups when the catalog
//! has them, otherwise from the full fact table's column (dictionary entries
//! when the column is dictionary encoded).

use crate::catalog::{CatalogHandle, FactVariant};
use crate::error::{Error, Result};
use crate::storage::schema::rollup;
use crate::storage::{ColumnData, SegmentData};
use crate::types::Dimension;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Values a caller can offer in filter pickers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterOptions {
    /// Distinct contractors
    pub contractors: Vec<String>,
    /// Distinct organizations
    pub organizations: Vec<String>,
    /// Distinct areas
    pub areas: Vec<String>,
    /// Distinct business categories
    pub business_categories: Vec<String>,
    /// Years covered by the dataset, ascending
    pub years: Vec<i32>,
}

impl FilterOptions {
    fn values_mut(&mut self, dimension: Dimension) -> &mut Vec<String> {
        match dimension {
            Dimension::Contractor => &mut self.contractors,
            Dimension::Organization => &mut self.organizations,
            Dimension::Area => &mut self.areas,
            Dimension::BusinessCategory => &mut self.business_categories,
        }
    }
}

/// Entity lookup request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityLookup {
    /// Dimension to search
    pub dimension: Dimension,
    /// Text to look for
    #[serde(default)]
    pub query: String,
    /// Maximum number of labels
    #[serde(default = "default_lookup_limit")]
    pub limit: usize,
    /// Match whole words only
    #[serde(default)]
    pub word: bool,
}

fn default_lookup_limit() -> usize {
    20
}

/// Entity lookup response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityLookupResponse {
    /// Dimension searched
    pub dimension: Dimension,
    /// Matching labels, sorted
    pub labels: Vec<String>,
    /// Whether more labels matched than were returned
    pub truncated: bool,
}

fn column_values(data: &SegmentData, column: &str, out: &mut BTreeSet<String>) {
    match data.column(column) {
        Some(ColumnData::Dictionary(c)) => {
            out.extend(c.dictionary().iter().filter(|v| !v.trim().is_empty()).cloned())
        },
        Some(other) => {
            if let Some(text) = other.as_text() {
                out.extend(
                    (0..data.row_count())
                        .filter_map(|row| text.get(row))
                        .filter(|v| !v.trim().is_empty())
                        .map(str::to_string),
                );
            }
        },
        None => {},
    }
}

/// Distinct, sorted labels of a dimension
pub fn distinct_labels(catalog: &CatalogHandle, dimension: Dimension) -> Result<Vec<String>> {
    let snapshot = catalog.snapshot();
    let mut values = BTreeSet::new();
    if let Some(source) = snapshot.rollup(dimension) {
        let data = catalog.load(&source)?;
        column_values(&data, rollup::ENTITY, &mut values);
    } else if let Some(source) = snapshot.fact_table(FactVariant::Full) {
        let data = catalog.load(&source)?;
        column_values(&data, dimension.fact_column(), &mut values);
    } else {
        return Err(Error::source_unavailable(
            crate::query::router::BASE_FACT_ID,
            "no rollup or fact table to read entity values from",
        ));
    }
    Ok(values.into_iter().collect())
}

/// Every filter option, with years from the catalog or the fallback window
pub fn filter_options(
    catalog: &CatalogHandle,
    fallback_years: (i32, i32),
) -> Result<FilterOptions> {
    let mut options = FilterOptions::default();
    for dimension in Dimension::ALL {
        *options.values_mut(dimension) = distinct_labels(catalog, dimension)?;
    }
    let (first, last) = catalog.snapshot().covered_years().unwrap_or(fallback_years);
    options.years = (first..=last).collect();
    Ok(options)
}

/// Labels of a dimension matching a lookup
pub fn lookup_entities(
    catalog: &CatalogHandle,
    request: &EntityLookup,
    max_limit: usize,
) -> Result<EntityLookupResponse> {
    if request.limit == 0 || request.limit > max_limit {
        return Err(Error::Validation(format!(
            "limit must be between 1 and {}",
            max_limit
        )));
    }
    let query = request.query.trim();
    let pattern = if request.word {
        format!(r"\b{}\b", regex::escape(query))
    } else {
        regex::escape(query)
    };
    let matcher = RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| Error::Validation(format!("invalid lookup query: {}", e)))?;

    let mut labels: Vec<String> = distinct_labels(catalog, request.dimension)?
        .into_iter()
        .filter(|label| matcher.is_match(label))
        .collect();
    let truncated = labels.len() > request.limit;
    labels.truncate(request.limit);
    Ok(EntityLookupResponse {
        dimension: request.dimension,
        labels,
        truncated,
    })
}
