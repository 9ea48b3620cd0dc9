//! Filter compiler
//!
//! Turns a loosely typed [`FilterRequest`] into a validated [`FilterSpec`]
//! plus a list of [`FilterWarning`]s. Individual malformed fields are dropped
//! with a warning; only a body that is not a JSON object with the expected
//! field shapes is rejected outright.
//!
//! ```text
//! JSON body ──► FilterRequest ──► FilterCompiler::compile ──► (FilterSpec, warnings)
//!                                                                 │
//!                                                                 ▼
//!                                                          FilterSpec::predicate
//! ```

use crate::catalog::{Catalog, Period};
use crate::error::{Error, Result};
use crate::query::predicate::{Field, Predicate};
use crate::types::{date_to_days, Dimension, Money};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

/// Separator inside one entity or keyword entry meaning "all parts must match"
pub const AND_SEPARATOR: &str = "&&";

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================================================
// Request
// ============================================================================

/// Filter fields as received from a caller
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterRequest {
    /// Contractor names
    #[serde(default, deserialize_with = "null_as_default")]
    pub contractors: Vec<String>,
    /// Organization names
    #[serde(default, deserialize_with = "null_as_default")]
    pub organizations: Vec<String>,
    /// Areas of delivery
    #[serde(default, deserialize_with = "null_as_default")]
    pub areas: Vec<String>,
    /// Business categories
    #[serde(
        default,
        deserialize_with = "null_as_default",
        alias = "business_categories"
    )]
    pub business_categories: Vec<String>,
    /// Title keywords
    #[serde(default, deserialize_with = "null_as_default")]
    pub keywords: Vec<String>,
    /// Time ranges, ORed
    #[serde(default, deserialize_with = "null_as_default", alias = "time_ranges")]
    pub time_ranges: Vec<TimeRangeRequest>,
    /// Inclusive value range in major units
    #[serde(default, alias = "value_range")]
    pub value_range: Option<ValueRangeRequest>,
    /// Whether to union the specialized dataset into the scan
    #[serde(
        default,
        deserialize_with = "null_as_default",
        alias = "include_specialized_dataset",
        alias = "includeFloodControl",
        alias = "include_flood_control"
    )]
    pub include_specialized_dataset: bool,
}

/// One time range as received
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRangeRequest {
    /// `yearly`, `quarterly` or `custom`
    #[serde(rename = "type", alias = "rangeType", alias = "range_type", default)]
    pub kind: Option<String>,
    /// Year (number or numeric string)
    #[serde(default)]
    pub year: Option<Value>,
    /// Quarter 1-4 (number or numeric string)
    #[serde(default)]
    pub quarter: Option<Value>,
    /// `YYYY-MM-DD`
    #[serde(default, alias = "start_date")]
    pub start_date: Option<Value>,
    /// `YYYY-MM-DD`
    #[serde(default, alias = "end_date")]
    pub end_date: Option<Value>,
}

/// Value range as received
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValueRangeRequest {
    /// Lower bound (number or numeric string)
    #[serde(default)]
    pub min: Option<Value>,
    /// Upper bound (number or numeric string)
    #[serde(default)]
    pub max: Option<Value>,
}

impl FilterRequest {
    /// Parse a request body
    ///
    /// Fails only when the body is not an object or a field has the wrong
    /// JSON shape (e.g. `contractors` is a number).
    pub fn from_json(body: &Value) -> Result<Self> {
        if !body.is_object() {
            return Err(Error::Validation(
                "filter request must be a JSON object".to_string(),
            ));
        }
        serde_json::from_value(body.clone())
            .map_err(|e| Error::Validation(format!("malformed filter request: {}", e)))
    }
}

// ============================================================================
// Compiled spec
// ============================================================================

/// An entity or keyword entry: every part must match (case-insensitively)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchTerm {
    parts: Vec<String>,
}

impl MatchTerm {
    /// Parse an entry, splitting on `&&`; `None` when nothing is left
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<String> = raw
            .split(AND_SEPARATOR)
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(Self { parts })
        }
    }

    /// Lowercased parts
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Whether `value` contains every part, ignoring case
    pub fn matches(&self, value: &str) -> bool {
        let lower = value.to_lowercase();
        self.parts.iter().all(|p| lower.contains(p.as_str()))
    }
}

/// A validated time range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TimeRange {
    /// Whole calendar year
    Yearly {
        /// Year
        year: i32,
    },
    /// Calendar quarter
    Quarterly {
        /// Year
        year: i32,
        /// 1-4
        quarter: u8,
    },
    /// Explicit inclusive dates
    #[serde(rename_all = "camelCase")]
    Custom {
        /// First day
        start_date: NaiveDate,
        /// Last day
        end_date: NaiveDate,
    },
}

impl TimeRange {
    /// First and last day, inclusive
    pub fn dates(&self) -> (NaiveDate, NaiveDate) {
        match *self {
            TimeRange::Yearly { year } => (
                NaiveDate::from_ymd_opt(year, 1, 1).unwrap_or(NaiveDate::MIN),
                NaiveDate::from_ymd_opt(year, 12, 31).unwrap_or(NaiveDate::MAX),
            ),
            TimeRange::Quarterly { year, quarter } => {
                let first_month = (quarter as u32 - 1) * 3 + 1;
                let start = NaiveDate::from_ymd_opt(year, first_month, 1).unwrap_or(NaiveDate::MIN);
                let end = if quarter == 4 {
                    NaiveDate::from_ymd_opt(year, 12, 31)
                } else {
                    NaiveDate::from_ymd_opt(year, first_month + 3, 1).and_then(|d| d.pred_opt())
                };
                (start, end.unwrap_or(NaiveDate::MAX))
            },
            TimeRange::Custom {
                start_date,
                end_date,
            } => (start_date, end_date),
        }
    }

    /// Inclusive `Date32` bounds
    pub fn day_bounds(&self) -> (i32, i32) {
        let (start, end) = self.dates();
        (date_to_days(start), date_to_days(end))
    }

    /// Precomputed partition matching this range exactly
    pub fn period(&self) -> Option<Period> {
        match *self {
            TimeRange::Yearly { year } => Some(Period::Year { year }),
            TimeRange::Quarterly { year, quarter } => Some(Period::Quarter { year, quarter }),
            TimeRange::Custom { .. } => None,
        }
    }

    /// Years the range touches
    pub fn years(&self) -> (i32, i32) {
        let (start, end) = self.dates();
        (start.year(), end.year())
    }
}

/// Inclusive value range in minor units; `None` bounds are open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRange {
    /// Lower bound
    pub min: Option<Money>,
    /// Upper bound
    pub max: Option<Money>,
}

impl ValueRange {
    /// Whether neither bound is set
    pub fn is_unconstrained(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }
}

/// A dropped filter field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterWarning {
    /// Field path, e.g. `timeRanges[1].quarter`
    pub field: String,
    /// Offending value
    pub value: String,
    /// Why it was dropped
    pub reason: String,
}

/// Validated, normalized filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterSpec {
    /// Contractor terms (ORed)
    pub contractors: Vec<MatchTerm>,
    /// Organization terms (ORed)
    pub organizations: Vec<MatchTerm>,
    /// Area terms (ORed)
    pub areas: Vec<MatchTerm>,
    /// Business category terms (ORed)
    pub business_categories: Vec<MatchTerm>,
    /// Title keywords (ORed)
    pub keywords: Vec<MatchTerm>,
    /// Time ranges (ORed)
    pub time_ranges: Vec<TimeRange>,
    /// Value range
    pub value_range: ValueRange,
    /// Union the specialized dataset into the scan
    pub include_specialized: bool,
}

impl FilterSpec {
    /// Terms for one dimension
    pub fn entities(&self, dimension: Dimension) -> &[MatchTerm] {
        match dimension {
            Dimension::Contractor => &self.contractors,
            Dimension::Organization => &self.organizations,
            Dimension::Area => &self.areas,
            Dimension::BusinessCategory => &self.business_categories,
        }
    }

    fn entities_mut(&mut self, dimension: Dimension) -> &mut Vec<MatchTerm> {
        match dimension {
            Dimension::Contractor => &mut self.contractors,
            Dimension::Organization => &mut self.organizations,
            Dimension::Area => &mut self.areas,
            Dimension::BusinessCategory => &mut self.business_categories,
        }
    }

    /// Dimensions that carry at least one term
    pub fn constrained_dimensions(&self) -> Vec<Dimension> {
        Dimension::ALL
            .into_iter()
            .filter(|d| !self.entities(*d).is_empty())
            .collect()
    }

    /// Whether free-text matching is needed
    pub fn has_keywords(&self) -> bool {
        !self.keywords.is_empty()
    }

    /// Whether the filter matches every row
    pub fn is_empty(&self) -> bool {
        self.constrained_dimensions().is_empty()
            && self.keywords.is_empty()
            && self.time_ranges.is_empty()
            && self.value_range.is_unconstrained()
    }

    /// Lower into a predicate tree
    pub fn predicate(&self) -> Predicate {
        let mut clauses = Vec::new();

        for dimension in Dimension::ALL {
            let terms = self.entities(dimension);
            if !terms.is_empty() {
                clauses.push(terms_predicate(Field::Entity(dimension), terms));
            }
        }
        if !self.keywords.is_empty() {
            clauses.push(terms_predicate(Field::SearchText, &self.keywords));
        }
        if !self.time_ranges.is_empty() {
            clauses.push(Predicate::or(
                self.time_ranges
                    .iter()
                    .map(|r| {
                        let (start, end) = r.day_bounds();
                        Predicate::DateBetween { start, end }
                    })
                    .collect(),
            ));
        }
        if !self.value_range.is_unconstrained() {
            clauses.push(Predicate::AmountBetween {
                min: self.value_range.min.map(Money::minor),
                max: self.value_range.max.map(Money::minor),
            });
        }

        Predicate::and(clauses)
    }
}

fn terms_predicate(field: Field, terms: &[MatchTerm]) -> Predicate {
    Predicate::or(
        terms
            .iter()
            .map(|term| {
                Predicate::and(
                    term.parts()
                        .iter()
                        .map(|part| Predicate::Contains {
                            field,
                            needle: part.clone(),
                        })
                        .collect(),
                )
            })
            .collect(),
    )
}

// ============================================================================
// Compiler
// ============================================================================

/// Validates requests against the covered year window
#[derive(Debug, Clone, Copy)]
pub struct FilterCompiler {
    first_year: i32,
    last_year: i32,
}

impl FilterCompiler {
    /// Compiler accepting years in `[first_year, last_year]`
    pub fn new(first_year: i32, last_year: i32) -> Self {
        Self {
            first_year,
            last_year,
        }
    }

    /// Compiler using the catalog's covered years, else the fallback window
    pub fn for_catalog(catalog: &Catalog, fallback: (i32, i32)) -> Self {
        let (first, last) = catalog.covered_years().unwrap_or(fallback);
        Self::new(first, last)
    }

    /// Accepted year window
    pub fn year_window(&self) -> (i32, i32) {
        (self.first_year, self.last_year)
    }

    /// Compile a request; never fails, malformed fields become warnings
    pub fn compile(&self, request: &FilterRequest) -> (FilterSpec, Vec<FilterWarning>) {
        let mut spec = FilterSpec {
            include_specialized: request.include_specialized_dataset,
            ..Default::default()
        };
        let mut warnings = Vec::new();

        let entity_fields = [
            (Dimension::Contractor, "contractors", &request.contractors),
            (Dimension::Organization, "organizations", &request.organizations),
            (Dimension::Area, "areas", &request.areas),
            (
                Dimension::BusinessCategory,
                "businessCategories",
                &request.business_categories,
            ),
        ];
        for (dimension, name, values) in entity_fields {
            *spec.entities_mut(dimension) = compile_terms(name, values, &mut warnings);
        }
        spec.keywords = compile_terms("keywords", &request.keywords, &mut warnings);

        for (i, range) in request.time_ranges.iter().enumerate() {
            match self.compile_time_range(range) {
                Ok(r) => {
                    if !spec.time_ranges.contains(&r) {
                        spec.time_ranges.push(r);
                    }
                },
                Err((field, value, reason)) => warnings.push(FilterWarning {
                    field: format!("timeRanges[{}]{}", i, field),
                    value,
                    reason,
                }),
            }
        }

        if let Some(range) = &request.value_range {
            spec.value_range = compile_value_range(range, &mut warnings);
        }

        for w in &warnings {
            warn!(field = %w.field, value = %w.value, reason = %w.reason, "Dropping filter field");
            crate::metrics::record_filter_warning(field_root(&w.field));
        }

        (spec, warnings)
    }

    fn compile_time_range(
        &self,
        range: &TimeRangeRequest,
    ) -> std::result::Result<TimeRange, (String, String, String)> {
        let kind = range
            .kind
            .as_deref()
            .map(|k| k.trim().to_lowercase())
            .unwrap_or_default();
        match kind.as_str() {
            "yearly" | "year" => {
                let year = self.parse_year(range.year.as_ref())?;
                Ok(TimeRange::Yearly { year })
            },
            "quarterly" | "quarter" => {
                let year = self.parse_year(range.year.as_ref())?;
                let quarter = match range.quarter.as_ref().and_then(as_integer) {
                    Some(q) if (1..=4).contains(&q) => q as u8,
                    _ => {
                        return Err((
                            ".quarter".to_string(),
                            render(range.quarter.as_ref()),
                            "quarter must be 1, 2, 3 or 4".to_string(),
                        ))
                    },
                };
                Ok(TimeRange::Quarterly { year, quarter })
            },
            "custom" | "range" => {
                let start_date = parse_date(range.start_date.as_ref())
                    .ok_or_else(|| bad_date(".startDate", range.start_date.as_ref()))?;
                let end_date = parse_date(range.end_date.as_ref())
                    .ok_or_else(|| bad_date(".endDate", range.end_date.as_ref()))?;
                if start_date > end_date {
                    return Err((
                        String::new(),
                        format!("{}..{}", start_date, end_date),
                        "startDate is after endDate".to_string(),
                    ));
                }
                Ok(TimeRange::Custom {
                    start_date,
                    end_date,
                })
            },
            _ => Err((
                ".type".to_string(),
                kind,
                "type must be yearly, quarterly or custom".to_string(),
            )),
        }
    }

    fn parse_year(
        &self,
        value: Option<&Value>,
    ) -> std::result::Result<i32, (String, String, String)> {
        let window = self.first_year as i64..=self.last_year as i64;
        match value.and_then(as_integer) {
            Some(y) if window.contains(&y) => Ok(y as i32),
            _ => Err((
                ".year".to_string(),
                render(value),
                format!(
                    "year must be between {} and {}",
                    self.first_year, self.last_year
                ),
            )),
        }
    }
}

fn compile_terms(
    field: &str,
    values: &[String],
    warnings: &mut Vec<FilterWarning>,
) -> Vec<MatchTerm> {
    let mut terms = Vec::with_capacity(values.len());
    for (i, raw) in values.iter().enumerate() {
        match MatchTerm::parse(raw) {
            Some(term) if !terms.contains(&term) => terms.push(term),
            Some(_) => {},
            None => warnings.push(FilterWarning {
                field: format!("{}[{}]", field, i),
                value: raw.clone(),
                reason: "empty entry".to_string(),
            }),
        }
    }
    terms
}

fn compile_value_range(range: &ValueRangeRequest, warnings: &mut Vec<FilterWarning>) -> ValueRange {
    let mut bound = |name: &str, value: Option<&Value>| -> Option<Money> {
        let value = value.filter(|v| !v.is_null())?;
        match as_number(value) {
            Some(n) if n >= 0.0 && n.is_finite() => Some(Money::from_major(n)),
            _ => {
                warnings.push(FilterWarning {
                    field: format!("valueRange.{}", name),
                    value: value.to_string(),
                    reason: "must be a non-negative number".to_string(),
                });
                None
            },
        }
    };
    let min = bound("min", range.min.as_ref());
    let max = bound("max", range.max.as_ref());

    if let (Some(lo), Some(hi)) = (min, max) {
        if lo > hi {
            warnings.push(FilterWarning {
                field: "valueRange".to_string(),
                value: format!("{}..{}", lo, hi),
                reason: "min is greater than max".to_string(),
            });
            return ValueRange::default();
        }
    }
    ValueRange { min, max }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

fn parse_date(value: Option<&Value>) -> Option<NaiveDate> {
    let s = value?.as_str()?.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

fn bad_date(field: &str, value: Option<&Value>) -> (String, String, String) {
    (
        field.to_string(),
        render(value),
        "expected a YYYY-MM-DD date".to_string(),
    )
}

fn render(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
        None => "<missing>".to_string(),
    }
}

fn field_root(field: &str) -> &str {
    field
        .split(|c| c == '[' || c == '.')
        .next()
        .unwrap_or(field)
}
