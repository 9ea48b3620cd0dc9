//! Core data types shared by the query, export and task layers
//!
//! # Key Types
//!
//! - **`Money`**: a contract amount in integer minor units (centavos)
//! - **`Dimension`**: the four entity dimensions results can be grouped by
//! - **`SortDirection`** / **`Pagination`**: paging contract for list results
//! - **`ContractRow`**: one materialized row of the fact table
//!
//! # Example
//!
//! ```rust
//! use awardlens::types::{Dimension, Money};
//!
//! let total = Money::from_major(500.0) + Money::from_major(750_000.0);
//! assert_eq!(total, Money::from_major(750_500.0));
//! assert_eq!(Dimension::Contractor.fact_column(), "awardee_name");
//! ```

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Minor units per major currency unit
pub const MINOR_PER_MAJOR: i64 = 100;

/// Label used for rows whose entity value is null or blank
pub const UNKNOWN_LABEL: &str = "Unknown";

// ============================================================================
// Money
// ============================================================================

/// A monetary amount stored as integer minor units
///
/// Sums over millions of rows stay exact because no floating point is
/// involved until the value is rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    /// Zero
    pub const ZERO: Money = Money(0);

    /// Create from minor units
    pub const fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    /// Create from a major-unit amount, rounding to the nearest minor unit
    pub fn from_major(major: f64) -> Self {
        Money((major * MINOR_PER_MAJOR as f64).round() as i64)
    }

    /// Convert an i128 accumulator back to money, saturating at the i64 range
    pub fn from_accumulator(acc: i128) -> Self {
        Money(acc.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }

    /// Minor units
    pub const fn minor(self) -> i64 {
        self.0
    }

    /// Major units as a float (for display and JSON only)
    pub fn to_major(self) -> f64 {
        self.0 as f64 / MINOR_PER_MAJOR as f64
    }

    /// Average of an accumulated total over `count` rows, rounded half away from zero
    pub fn average(total: i128, count: u64) -> Money {
        if count == 0 {
            return Money::ZERO;
        }
        let count = count as i128;
        let half = count / 2;
        let rounded = if total >= 0 {
            (total + half) / count
        } else {
            (total - half) / count
        };
        Money::from_accumulator(rounded)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |a, b| a + b)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let major = abs / MINOR_PER_MAJOR as u64;
        let minor = abs % MINOR_PER_MAJOR as u64;
        write!(f, "{}{}.{:02}", sign, major, minor)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_major())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let major = f64::deserialize(deserializer)?;
        Ok(Money::from_major(major))
    }
}

// ============================================================================
// Dates
// ============================================================================

/// `NaiveDate::num_days_from_ce()` of 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Days since 1970-01-01, the on-disk encoding of `Date32` columns
pub fn date_to_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

/// Inverse of [`date_to_days`]
pub fn days_to_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?)
}

/// Calendar year of a `Date32` value
pub fn days_to_year(days: i32) -> Option<i32> {
    days_to_date(days).map(|d| d.year())
}

// ============================================================================
// Dimensions
// ============================================================================

/// Entity dimension a result can be grouped or filtered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Dimension {
    /// Awardee (contractor) name
    #[serde(alias = "by_contractor", alias = "contractors")]
    Contractor,
    /// Procuring organization
    #[serde(alias = "by_organization", alias = "organizations")]
    Organization,
    /// Area of delivery
    #[serde(alias = "by_area", alias = "areas")]
    Area,
    /// Business category
    #[serde(
        alias = "by_category",
        alias = "business_category",
        alias = "category",
        alias = "businessCategories"
    )]
    BusinessCategory,
}

impl Dimension {
    /// All dimensions, in response order
    pub const ALL: [Dimension; 4] = [
        Dimension::Contractor,
        Dimension::Organization,
        Dimension::Area,
        Dimension::BusinessCategory,
    ];

    /// Column holding this dimension in fact segments
    pub fn fact_column(self) -> &'static str {
        match self {
            Dimension::Contractor => "awardee_name",
            Dimension::Organization => "organization_name",
            Dimension::Area => "area_of_delivery",
            Dimension::BusinessCategory => "business_category",
        }
    }

    /// File-name suffix of this dimension's rollup (`agg_<suffix>.kcol`)
    pub fn rollup_suffix(self) -> &'static str {
        match self {
            Dimension::Contractor => "contractor",
            Dimension::Organization => "organization",
            Dimension::Area => "area",
            Dimension::BusinessCategory => "business_category",
        }
    }

    /// Parse a rollup file-name suffix
    pub fn from_rollup_suffix(s: &str) -> Option<Self> {
        Dimension::ALL.into_iter().find(|d| d.rollup_suffix() == s)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rollup_suffix())
    }
}

// ============================================================================
// Sorting and pagination
// ============================================================================

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending
    Asc,
    /// Descending
    #[default]
    Desc,
}

/// Pagination block attached to list responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    /// 1-based page number
    pub page: u32,
    /// Rows per page
    pub page_size: u32,
    /// Total rows across all pages
    pub total_count: u64,
    /// Number of pages
    pub total_pages: u64,
    /// Whether a later page exists
    pub has_next: bool,
    /// Whether an earlier page exists
    pub has_previous: bool,
}

impl Pagination {
    /// Build a pagination block
    pub fn new(page: u32, page_size: u32, total_count: u64) -> Self {
        let total_pages = if page_size == 0 {
            0
        } else {
            total_count.div_ceil(page_size as u64)
        };
        Self {
            page,
            page_size,
            total_count,
            total_pages,
            has_next: (page as u64) < total_pages,
            has_previous: page > 1,
        }
    }

    /// Offset of the first row of the page
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.page_size as usize
    }
}

// ============================================================================
// Contract rows
// ============================================================================

/// One contract award as read from a fact segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractRow {
    /// Reference id of the bid notice
    pub reference_id: Option<String>,
    /// Contract number
    pub contract_no: Option<String>,
    /// Award title
    pub award_title: Option<String>,
    /// Notice title
    pub notice_title: Option<String>,
    /// Awardee (contractor)
    pub awardee_name: Option<String>,
    /// Procuring organization
    pub organization_name: Option<String>,
    /// Area of delivery
    pub area_of_delivery: Option<String>,
    /// Business category
    pub business_category: Option<String>,
    /// Contract amount
    pub contract_amount: Option<Money>,
    /// Award date
    pub award_date: Option<NaiveDate>,
    /// Award status
    pub award_status: Option<String>,
}

impl ContractRow {
    /// Entity value for a dimension
    pub fn entity(&self, dimension: Dimension) -> Option<&str> {
        match dimension {
            Dimension::Contractor => self.awardee_name.as_deref(),
            Dimension::Organization => self.organization_name.as_deref(),
            Dimension::Area => self.area_of_delivery.as_deref(),
            Dimension::BusinessCategory => self.business_category.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_display_and_parse() {
        assert_eq!(Money::from_major(750_500.0).to_string(), "750500.00");
        assert_eq!(Money::from_minor(99_999).to_string(), "999.99");
        assert_eq!(Money::from_minor(-5).to_string(), "-0.05");
        assert_eq!(Money::from_major(0.1 + 0.2), Money::from_minor(30));
    }

    #[test]
    fn test_money_average_rounds_half_away() {
        assert_eq!(Money::average(10, 4), Money::from_minor(3));
        assert_eq!(Money::average(-10, 4), Money::from_minor(-3));
        assert_eq!(Money::average(100, 0), Money::ZERO);
    }

    #[test]
    fn test_date_round_trip() {
        let date = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        assert_eq!(date_to_days(date), 0);
        let later = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(days_to_date(date_to_days(later)), Some(later));
        assert_eq!(days_to_year(date_to_days(later)), Some(2024));
    }

    #[test]
    fn test_pagination() {
        let p = Pagination::new(2, 10, 25);
        assert_eq!(p.total_pages, 3);
        assert!(p.has_next);
        assert!(p.has_previous);
        assert_eq!(p.offset(), 10);

        let empty = Pagination::new(1, 10, 0);
        assert_eq!(empty.total_pages, 0);
        assert!(!empty.has_next);
        assert!(!empty.has_previous);
    }

    #[test]
    fn test_dimension_aliases() {
        let d: Dimension = serde_json::from_str("\"by_contractor\"").unwrap();
        assert_eq!(d, Dimension::Contractor);
        let d: Dimension = serde_json::from_str("\"businessCategory\"").unwrap();
        assert_eq!(d, Dimension::BusinessCategory);
        assert_eq!(Dimension::from_rollup_suffix("area"), Some(Dimension::Area));
    }
}
