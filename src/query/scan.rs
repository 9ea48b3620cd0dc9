//! Morsel-parallel segment scans
//!
//! A segment is split into fixed-size row ranges (morsels). Each morsel is
//! folded into its own partial state on the rayon pool, and partial states
//! are merged in morsel order so results never depend on thread timing.
//!
//! ```text
//! rows: [0 ........ 65535][65536 ...... 131071][131072 ... n)
//!            │                   │                  │
//!         fold()              fold()             fold()       (parallel)
//!            └─────── merge ─────┴────── merge ─────┘         (in order)
//! ```

use crate::catalog::{CatalogHandle, DatasetSource};
use crate::error::{Error, Result};
use crate::query::budget::ScanBudget;
use crate::query::predicate::{BoundPredicate, ColumnLayout, Predicate};
use crate::query::router::RoutePlan;
use crate::storage::SegmentData;
use rayon::prelude::*;
use std::sync::Arc;

/// A plan source together with its decoded data
#[derive(Debug, Clone)]
pub struct LoadedSource {
    /// Catalog entry
    pub source: Arc<DatasetSource>,
    /// Decoded columns
    pub data: Arc<SegmentData>,
}

impl LoadedSource {
    /// Column layout of the source
    pub fn layout(&self) -> ColumnLayout {
        RoutePlan::layout(&self.source)
    }

    /// Error naming this source
    pub fn unavailable(&self, reason: impl ToString) -> Error {
        Error::source_unavailable(&self.source.id, reason)
    }

    /// Bind a predicate to this source
    pub fn bind(&self, predicate: &Predicate) -> Result<BoundPredicate<'_>> {
        BoundPredicate::bind(predicate, &self.data, self.layout())
            .map_err(|e| e.for_source(&self.source.id))
    }
}

/// Decode every source of a plan
pub fn load_plan(catalog: &CatalogHandle, plan: &RoutePlan) -> Result<Vec<LoadedSource>> {
    plan.sources
        .iter()
        .map(|source| {
            Ok(LoadedSource {
                source: source.clone(),
                data: catalog.load(source)?,
            })
        })
        .collect()
}

/// Fold matching rows of one segment in parallel morsels
///
/// `fold` is called once per matching row; `merge` combines partial states
/// left to right.
pub fn scan_fold<S, I, F, M>(
    rows: usize,
    predicate: &BoundPredicate<'_>,
    morsel_rows: usize,
    budget: &ScanBudget,
    init: I,
    fold: F,
    merge: M,
) -> Result<S>
where
    S: Send,
    I: Fn() -> S + Sync,
    F: Fn(&mut S, usize) + Sync,
    M: Fn(S, S) -> S,
{
    budget.check()?;
    let morsel_rows = morsel_rows.max(1);
    let morsels: Vec<(usize, usize)> = (0..rows)
        .step_by(morsel_rows)
        .map(|start| (start, (start + morsel_rows).min(rows)))
        .collect();

    let partials = morsels
        .par_iter()
        .map(|&(start, end)| {
            budget.check()?;
            let mut state = init();
            if predicate.is_trivial() {
                for row in start..end {
                    fold(&mut state, row);
                }
            } else {
                for row in start..end {
                    if predicate.matches(row) {
                        fold(&mut state, row);
                    }
                }
            }
            budget.charge((end - start) as u64)?;
            Ok(state)
        })
        .collect::<Result<Vec<S>>>()?;

    Ok(partials.into_iter().fold(init(), merge))
}

/// Indices of matching rows, in row order
pub fn matching_rows(
    rows: usize,
    predicate: &BoundPredicate<'_>,
    morsel_rows: usize,
    budget: &ScanBudget,
) -> Result<Vec<u32>> {
    scan_fold(
        rows,
        predicate,
        morsel_rows,
        budget,
        Vec::new,
        |acc: &mut Vec<u32>, row| acc.push(row as u32),
        |mut a, mut b| {
            a.append(&mut b);
            a
        },
    )
}

/// Number of matching rows
pub fn count_rows(
    rows: usize,
    predicate: &BoundPredicate<'_>,
    morsel_rows: usize,
    budget: &ScanBudget,
) -> Result<u64> {
    if predicate.is_trivial() {
        budget.charge(0)?;
        return Ok(rows as u64);
    }
    scan_fold(
        rows,
        predicate,
        morsel_rows,
        budget,
        || 0u64,
        |n, _| *n += 1,
        |a, b| a + b,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DatasetGrain, FactVariant};
    use crate::query::predicate::Field;
    use crate::storage::segment::{ColumnDef, ColumnType};
    use crate::storage::{ColumnData, MmapSegment, SegmentWriter};
    use crate::types::Dimension;

    fn data(rows: usize) -> SegmentData {
        let mut w =
            SegmentWriter::new(vec![ColumnDef::new("awardee_name", ColumnType::Dictionary)]);
        for i in 0..rows {
            if let Some(ColumnData::Dictionary(c)) = w.column_mut("awardee_name") {
                c.push(Some(if i % 3 == 0 { "Acme" } else { "Other" }));
            }
        }
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("s.kcol");
        w.write_to(&path).unwrap();
        MmapSegment::open(&path).unwrap().decode().unwrap()
    }

    #[test]
    fn test_bind_errors_name_the_source() {
        let data = Arc::new(data(3));
        let loaded = LoadedSource {
            source: Arc::new(DatasetSource {
                id: "facts_awards_all_time".to_string(),
                path: std::path::PathBuf::from("facts_awards_all_time.kcol"),
                schema: data.schema().to_vec(),
                row_count: 3,
                grain: DatasetGrain::RawFact {
                    variant: FactVariant::Full,
                },
                covered_years: None,
                file_size: 0,
            }),
            data,
        };
        // keyword search on a segment with neither search_text nor titles
        let p = Predicate::Contains {
            field: Field::SearchText,
            needle: "flood".to_string(),
        };
        match loaded.bind(&p) {
            Err(Error::SourceUnavailable { source_id, .. }) => {
                assert_eq!(source_id, "facts_awards_all_time")
            },
            other => panic!("expected unavailable source, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_matching_rows_preserve_order_across_morsels() {
        let data = data(1_000);
        let p = Predicate::Contains {
            field: Field::Entity(Dimension::Contractor),
            needle: "acme".to_string(),
        };
        let bound = BoundPredicate::bind(&p, &data, ColumnLayout::Fact).unwrap();
        let budget = ScanBudget::unlimited("test");
        let rows = matching_rows(data.row_count(), &bound, 7, &budget).unwrap();
        let expected: Vec<u32> = (0..1_000).filter(|i| i % 3 == 0).collect();
        assert_eq!(rows, expected);
        assert_eq!(budget.rows_scanned(), 1_000);
        assert_eq!(count_rows(data.row_count(), &bound, 64, &budget).unwrap(), 334);
    }

    #[test]
    fn test_trivial_predicate_counts_all() {
        let data = data(10);
        let bound = BoundPredicate::bind(&Predicate::True, &data, ColumnLayout::Fact).unwrap();
        let budget = ScanBudget::unlimited("test");
        assert_eq!(count_rows(10, &bound, 4, &budget).unwrap(), 10);
        assert_eq!(count_rows(0, &bound, 4, &budget).unwrap(), 0);
    }

    #[test]
    fn test_cancelled_scan_stops() {
        let data = data(100);
        let bound = BoundPredicate::bind(&Predicate::True, &data, ColumnLayout::Fact).unwrap();
        let flag = crate::query::budget::CancellationFlag::new();
        flag.cancel();
        let budget = ScanBudget::unlimited("test").with_cancel(flag);
        assert!(matches!(
            matching_rows(100, &bound, 10, &budget),
            Err(crate::error::Error::Cancelled)
        ));
    }
}
