//! Value-distribution histogram
//!
//! Bounds come from the filtered rows themselves, so bins adapt to the
//! query. Bin assignment is done in integer minor units:
//!
//! ```text
//! index = floor((v - min) * N / (max - min)), clamped to N - 1
//! ```
//!
//! which makes every bin half-open except the last one, and keeps
//! `Σ count` and `Σ totalValue` over bins exact.

use crate::error::Result;
use crate::query::budget::ScanBudget;
use crate::query::predicate::Predicate;
use crate::query::scan::{scan_fold, LoadedSource};
use crate::storage::schema::fact;
use crate::types::{Money, MINOR_PER_MAJOR};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Non-null amounts of the filtered rows, in minor units
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmountSample {
    /// Amounts, in scan order
    pub values: Vec<i64>,
    /// Filtered rows whose amount is null
    pub missing: u64,
}

impl AmountSample {
    fn merge(mut self, mut other: AmountSample) -> Self {
        self.values.append(&mut other.values);
        self.missing += other.missing;
        self
    }
}

/// Collect the amounts of every matching row
pub fn collect_amounts(
    sources: &[LoadedSource],
    predicate: &Predicate,
    morsel_rows: usize,
    budget: &ScanBudget,
) -> Result<AmountSample> {
    let mut sample = AmountSample::default();
    for source in sources {
        let bound = source.bind(predicate)?;
        let amounts = source
            .data
            .int64(fact::CONTRACT_AMOUNT)
            .map_err(|e| source.unavailable(e))?;
        let part = scan_fold(
            source.data.row_count(),
            &bound,
            morsel_rows,
            budget,
            AmountSample::default,
            |s, row| match amounts.get(row) {
                Some(v) => s.values.push(v),
                None => s.missing += 1,
            },
            AmountSample::merge,
        )?;
        sample = sample.merge(part);
    }
    Ok(sample)
}

/// One histogram bin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramBin {
    /// Position of the bin
    pub index: usize,
    /// Inclusive lower bound, major units
    pub range_start: f64,
    /// Upper bound, major units (inclusive only for the last bin)
    pub range_end: f64,
    /// Rows in the bin
    pub count: u64,
    /// Summed value
    pub total_value: Money,
    /// `total_value / count`
    pub avg_value: Money,
}

/// Response of the value distribution operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueDistribution {
    /// Smallest filtered amount
    pub min_value: Money,
    /// Largest filtered amount
    pub max_value: Money,
    /// Width of one bin, major units
    pub bin_width: f64,
    /// Number of bins produced
    pub num_bins: usize,
    /// Rows placed in bins
    pub total_contracts: u64,
    /// Filtered rows left out because their amount is null
    pub excluded_missing_values: u64,
    /// Bins, ordered by index
    pub bins: Vec<HistogramBin>,
}

#[derive(Debug, Clone, Copy, Default)]
struct BinAcc {
    count: u64,
    total: i128,
}

fn to_major(minor: f64) -> f64 {
    minor / MINOR_PER_MAJOR as f64
}

/// Bin a sample into `num_bins` equal-width bins
pub fn value_distribution(sample: &AmountSample, num_bins: usize) -> ValueDistribution {
    let values = &sample.values;
    let (Some(&min), Some(&max)) = (values.par_iter().min(), values.par_iter().max()) else {
        return ValueDistribution {
            min_value: Money::ZERO,
            max_value: Money::ZERO,
            bin_width: 0.0,
            num_bins: 0,
            total_contracts: 0,
            excluded_missing_values: sample.missing,
            bins: Vec::new(),
        };
    };

    let n = if min == max { 1 } else { num_bins.max(1) };
    let range = (max as i128) - (min as i128);

    let accs = values
        .par_chunks(64 * 1024)
        .map(|chunk| {
            let mut accs = vec![BinAcc::default(); n];
            for &v in chunk {
                let index = if range == 0 {
                    0
                } else {
                    (((v as i128 - min as i128) * n as i128) / range).min(n as i128 - 1) as usize
                };
                accs[index].count += 1;
                accs[index].total += v as i128;
            }
            accs
        })
        .reduce(
            || vec![BinAcc::default(); n],
            |mut a, b| {
                for (x, y) in a.iter_mut().zip(b) {
                    x.count += y.count;
                    x.total += y.total;
                }
                a
            },
        );

    let width_minor = range as f64 / n as f64;
    let bins = accs
        .iter()
        .enumerate()
        .map(|(index, acc)| {
            let range_end = if index + 1 == n {
                to_major(max as f64)
            } else {
                to_major(min as f64 + width_minor * (index + 1) as f64)
            };
            HistogramBin {
                index,
                range_start: to_major(min as f64 + width_minor * index as f64),
                range_end,
                count: acc.count,
                total_value: Money::from_accumulator(acc.total),
                avg_value: Money::average(acc.total, acc.count),
            }
        })
        .collect();

    ValueDistribution {
        min_value: Money::from_minor(min),
        max_value: Money::from_minor(max),
        bin_width: to_major(width_minor),
        num_bins: n,
        total_contracts: values.len() as u64,
        excluded_missing_values: sample.missing,
        bins,
    }
}
