//! Chunked CSV export
//!
//! Rows are written straight from the decoded segments in scan order. After
//! every `chunk_rows` records the sink is flushed, progress is reported and
//! the budget (deadline and cancellation flag) is checked, so memory stays
//! bounded by one chunk and a cancel request is honoured at the next chunk
//! boundary.

use crate::config::ExportConfig;
use crate::error::Result;
use crate::export::csv::{CsvWriter, AGGREGATED_HEADER, ROW_HEADER};
use crate::query::budget::ScanBudget;
use crate::query::predicate::Predicate;
use crate::query::{AggregationRow, LoadedSource};
use crate::storage::ContractReader;
use crate::types::Dimension;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::debug;

/// What an export produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ExportTarget {
    /// One record per contract
    Rows,
    /// One record per group of a dimension
    Aggregated {
        /// Grouping dimension
        dimension: Dimension,
    },
}

/// Pre-flight size estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportEstimate {
    /// Records the export would contain, header excluded
    pub row_count: u64,
    /// Approximate CSV size
    pub estimated_bytes: u64,
    /// Whether the export would be served inline
    pub inline: bool,
}

/// Progress of a running export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportProgress {
    /// Records written, header excluded
    pub rows_written: u64,
    /// Records expected
    pub expected_rows: u64,
    /// Bytes written
    pub bytes_written: u64,
}

impl ExportProgress {
    /// Completion in percent, held below 100 until the export finishes
    pub fn percent(&self) -> u8 {
        if self.expected_rows == 0 {
            return 0;
        }
        ((self.rows_written.saturating_mul(100) / self.expected_rows).min(99)) as u8
    }
}

/// Outcome of a finished export
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    /// Records written, header excluded
    pub rows: u64,
    /// Bytes written
    pub bytes: u64,
    /// Chunk boundaries crossed
    pub chunks: u64,
}

/// Export settings resolved from config
#[derive(Debug, Clone)]
pub struct ExportPipeline {
    chunk_rows: u64,
    sync_row_threshold: u64,
    row_bytes: u64,
    aggregated_row_bytes: u64,
}

impl ExportPipeline {
    /// Build from config
    pub fn new(config: &ExportConfig) -> Self {
        Self {
            chunk_rows: config.chunk_rows.max(1) as u64,
            sync_row_threshold: config.sync_row_threshold,
            row_bytes: config.row_bytes_estimate,
            aggregated_row_bytes: config.aggregated_row_bytes_estimate,
        }
    }

    /// Estimate an export of `row_count` records
    pub fn estimate(&self, target: ExportTarget, row_count: u64) -> ExportEstimate {
        let per_row = match target {
            ExportTarget::Rows => self.row_bytes,
            ExportTarget::Aggregated { .. } => self.aggregated_row_bytes,
        };
        ExportEstimate {
            row_count,
            estimated_bytes: row_count.saturating_mul(per_row),
            inline: row_count <= self.sync_row_threshold,
        }
    }

    /// Rows per chunk
    pub fn chunk_rows(&self) -> u64 {
        self.chunk_rows
    }

    /// Stream matching contracts of every source as CSV
    pub fn export_rows<W: Write>(
        &self,
        sources: &[LoadedSource],
        predicate: &Predicate,
        sink: W,
        expected_rows: u64,
        budget: &ScanBudget,
        progress: &mut dyn FnMut(ExportProgress),
    ) -> Result<ExportSummary> {
        let mut csv = CsvWriter::new(sink);
        csv.write_record(ROW_HEADER)?;
        let mut summary = ExportSummary::default();

        for source in sources {
            let bound = source.bind(predicate)?;
            let reader = ContractReader::new(&source.data).map_err(|e| source.unavailable(e))?;
            let mut scanned = 0u64;
            for row in 0..source.data.row_count() {
                scanned += 1;
                if !bound.matches(row) {
                    continue;
                }
                csv.write_contract(&reader.read(row))?;
                summary.rows += 1;
                if summary.rows % self.chunk_rows == 0 {
                    self.end_chunk(&mut csv, &mut summary, expected_rows, progress)?;
                    budget.charge(scanned)?;
                    scanned = 0;
                }
            }
            budget.charge(scanned)?;
            debug!(source = %source.source.id, rows = summary.rows, "Export source drained");
        }

        csv.flush()?;
        summary.bytes = csv.bytes_written();
        Ok(summary)
    }

    /// Write sorted groups as CSV
    pub fn export_aggregated<W: Write>(
        &self,
        rows: &[AggregationRow],
        sink: W,
        budget: &ScanBudget,
        progress: &mut dyn FnMut(ExportProgress),
    ) -> Result<ExportSummary> {
        let mut csv = CsvWriter::new(sink);
        csv.write_record(AGGREGATED_HEADER)?;
        let mut summary = ExportSummary::default();
        let expected = rows.len() as u64;

        for row in rows {
            csv.write_aggregation(row)?;
            summary.rows += 1;
            if summary.rows % self.chunk_rows == 0 {
                self.end_chunk(&mut csv, &mut summary, expected, progress)?;
                budget.check()?;
            }
        }

        csv.flush()?;
        summary.bytes = csv.bytes_written();
        Ok(summary)
    }

    fn end_chunk<W: Write>(
        &self,
        csv: &mut CsvWriter<W>,
        summary: &mut ExportSummary,
        expected_rows: u64,
        progress: &mut dyn FnMut(ExportProgress),
    ) -> Result<()> {
        csv.flush()?;
        summary.chunks += 1;
        summary.bytes = csv.bytes_written();
        progress(ExportProgress {
            rows_written: summary.rows,
            expected_rows: expected_rows.max(summary.rows),
            bytes_written: summary.bytes,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::budget::CancellationFlag;

    fn pipeline(chunk_rows: usize) -> ExportPipeline {
        ExportPipeline::new(&ExportConfig {
            chunk_rows,
            ..ExportConfig::default()
        })
    }

    fn group(label: &str, count: u64) -> AggregationRow {
        AggregationRow {
            label: label.to_string(),
            count,
            total_value: crate::types::Money::from_major(count as f64 * 10.0),
            avg_value: crate::types::Money::from_major(10.0),
            first_date: None,
            last_date: None,
            category_count: None,
        }
    }

    #[test]
    fn test_estimate_and_threshold() {
        let p = pipeline(25_000);
        let e = p.estimate(ExportTarget::Rows, 6_000_000);
        assert_eq!(e.estimated_bytes, 6_000_000 * 250);
        assert!(!e.inline);
        let e = p.estimate(ExportTarget::Aggregated { dimension: Dimension::Area }, 10);
        assert_eq!(e.estimated_bytes, 1_200);
        assert!(e.inline);
        assert!(p.estimate(ExportTarget::Rows, 100_000).inline);
    }

    #[test]
    fn test_aggregated_export_reports_chunks() {
        let p = pipeline(2);
        let rows: Vec<_> = (0..5).map(|i| group(&format!("g{}", i), i + 1)).collect();
        let mut seen = Vec::new();
        let summary = p
            .export_aggregated(&rows, Vec::new(), &ScanBudget::unlimited("export"), &mut |e| {
                seen.push(e.rows_written)
            })
            .unwrap();
        assert_eq!(summary.rows, 5);
        assert_eq!(summary.chunks, 2);
        assert_eq!(seen, vec![2, 4]);
    }

    #[test]
    fn test_cancel_stops_at_chunk_boundary() {
        let p = pipeline(2);
        let rows: Vec<_> = (0..10).map(|i| group("g", i + 1)).collect();
        let flag = CancellationFlag::new();
        let budget = ScanBudget::unlimited("export").with_cancel(flag.clone());
        let mut out = Vec::new();
        let result = p.export_aggregated(&rows, &mut out, &budget, &mut |_| flag.cancel());
        assert!(matches!(result, Err(crate::error::Error::Cancelled)));
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_progress_percent() {
        let p = ExportProgress {
            rows_written: 50,
            expected_rows: 100,
            bytes_written: 0,
        };
        assert_eq!(p.percent(), 50);
        let done = ExportProgress {
            rows_written: 100,
            expected_rows: 100,
            bytes_written: 0,
        };
        assert_eq!(done.percent(), 99);
    }
}
