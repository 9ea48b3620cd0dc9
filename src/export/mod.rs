//! Export pipeline
//!
//! [`csv`] holds the RFC 4180 encoder; [`pipeline`] drives chunked, cancellable
//! exports of contracts or aggregated groups into any `Write` sink.

pub mod csv;
pub mod pipeline;

pub use csv::{CsvWriter, AGGREGATED_HEADER, ROW_HEADER};
pub use pipeline::{ExportEstimate, ExportPipeline, ExportProgress, ExportSummary, ExportTarget};
