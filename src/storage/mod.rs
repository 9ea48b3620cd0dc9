//! Storage layer for the precomputed columnar dataset
//!
//! Segments are immutable files produced by the offline ETL. The core reads
//! them through memory maps and decodes them once into [`SegmentData`],
//! which the catalog caches and shares across queries.
//!
//! ```text
//! ETL → SegmentWriter → .kcol file → MmapSegment::open → decode → SegmentData
//!                                     (header + directory)  (checksum + snappy)
//! ```

/// Memory-mapped segment reader
pub mod mmap;
/// Fact and rollup schemas
pub mod schema;
/// Segment format, columns and writer
pub mod segment;

pub use mmap::MmapSegment;
pub use schema::{ContractReader, RollupRecord};
pub use segment::{
    ColumnData, ColumnDef, ColumnType, SegmentData, SegmentError, SegmentHeader, SegmentWriter,
    TextColumn,
};
