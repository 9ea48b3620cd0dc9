//! Query layer: filter compilation, routing and execution
//!
//! # Architecture
//!
//! ```text
//! FilterRequest (JSON)
//!      │
//!      ▼
//! ┌─────────────┐
//! │  Compile    │  FilterCompiler → FilterSpec + warnings
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │   Route     │  select_source → RoutePlan (tier + sources)
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │   Bind      │  Predicate → BoundPredicate per segment
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │   Scan      │  morsel-parallel fold under a ScanBudget
//! └─────────────┘
//!      │
//!      ▼
//!  aggregate / search / histogram / rounding
//! ```

pub mod aggregate;
pub mod budget;
pub mod filter;
pub mod histogram;
pub mod options;
pub mod predicate;
pub mod rounding;
pub mod router;
pub mod scan;
pub mod search;

pub use aggregate::{
    AggregateResponse, Aggregation, AggregationRow, PaginatedAggregate, SortKey, Summary,
    TimeBucket,
};
pub use budget::{CancellationFlag, ScanBudget};
pub use filter::{
    FilterCompiler, FilterRequest, FilterSpec, FilterWarning, MatchTerm, TimeRange, ValueRange,
};
pub use histogram::{AmountSample, HistogramBin, ValueDistribution};
pub use options::{EntityLookup, EntityLookupResponse, FilterOptions};
pub use predicate::{BoundPredicate, ColumnLayout, Field, Predicate};
pub use rounding::{RoundingPolicy, RoundingReport};
pub use router::{select_source, RequestedGrain, RoutePlan, Tier};
pub use scan::LoadedSource;
pub use search::{SearchPage, SearchResponse, SearchSort};
