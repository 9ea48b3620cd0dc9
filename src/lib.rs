//! awardlens - analytics core for government contract awards
//!
//! This library answers filtered questions over a read-only, precomputed
//! columnar dataset of contract awards:
//! - Search, grouped aggregates and paginated group listings
//! - Value histograms and a rounding-pattern heuristic
//! - CSV exports, inline when small and as background jobs otherwise
//! - Job orchestration with progress subscriptions and artifact retention
//!
//! Requests route to the narrowest sufficient tier (dimension rollups, time
//! partitions, title-search or full fact table) without changing the answer.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod engine;
pub mod error;
pub mod export;
pub mod storage;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Filter compilation, tier routing and scans
pub mod query;

/// Background jobs, job store, progress channel and reaper
pub mod tasks;

/// Background services with lifecycle management and graceful shutdown
pub mod services;

// Re-export main types
pub use config::Config;
pub use engine::{AnalyticsEngine, AnalyticsEngineBuilder, QueryEngine};
pub use error::{Error, Result};
pub use types::{Dimension, Money};
