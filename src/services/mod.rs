//! Background services
//!
//! ```text
//! ┌──────────────────┐  depends on  ┌──────────────────┐
//! │  ReaperService   │─────────────▶│ JobWorkerService │
//! └──────────────────┘              └──────────────────┘
//!          │                                 │
//!          ▼                                 ▼
//!      Reaper::sweep               TaskOrchestrator workers
//! ```
//!
//! Both run under a [`ServiceManager`], which orders startup by dependency
//! and stops everything on one shutdown signal.
//!
//! # Example
//!
//! ```rust
//! use awardlens::services::{ServiceConfig, ServiceManager};
//!
//! let manager = ServiceManager::new(ServiceConfig::default());
//! assert!(manager.status().is_empty());
//! ```

pub mod framework;
pub mod job_workers;
pub mod reaper;

pub use framework::{
    RestartPolicy, Service, ServiceConfig, ServiceError, ServiceHealth, ServiceManager,
    ServiceStatus, SharedServiceManager,
};
pub use job_workers::JobWorkerService;
pub use reaper::ReaperService;
