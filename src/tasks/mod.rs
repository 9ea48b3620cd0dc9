//! Background jobs
//!
//! Work too large for a synchronous call (row-level exports, aggregated
//! exports past the inline threshold, heavy aggregates and full-table
//! searches) runs here.
//!
//! ```text
//! ┌──────────────────┐   ┌────────────┐   ┌─────────────────┐
//! │ TaskOrchestrator │──▶│  JobStore  │◀──│     Reaper      │
//! └──────────────────┘   └────────────┘   └─────────────────┘
//!          │                                       ▲
//!          ▼                                       │ retention
//! ┌──────────────────┐                     ┌─────────────────┐
//! │ ProgressChannel  │                     │ artifact dir    │
//! └──────────────────┘                     └─────────────────┘
//! ```

pub mod job;
pub mod orchestrator;
pub mod progress;
pub mod reaper;
pub mod store;

pub use job::{
    CancelAck, ExportJob, JobId, JobKind, JobResult, JobSpec, JobState, JobStatus,
};
pub use orchestrator::{JobContext, JobRunner, JobSubscription, TaskOrchestrator};
pub use progress::{JobEvent, ProgressChannel, ProgressStats};
pub use reaper::{ReapReport, Reaper};
pub use store::JobStore;
