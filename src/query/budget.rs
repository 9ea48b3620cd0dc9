//! Scan budgets and cooperative cancellation
//!
//! Synchronous calls get a wall-clock deadline and an optional row ceiling;
//! background jobs get an unlimited budget with a cancellation flag. Scans
//! call [`ScanBudget::charge`] once per morsel, so a budget is enforced at
//! morsel granularity rather than per row.

use crate::config::QueryConfig;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared flag a submitter raises and a worker polls
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// New, unraised flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the flag is raised
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Limits applied to one logical scan
#[derive(Debug)]
pub struct ScanBudget {
    operation: &'static str,
    started: Instant,
    deadline: Option<Duration>,
    max_rows: Option<u64>,
    rows: AtomicU64,
    cancel: Option<CancellationFlag>,
    suggested_job: Option<&'static str>,
}

impl ScanBudget {
    /// No deadline and no row ceiling
    pub fn unlimited(operation: &'static str) -> Self {
        Self {
            operation,
            started: Instant::now(),
            deadline: None,
            max_rows: None,
            rows: AtomicU64::new(0),
            cancel: None,
            suggested_job: None,
        }
    }

    /// Budget of a synchronous call
    ///
    /// `suggested_job` names the job kind a caller should submit when the
    /// budget runs out.
    pub fn synchronous(
        operation: &'static str,
        config: &QueryConfig,
        suggested_job: Option<&'static str>,
    ) -> Self {
        Self {
            deadline: Some(Duration::from_millis(config.sync_budget_ms)),
            max_rows: (config.max_sync_scan_rows > 0).then_some(config.max_sync_scan_rows),
            suggested_job,
            ..Self::unlimited(operation)
        }
    }

    /// Attach a cancellation flag
    pub fn with_cancel(mut self, flag: CancellationFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Operation name
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Rows charged so far
    pub fn rows_scanned(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    /// Time since the budget was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Fail if cancelled or past the deadline
    pub fn check(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if self.started.elapsed() > deadline {
                return Err(Error::resource_exceeded(
                    self.operation,
                    format!("scan budget of {}ms elapsed", deadline.as_millis()),
                    self.suggested_job,
                ));
            }
        }
        Ok(())
    }

    /// Account for `rows` scanned rows, then [`check`](Self::check)
    pub fn charge(&self, rows: u64) -> Result<()> {
        let total = self.rows.fetch_add(rows, Ordering::Relaxed) + rows;
        if let Some(max) = self.max_rows {
            if total > max {
                return Err(Error::resource_exceeded(
                    self.operation,
                    format!("scan exceeded {} rows", max),
                    self.suggested_job,
                ));
            }
        }
        self.check()
    }

    /// Fail up front when a plan is known to exceed the row ceiling
    pub fn admit(&self, planned_rows: u64) -> Result<()> {
        match self.max_rows {
            Some(max) if planned_rows > max => Err(Error::resource_exceeded(
                self.operation,
                format!("plan reads {} rows, limit is {}", planned_rows, max),
                self.suggested_job,
            )),
            _ => self.check(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn test_cancellation() {
        let flag = CancellationFlag::new();
        let budget = ScanBudget::unlimited("export").with_cancel(flag.clone());
        assert!(budget.check().is_ok());
        flag.cancel();
        assert!(matches!(budget.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_row_ceiling() {
        let config = QueryConfig {
            max_sync_scan_rows: 100,
            ..QueryConfig::default()
        };
        let budget = ScanBudget::synchronous("aggregate", &config, Some("heavyAggregate"));
        assert!(budget.charge(60).is_ok());
        let err = budget.charge(60).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Retryable);
        assert!(err.to_string().contains("heavyAggregate"));
        assert_eq!(budget.rows_scanned(), 120);
        assert!(budget.admit(101).is_err());
    }

    #[test]
    fn test_deadline() {
        let config = QueryConfig {
            sync_budget_ms: 0,
            ..QueryConfig::default()
        };
        let budget = ScanBudget::synchronous("histogram", &config, None);
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(budget.check(), Err(Error::ResourceExceeded(_))));
    }
}
