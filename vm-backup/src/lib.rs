//! VM backup workflow library
//!
//! Provides the retention manager for per-VM backup history, the per-target
//! backup orchestrator, VM and pool metadata capture, the status log, and
//! the run coordinator that ties them together.

use chrono::{Local, NaiveDateTime};

pub mod metadata;
pub mod orchestrator;
pub mod pool;
pub mod retention;
pub mod run;
pub mod status_log;

// Re-export key types
pub use orchestrator::{BackupOptions, Orchestrator, Outcome, State, TargetReport};
pub use retention::{Slot, SlotStatus};
pub use run::{run_backup, RunOptions, RunReport, RunStatus, RunSummary};
pub use status_log::StatusLog;

/// Source of wall-clock time for slot names, log lines and elapsed times.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

/// Local time of the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}
