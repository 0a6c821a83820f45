//! Task scheduling
//!
//! - `backlog`: priority-ordered pending tasks
//! - `progress`: delta accounting for absolute progress reports
//! - `aggregate`: fleet-wide requested/gathered totals per resource
//! - `archive`: bounded store of finished tasks
//! - `scheduler`: lifecycle, assignment, retries and emergency stop

pub mod aggregate;
pub mod archive;
pub mod backlog;
pub mod progress;
pub mod scheduler;

pub use aggregate::{ResourceAggregates, ResourceTotals};
pub use archive::TaskArchive;
pub use backlog::Backlog;
pub use progress::ProgressDelta;
pub use scheduler::{FailureOutcome, SchedulerError, TaskScheduler, EMERGENCY_STOP_REASON};
