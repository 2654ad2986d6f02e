//! cronlite: a persistent, single-process cron-style job scheduler.
//!
//! Jobs are registered under a caller-chosen identifier with either a
//! recurring cron expression or a one-shot absolute timestamp. Job state
//! lives in SQLite and survives restarts; handlers are in-process
//! callables that must be re-registered when the process comes back up.
//! A chunked look-ahead loader keeps the in-memory timer set bounded no
//! matter how large the job table grows, failing handlers are retried
//! with exponential backoff, and terminal jobs are garbage-collected on
//! a retention schedule.
//!
//! ```no_run
//! use cronlite::{Scheduler, SchedulerConfig};
//!
//! # async fn example() -> cronlite::Result<()> {
//! let scheduler = Scheduler::connect(SchedulerConfig::new("jobs.db")).await?;
//! scheduler
//!     .schedule("nightly-report", "0 0 3 * * *", || async {
//!         // build and send the report
//!         Ok(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod job;
pub mod schedule;
pub mod scheduler;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CleanupConfig, RetryConfig, SchedulerConfig};
pub use error::{Error, Result, ScheduleError, StoreError};
pub use job::{CleanupCounts, Job, JobStats, JobStatus};
pub use schedule::ScheduleInput;
pub use scheduler::Scheduler;
pub use store::JobStore;

use futures::future::BoxFuture;
use std::sync::Arc;

/// In-process job handler.
///
/// Handlers are never persisted: they version with the binary and must
/// be re-registered after a restart before their jobs can fire again.
pub type JobHandler = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Callback invoked with `(identifier, error)` when a firing exhausts
/// its retry budget.
pub type ErrorCallback = Arc<dyn Fn(&str, &anyhow::Error) + Send + Sync>;
