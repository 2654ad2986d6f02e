//! Scheduler configuration.

use crate::ErrorCallback;
use crate::clock::{Clock, SystemClock};
use std::sync::Arc;

/// Scheduler configuration.
///
/// Constructed with [`SchedulerConfig::new`] and adjusted field by field;
/// every knob other than the database location has a production default.
#[derive(Clone)]
pub struct SchedulerConfig {
    /// SQLite database path. `":memory:"` opens a private in-memory store.
    pub db: String,

    /// Maximum number of jobs armed per chunk-load pass.
    pub chunk_size: i64,

    /// Period of the look-ahead refresh loop in milliseconds.
    pub refresh_interval_ms: u64,

    /// Horizon within which timers are armed, in milliseconds.
    pub look_ahead_window_ms: i64,

    /// Retry behavior for failing handlers.
    pub retry: RetryConfig,

    /// Retention-based cleanup of terminal jobs.
    pub cleanup: CleanupConfig,

    /// Callback invoked with `(identifier, error)` when a firing exhausts
    /// its retries. When absent, the final error is logged instead.
    pub on_error: Option<ErrorCallback>,

    /// Time source. Swapped out in tests.
    pub clock: Arc<dyn Clock>,
}

impl SchedulerConfig {
    /// Build a configuration with production defaults for the given
    /// database location.
    pub fn new(db: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            chunk_size: 1000,
            refresh_interval_ms: 86_400_000,
            look_ahead_window_ms: 90_000_000,
            retry: RetryConfig::default(),
            cleanup: CleanupConfig::default(),
            on_error: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl std::fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("db", &self.db)
            .field("chunk_size", &self.chunk_size)
            .field("refresh_interval_ms", &self.refresh_interval_ms)
            .field("look_ahead_window_ms", &self.look_ahead_window_ms)
            .field("retry", &self.retry)
            .field("cleanup", &self.cleanup)
            .field("on_error", &self.on_error.as_ref().map(|_| "..."))
            .finish_non_exhaustive()
    }
}

/// Exponential-backoff retry configuration for handler failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Handler attempts per firing. `1` disables retries.
    pub max_attempts: u32,

    /// Base delay for exponential backoff, in milliseconds.
    pub base_delay_ms: u64,

    /// Backoff ceiling in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Retention-based cleanup of completed and cancelled jobs.
#[derive(Debug, Clone, Copy)]
pub struct CleanupConfig {
    /// Whether the background cleanup loop runs at all.
    pub enabled: bool,

    /// Period of the cleanup loop in milliseconds.
    pub interval_ms: u64,

    /// Completed jobs older than this many days are deleted.
    pub completed_retention_days: u32,

    /// Cancelled jobs older than this many days are deleted.
    pub cancelled_retention_days: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 86_400_000,
            completed_retention_days: 7,
            cancelled_retention_days: 30,
        }
    }
}
