//! Top-level error types for cronlite.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Schedule-input validation errors. Raised synchronously from `schedule`
/// before anything is persisted.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error("scheduled time {specific_time} is not in the future (now is {now})")]
    TimeInPast { specific_time: i64, now: i64 },

    #[error("job identifier must not be empty")]
    EmptyIdentifier,
}

/// Job store connection and lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job store used before initialization")]
    NotInitialized,

    #[error("failed to open SQLite database: {0}")]
    Connect(#[source] sqlx::Error),
}
