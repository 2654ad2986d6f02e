//! Job records and lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// Jobs start `active`. `cancelled` and `completed` are terminal: no
/// further transitions, only deletion by retention cleanup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Active,
    Paused,
    Cancelled,
    Completed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Active,
        JobStatus::Paused,
        JobStatus::Cancelled,
        JobStatus::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(JobStatus::Active),
            "paused" => Some(JobStatus::Paused),
            "cancelled" => Some(JobStatus::Cancelled),
            "completed" => Some(JobStatus::Completed),
            _ => None,
        }
    }

    /// Terminal states are subject to retention-based deletion.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Cancelled | JobStatus::Completed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Statuses from which a transition into `next` is legal.
///
/// active -> paused | cancelled | completed, paused -> active | cancelled.
pub(crate) fn transition_sources(next: JobStatus) -> &'static [JobStatus] {
    match next {
        JobStatus::Active => &[JobStatus::Paused],
        JobStatus::Paused => &[JobStatus::Active],
        JobStatus::Cancelled => &[JobStatus::Active, JobStatus::Paused],
        JobStatus::Completed => &[JobStatus::Active],
    }
}

/// A durable job record.
///
/// Exactly one of `cron_expression` and `specific_time` is set: recurring
/// jobs carry a cron expression, one-shot jobs an absolute instant. All
/// instants are integer milliseconds since the Unix epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque unique id, assigned at creation.
    pub id: String,

    /// Caller-supplied unique name; the primary lookup key.
    pub identifier: String,

    /// Cron expression for recurring jobs.
    pub cron_expression: Option<String>,

    /// Absolute firing instant for one-shot jobs.
    pub specific_time: Option<i64>,

    pub status: JobStatus,

    /// Next firing instant. For completed one-shot jobs this keeps the
    /// instant they were scheduled to fire.
    pub next_run: i64,

    /// Instant of the last handler invocation attempt, success or final
    /// failure.
    pub last_run: Option<i64>,

    /// Scheduled firings so far. Incremented once per firing, not per
    /// retry attempt.
    pub run_count: i64,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    pub fn is_recurring(&self) -> bool {
        self.cron_expression.is_some()
    }
}

/// Aggregate counters over the whole job table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStats {
    pub total: i64,
    pub active: i64,
    pub paused: i64,
    pub cancelled: i64,
    pub completed: i64,
    pub total_runs: i64,
}

/// Rows deleted by a cleanup pass, per terminal status.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupCounts {
    pub completed: u64,
    pub cancelled: u64,
}
