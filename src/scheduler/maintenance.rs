//! Background maintenance: look-ahead refresh and retention cleanup.

use crate::error::Result;
use crate::job::{CleanupCounts, JobStatus};
use crate::scheduler::SchedulerInner;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const MS_PER_DAY: i64 = 86_400_000;

/// Re-populate the timer set with the next chunk of due jobs.
///
/// Clears every pending timer, then arms the earliest active jobs whose
/// `next_run` falls inside the look-ahead window, up to `chunk_size`.
/// Jobs without a registered handler are skipped until one is attached.
pub(crate) async fn chunk_load(inner: &Arc<SchedulerInner>) -> Result<()> {
    let now = inner.config.clock.now_ms();
    let window_end = now + inner.config.look_ahead_window_ms;

    inner.timers.clear().await;

    let due = inner
        .store
        .due_in_window(window_end, inner.config.chunk_size)
        .await?;

    let mut armed = 0usize;
    {
        let handlers = inner.handlers.read().await;
        for job in &due {
            if !handlers.contains_key(&job.identifier) {
                tracing::warn!(
                    identifier = %job.identifier,
                    "due job has no registered handler, leaving it for a later registration"
                );
                continue;
            }
            inner.arm_timer(&job.identifier, job.next_run).await;
            armed += 1;
        }
    }

    tracing::debug!(armed, due = due.len(), window_end, "look-ahead window refreshed");
    Ok(())
}

/// Spawn the periodic look-ahead refresh. The first tick fires one full
/// period after start; the caller performs the initial chunk load.
pub(crate) fn spawn_refresh_loop(inner: Arc<SchedulerInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(inner.config.refresh_interval_ms.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(error) = chunk_load(&inner).await {
                tracing::error!(%error, "look-ahead refresh failed");
            }
        }
    })
}

/// Delete terminal jobs older than their retention thresholds.
pub(crate) async fn cleanup_pass(
    inner: &Arc<SchedulerInner>,
    completed_retention_days: u32,
    cancelled_retention_days: u32,
) -> Result<CleanupCounts> {
    let now = inner.config.clock.now_ms();

    let completed = inner
        .store
        .delete_terminal(
            JobStatus::Completed,
            now - i64::from(completed_retention_days) * MS_PER_DAY,
        )
        .await?;
    let cancelled = inner
        .store
        .delete_terminal(
            JobStatus::Cancelled,
            now - i64::from(cancelled_retention_days) * MS_PER_DAY,
        )
        .await?;

    Ok(CleanupCounts {
        completed,
        cancelled,
    })
}

/// Spawn the periodic retention cleanup. Errors are logged and swallowed;
/// retention is best-effort and must never stall the refresh loop or the
/// executor.
pub(crate) fn spawn_cleanup_loop(inner: Arc<SchedulerInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(inner.config.cleanup.interval_ms.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let cleanup = inner.config.cleanup;
            match cleanup_pass(
                &inner,
                cleanup.completed_retention_days,
                cleanup.cancelled_retention_days,
            )
            .await
            {
                Ok(counts) if counts.completed + counts.cancelled > 0 => {
                    tracing::info!(
                        completed = counts.completed,
                        cancelled = counts.cancelled,
                        "old terminal jobs removed"
                    );
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(%error, "retention cleanup failed");
                }
            }
        }
    })
}
