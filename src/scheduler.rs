//! Scheduler engine: public facade, timer arming, background loops.

pub(crate) mod executor;
pub(crate) mod maintenance;
pub(crate) mod timers;

use crate::JobHandler;
use crate::config::SchedulerConfig;
use crate::error::{Result, ScheduleError};
use crate::job::{CleanupCounts, Job, JobStats, JobStatus};
use crate::schedule::{ScheduleInput, parse_schedule};
use crate::store::JobStore;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use self::timers::TimerSet;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Shared engine state behind the [`Scheduler`] handle.
pub(crate) struct SchedulerInner {
    pub(crate) config: SchedulerConfig,
    pub(crate) store: JobStore,
    pub(crate) handlers: RwLock<HashMap<String, JobHandler>>,
    pub(crate) timers: TimerSet,
    loops: Mutex<LoopHandles>,
    running: AtomicBool,
}

#[derive(Default)]
struct LoopHandles {
    refresh: Option<JoinHandle<()>>,
    cleanup: Option<JoinHandle<()>>,
}

impl SchedulerInner {
    /// Initialize the store on first use. Idempotent.
    pub(crate) async fn ensure_init(&self) -> Result<()> {
        if self.store.is_initialized() {
            return Ok(());
        }
        self.store.init().await
    }

    /// Arm (or replace) the one-shot timer for `identifier`, fixed to
    /// fire at `next_run_ms`. Deadlines already in the past fire
    /// immediately.
    ///
    /// Boxed explicitly (rather than `async fn`) because this method and
    /// [`executor::run_job`] call each other: `run_job` re-arms the timer
    /// for the next firing, and the armed timer's task calls back into
    /// `run_job`. Left as an opaque `impl Future`, the compiler cannot
    /// prove the mutually recursive `Send` bound terminates.
    pub(crate) fn arm_timer<'a>(
        self: &'a Arc<Self>,
        identifier: &'a str,
        next_run_ms: i64,
    ) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let now = self.config.clock.now_ms();
            let delay_ms = next_run_ms.saturating_sub(now).max(0) as u64;
            let delay = Duration::from_millis(delay_ms);

            let inner = Arc::clone(self);
            let fired_identifier = identifier.to_string();
            self.timers
                .arm(identifier.to_string(), move || {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        inner.timers.take(&fired_identifier).await;
                        executor::run_job(Arc::clone(&inner), fired_identifier).await;
                    })
                })
                .await;

            tracing::debug!(identifier = %identifier, delay_ms, "timer armed");
        })
    }
}

/// Persistent cron-style job scheduler.
///
/// Jobs survive process restarts in the SQLite store; handlers are
/// in-process callables and must be re-registered after a restart with
/// [`Scheduler::register_handler`].
///
/// Cloning the handle shares the same engine.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn into_handler<F, Fut>(handler: F) -> JobHandler
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(handler()))
}

impl Scheduler {
    /// Open the job store and build an engine around it. The engine does
    /// not run until [`Scheduler::start`] or the first `schedule` call.
    pub async fn connect(config: SchedulerConfig) -> Result<Self> {
        if config.refresh_interval_ms as i64 >= config.look_ahead_window_ms {
            tracing::warn!(
                refresh_interval_ms = config.refresh_interval_ms,
                look_ahead_window_ms = config.look_ahead_window_ms,
                "refresh interval is not shorter than the look-ahead window; jobs becoming due \
                 between ticks are only caught by immediate arming at schedule time"
            );
        }

        let store = JobStore::connect(&config.db).await?;

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                config,
                store,
                handlers: RwLock::new(HashMap::new()),
                timers: TimerSet::new(),
                loops: Mutex::new(LoopHandles::default()),
                running: AtomicBool::new(false),
            }),
        })
    }

    /// Register a job under `identifier` and persist it as `active`.
    ///
    /// Re-scheduling an existing identifier replaces the prior record
    /// entirely: new schedule, new `id`, `run_count` back to zero. The
    /// handler replaces any prior handler under the same identifier. If
    /// the engine is not yet running it is started. Returns the job `id`.
    pub async fn schedule<F, Fut>(
        &self,
        identifier: impl Into<String>,
        input: impl Into<ScheduleInput>,
        handler: F,
    ) -> Result<String>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.schedule_job(identifier.into(), input.into(), into_handler(handler))
            .await
    }

    /// Type-erased variant of [`Scheduler::schedule`].
    pub async fn schedule_job(
        &self,
        identifier: String,
        input: ScheduleInput,
        handler: JobHandler,
    ) -> Result<String> {
        if identifier.trim().is_empty() {
            return Err(ScheduleError::EmptyIdentifier.into());
        }

        self.inner.ensure_init().await?;

        let now = self.inner.config.clock.now_ms();
        let parsed = parse_schedule(&input, now)?;

        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            identifier: identifier.clone(),
            cron_expression: parsed.cron_expression,
            specific_time: parsed.specific_time,
            status: JobStatus::Active,
            next_run: parsed.next_run,
            last_run: None,
            run_count: 0,
            created_at: now,
            updated_at: now,
        };

        self.inner
            .handlers
            .write()
            .await
            .insert(identifier.clone(), handler);
        self.inner.store.upsert(&job).await?;

        tracing::info!(
            identifier = %identifier,
            next_run = job.next_run,
            recurring = job.is_recurring(),
            "job scheduled"
        );

        if !self.is_running() {
            // start() performs a chunk load, which arms the job if due.
            self.start().await?;
        } else if parsed.next_run <= now + self.inner.config.look_ahead_window_ms {
            self.inner.arm_timer(&identifier, parsed.next_run).await;
        } else {
            // A prior schedule under this identifier may have left a
            // pending timer with a stale deadline.
            self.inner.timers.cancel(&identifier).await;
        }

        Ok(job.id)
    }

    /// Attach a handler to an already persisted job, without touching its
    /// record. This is how jobs resume working after a process restart.
    pub async fn register_handler<F, Fut>(
        &self,
        identifier: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let identifier = identifier.into();
        self.inner
            .handlers
            .write()
            .await
            .insert(identifier.clone(), into_handler(handler));

        // If the engine is already running, arm the job now instead of
        // waiting for the next refresh tick.
        if self.is_running() {
            self.inner.ensure_init().await?;
            if let Some(job) = self.inner.store.get_by_identifier(&identifier).await? {
                let now = self.inner.config.clock.now_ms();
                if job.status == JobStatus::Active
                    && job.next_run <= now + self.inner.config.look_ahead_window_ms
                {
                    self.inner.arm_timer(&identifier, job.next_run).await;
                }
            }
        }

        tracing::debug!(identifier = %identifier, "handler registered");
        Ok(())
    }

    /// Cancel a job: terminal, no further firings. The pending timer is
    /// dropped and the handler forgotten. Idempotent; returns whether a
    /// record actually changed state.
    pub async fn cancel(&self, identifier: &str) -> Result<bool> {
        self.inner.ensure_init().await?;

        let now = self.inner.config.clock.now_ms();
        let rows = self
            .inner
            .store
            .update_status(identifier, JobStatus::Cancelled, now)
            .await?;

        self.inner.timers.cancel(identifier).await;
        self.inner.handlers.write().await.remove(identifier);

        if rows > 0 {
            tracing::info!(identifier = %identifier, "job cancelled");
        }
        Ok(rows > 0)
    }

    /// Pause an active job. The pending timer is dropped; the handler
    /// stays registered so `resume` picks up where it left off.
    pub async fn pause(&self, identifier: &str) -> Result<bool> {
        self.inner.ensure_init().await?;

        let now = self.inner.config.clock.now_ms();
        let rows = self
            .inner
            .store
            .update_status(identifier, JobStatus::Paused, now)
            .await?;

        self.inner.timers.cancel(identifier).await;

        if rows > 0 {
            tracing::info!(identifier = %identifier, "job paused");
        }
        Ok(rows > 0)
    }

    /// Resume a paused job. Triggers a chunk load so the job is armed
    /// right away if due within the look-ahead window.
    pub async fn resume(&self, identifier: &str) -> Result<bool> {
        self.inner.ensure_init().await?;

        let now = self.inner.config.clock.now_ms();
        let rows = self
            .inner
            .store
            .update_status(identifier, JobStatus::Active, now)
            .await?;

        if rows > 0 {
            maintenance::chunk_load(&self.inner).await?;
            tracing::info!(identifier = %identifier, "job resumed");
        }
        Ok(rows > 0)
    }

    /// Fire a job immediately, outside its schedule. Runs the full
    /// execution pipeline: retries, run accounting, next-run advancement.
    pub async fn trigger(&self, identifier: &str) -> Result<()> {
        self.inner.ensure_init().await?;

        let job = self
            .inner
            .store
            .get_by_identifier(identifier)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job '{identifier}' not found"))?;
        if job.status != JobStatus::Active {
            return Err(anyhow::anyhow!(
                "job '{identifier}' is {} and cannot be triggered",
                job.status
            )
            .into());
        }

        tracing::info!(identifier = %identifier, "job triggered manually");
        self.inner.timers.cancel(identifier).await;
        executor::run_job(Arc::clone(&self.inner), identifier.to_string()).await;
        Ok(())
    }

    pub async fn get(&self, identifier: &str) -> Result<Option<Job>> {
        self.inner.ensure_init().await?;
        self.inner.store.get_by_identifier(identifier).await
    }

    pub async fn job_status(&self, identifier: &str) -> Result<Option<JobStatus>> {
        Ok(self.get(identifier).await?.map(|job| job.status))
    }

    pub async fn job_run_count(&self, identifier: &str) -> Result<Option<i64>> {
        Ok(self.get(identifier).await?.map(|job| job.run_count))
    }

    pub async fn active_jobs_count(&self) -> Result<i64> {
        self.inner.ensure_init().await?;
        self.inner.store.count_active().await
    }

    pub async fn completed_jobs_count(&self) -> Result<i64> {
        self.inner.ensure_init().await?;
        self.inner.store.count_completed().await
    }

    /// Total scheduled firings across all jobs, failed ones included.
    pub async fn total_runs_count(&self) -> Result<i64> {
        self.inner.ensure_init().await?;
        self.inner.store.sum_run_count().await
    }

    /// Active jobs due within the next `window_ms`, earliest first,
    /// capped at the configured chunk size.
    pub async fn jobs_in_window(&self, window_ms: i64) -> Result<Vec<Job>> {
        self.inner.ensure_init().await?;
        let now = self.inner.config.clock.now_ms();
        self.inner
            .store
            .due_in_window(now + window_ms, self.inner.config.chunk_size)
            .await
    }

    /// Number of active jobs due within the next `window_ms`.
    pub async fn due_jobs_count(&self, window_ms: i64) -> Result<i64> {
        self.inner.ensure_init().await?;
        let now = self.inner.config.clock.now_ms();
        self.inner.store.count_active_due_by(now + window_ms).await
    }

    /// List jobs ordered by `next_run`, optionally filtered by status.
    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        self.inner.ensure_init().await?;
        self.inner.store.list(status, limit).await
    }

    pub async fn job_stats(&self) -> Result<JobStats> {
        self.inner.ensure_init().await?;

        let mut stats = JobStats::default();
        for (status, count) in self.inner.store.count_by_status().await? {
            stats.total += count;
            match status {
                JobStatus::Active => stats.active = count,
                JobStatus::Paused => stats.paused = count,
                JobStatus::Cancelled => stats.cancelled = count,
                JobStatus::Completed => stats.completed = count,
            }
        }
        stats.total_runs = self.inner.store.sum_run_count().await?;
        Ok(stats)
    }

    /// Delete completed jobs untouched for more than `days` days.
    pub async fn cleanup_completed_jobs(&self, days: u32) -> Result<u64> {
        self.inner.ensure_init().await?;
        let counts = maintenance::cleanup_pass(&self.inner, days, u32::MAX).await?;
        Ok(counts.completed)
    }

    /// Delete cancelled jobs untouched for more than `days` days.
    pub async fn cleanup_old_jobs(&self, days: u32) -> Result<u64> {
        self.inner.ensure_init().await?;
        let counts = maintenance::cleanup_pass(&self.inner, u32::MAX, days).await?;
        Ok(counts.cancelled)
    }

    /// Delete terminal jobs past their respective retention thresholds.
    pub async fn cleanup_all_old_jobs(
        &self,
        completed_days: u32,
        cancelled_days: u32,
    ) -> Result<CleanupCounts> {
        self.inner.ensure_init().await?;
        maintenance::cleanup_pass(&self.inner, completed_days, cancelled_days).await
    }

    /// Run one cleanup pass with the configured retention thresholds,
    /// exactly as the background cleanup loop would.
    pub async fn run_cleanup(&self) -> Result<CleanupCounts> {
        let cleanup = self.inner.config.cleanup;
        self.cleanup_all_old_jobs(
            cleanup.completed_retention_days,
            cleanup.cancelled_retention_days,
        )
        .await
    }

    /// Start the engine: initialize the store, load the first chunk of
    /// due jobs, and spawn the refresh and cleanup loops. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(error) = self.inner.ensure_init().await {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(error);
        }
        if let Err(error) = maintenance::chunk_load(&self.inner).await {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(error);
        }

        let mut loops = self.inner.loops.lock().await;
        loops.refresh = Some(maintenance::spawn_refresh_loop(Arc::clone(&self.inner)));
        if self.inner.config.cleanup.enabled {
            loops.cleanup = Some(maintenance::spawn_cleanup_loop(Arc::clone(&self.inner)));
        }

        tracing::info!("scheduler started");
        Ok(())
    }

    /// Stop the engine: kill both loops and drop every pending timer.
    /// Handlers already executing run to completion and still record
    /// their firing. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let mut loops = self.inner.loops.lock().await;
        if let Some(handle) = loops.refresh.take() {
            handle.abort();
        }
        if let Some(handle) = loops.cleanup.take() {
            handle.abort();
        }
        drop(loops);

        self.inner.timers.clear().await;
        tracing::info!("scheduler stopped");
    }

    /// Stop the engine, close the store, and forget all handlers.
    pub async fn destroy(&self) {
        self.stop().await;
        self.inner.handlers.write().await.clear();
        self.inner.store.close().await;
        tracing::info!("scheduler destroyed");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}
