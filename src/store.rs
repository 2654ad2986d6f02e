//! Durable job storage (SQLite).

use crate::error::{Result, StoreError};
use crate::job::{Job, JobStatus, transition_sources};
use anyhow::Context as _;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, SqlitePool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Job store for durable scheduling state.
///
/// Every operation other than [`JobStore::init`] fails with
/// [`StoreError::NotInitialized`] until the schema has been created.
#[derive(Debug)]
pub struct JobStore {
    pool: SqlitePool,
    initialized: AtomicBool,
}

impl JobStore {
    /// Wrap an existing pool. The schema is not created until `init`.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            initialized: AtomicBool::new(false),
        }
    }

    /// Open the database at `db`, creating the file if missing.
    ///
    /// File-backed stores run in WAL mode so stats and window queries do
    /// not block execution-path updates. `":memory:"` opens a private
    /// in-memory database on a single connection.
    pub async fn connect(db: &str) -> Result<Self> {
        let in_memory = db == ":memory:" || db == "sqlite::memory:";

        let options = if in_memory {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            SqliteConnectOptions::new()
                .filename(db)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5))
        };

        // A pooled in-memory database would give each connection its own
        // empty store, so pin it to one connection.
        let max_connections = if in_memory { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(StoreError::Connect)?;

        Ok(Self::new(pool))
    }

    /// Create the job table and indexes if they don't exist. Idempotent.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cron_jobs (
                id TEXT PRIMARY KEY,
                cron_expression TEXT,
                specific_time INTEGER,
                identifier TEXT UNIQUE NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('active', 'paused', 'cancelled', 'completed')),
                next_run INTEGER NOT NULL,
                last_run INTEGER,
                run_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                CHECK ((cron_expression IS NULL) != (specific_time IS NULL))
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create cron_jobs table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cron_jobs_status_next_run ON cron_jobs(status, next_run)",
        )
        .execute(&self.pool)
        .await
        .context("failed to create status/next_run index")?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_cron_jobs_identifier ON cron_jobs(identifier)",
        )
        .execute(&self.pool)
        .await
        .context("failed to create identifier index")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cron_jobs_run_count ON cron_jobs(run_count)")
            .execute(&self.pool)
            .await
            .context("failed to create run_count index")?;

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn guard(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(StoreError::NotInitialized.into())
        }
    }

    /// Insert a job, replacing any existing record under the same
    /// identifier. Replacement resets the whole record, including `id`
    /// and `run_count`.
    pub async fn upsert(&self, job: &Job) -> Result<()> {
        self.guard()?;

        sqlx::query(
            r#"
            INSERT INTO cron_jobs (
                id, cron_expression, specific_time, identifier, status,
                next_run, last_run, run_count, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(identifier) DO UPDATE SET
                id = excluded.id,
                cron_expression = excluded.cron_expression,
                specific_time = excluded.specific_time,
                status = excluded.status,
                next_run = excluded.next_run,
                last_run = excluded.last_run,
                run_count = excluded.run_count,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&job.id)
        .bind(&job.cron_expression)
        .bind(job.specific_time)
        .bind(&job.identifier)
        .bind(job.status.as_str())
        .bind(job.next_run)
        .bind(job.last_run)
        .bind(job.run_count)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert job {}", job.identifier))?;

        Ok(())
    }

    /// Move a job into `status`, gated on the lifecycle's legal source
    /// states. Returns rows affected; 0 means the job was absent or not
    /// in a state the transition is allowed from.
    pub async fn update_status(
        &self,
        identifier: &str,
        status: JobStatus,
        updated_at: i64,
    ) -> Result<u64> {
        self.guard()?;

        let sources = transition_sources(status);
        let placeholders = vec!["?"; sources.len()].join(", ");
        let query = format!(
            "UPDATE cron_jobs SET status = ?, updated_at = ? WHERE identifier = ? AND status IN ({placeholders})",
        );

        let mut sql = sqlx::query(&query)
            .bind(status.as_str())
            .bind(updated_at)
            .bind(identifier);
        for source in sources {
            sql = sql.bind(source.as_str());
        }

        let result = sql
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to update status of job {identifier}"))?;

        Ok(result.rows_affected())
    }

    /// Record the outcome of one firing, gated on the job still being
    /// active. The run counter is incremented in-statement so a firing is
    /// counted exactly once. Returns rows affected; 0 means the job was
    /// paused or cancelled while its handler was executing.
    pub async fn apply_post_execution(
        &self,
        identifier: &str,
        last_run: i64,
        next_run: i64,
        status: JobStatus,
        updated_at: i64,
    ) -> Result<u64> {
        self.guard()?;

        let result = sqlx::query(
            r#"
            UPDATE cron_jobs
            SET last_run = ?, next_run = ?, run_count = run_count + 1,
                status = ?, updated_at = ?
            WHERE identifier = ? AND status = 'active'
            "#,
        )
        .bind(last_run)
        .bind(next_run)
        .bind(status.as_str())
        .bind(updated_at)
        .bind(identifier)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to apply post-execution update for job {identifier}"))?;

        Ok(result.rows_affected())
    }

    pub async fn get_by_identifier(&self, identifier: &str) -> Result<Option<Job>> {
        self.guard()?;

        let row = sqlx::query(
            r#"
            SELECT id, cron_expression, specific_time, identifier, status,
                   next_run, last_run, run_count, created_at, updated_at
            FROM cron_jobs
            WHERE identifier = ?
            "#,
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to fetch job {identifier}"))?;

        row.map(|row| row_to_job(&row)).transpose()
    }

    /// Active jobs due up to `window_end`, earliest first, capped at
    /// `limit`. Overdue jobs (next_run already in the past) are included
    /// so they fire promptly after a restart.
    pub async fn due_in_window(&self, window_end: i64, limit: i64) -> Result<Vec<Job>> {
        self.guard()?;

        let rows = sqlx::query(
            r#"
            SELECT id, cron_expression, specific_time, identifier, status,
                   next_run, last_run, run_count, created_at, updated_at
            FROM cron_jobs
            WHERE status = 'active' AND next_run <= ?
            ORDER BY next_run ASC
            LIMIT ?
            "#,
        )
        .bind(window_end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to query jobs due in window")?;

        rows.iter().map(row_to_job).collect()
    }

    /// List jobs ordered by `next_run`, optionally filtered by status.
    pub async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        self.guard()?;

        let mut query = String::from(
            "SELECT id, cron_expression, specific_time, identifier, status, \
             next_run, last_run, run_count, created_at, updated_at FROM cron_jobs",
        );
        if status.is_some() {
            query.push_str(" WHERE status = ?");
        }
        query.push_str(" ORDER BY next_run ASC LIMIT ?");

        let mut sql = sqlx::query(&query);
        if let Some(status) = status {
            sql = sql.bind(status.as_str());
        }
        sql = sql.bind(limit);

        let rows = sql
            .fetch_all(&self.pool)
            .await
            .context("failed to list jobs")?;

        rows.iter().map(row_to_job).collect()
    }

    pub async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>> {
        self.guard()?;

        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM cron_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .context("failed to count jobs by status")?;

        rows.into_iter()
            .map(|row| {
                let status_value: String =
                    row.try_get("status").context("failed to read status")?;
                let status = JobStatus::parse(&status_value).with_context(|| {
                    format!("invalid job status in database: {status_value}")
                })?;
                let count: i64 = row.try_get("count").context("failed to read count")?;
                Ok((status, count))
            })
            .collect()
    }

    pub async fn count_active(&self) -> Result<i64> {
        self.count_with_status(JobStatus::Active).await
    }

    pub async fn count_completed(&self) -> Result<i64> {
        self.count_with_status(JobStatus::Completed).await
    }

    async fn count_with_status(&self, status: JobStatus) -> Result<i64> {
        self.guard()?;

        sqlx::query_scalar("SELECT COUNT(*) FROM cron_jobs WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to count {status} jobs"))
            .map_err(Into::into)
    }

    /// Total scheduled firings across all jobs.
    pub async fn sum_run_count(&self) -> Result<i64> {
        self.guard()?;

        sqlx::query_scalar("SELECT COALESCE(SUM(run_count), 0) FROM cron_jobs")
            .fetch_one(&self.pool)
            .await
            .context("failed to sum run counts")
            .map_err(Into::into)
    }

    pub async fn count_active_due_by(&self, window_end: i64) -> Result<i64> {
        self.guard()?;

        sqlx::query_scalar("SELECT COUNT(*) FROM cron_jobs WHERE status = 'active' AND next_run <= ?")
            .bind(window_end)
            .fetch_one(&self.pool)
            .await
            .context("failed to count active jobs due in window")
            .map_err(Into::into)
    }

    /// Delete jobs in a terminal status last touched before the cutoff.
    /// Returns the number of rows removed.
    pub async fn delete_terminal(&self, status: JobStatus, updated_at_cutoff: i64) -> Result<u64> {
        self.guard()?;

        let result = sqlx::query("DELETE FROM cron_jobs WHERE status = ? AND updated_at < ?")
            .bind(status.as_str())
            .bind(updated_at_cutoff)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete {status} jobs"))?;

        Ok(result.rows_affected())
    }

    /// Close the underlying pool. Further operations fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let status_value: String = row.try_get("status").context("failed to read job status")?;
    let status = JobStatus::parse(&status_value)
        .with_context(|| format!("invalid job status in database: {status_value}"))?;

    Ok(Job {
        id: row.try_get("id").context("failed to read job id")?,
        identifier: row
            .try_get("identifier")
            .context("failed to read job identifier")?,
        cron_expression: row.try_get("cron_expression").ok().flatten(),
        specific_time: row.try_get("specific_time").ok().flatten(),
        status,
        next_run: row
            .try_get("next_run")
            .context("failed to read job next_run")?,
        last_run: row.try_get("last_run").ok().flatten(),
        run_count: row
            .try_get("run_count")
            .context("failed to read job run_count")?,
        created_at: row
            .try_get("created_at")
            .context("failed to read job created_at")?,
        updated_at: row
            .try_get("updated_at")
            .context("failed to read job updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    const NOW: i64 = 1_700_000_000_000;

    async fn setup_store() -> JobStore {
        let store = JobStore::connect(":memory:")
            .await
            .expect("in-memory sqlite should connect");
        store.init().await.expect("schema should be created");
        store
    }

    fn one_shot(identifier: &str, next_run: i64) -> Job {
        Job {
            id: uuid::Uuid::new_v4().to_string(),
            identifier: identifier.to_string(),
            cron_expression: None,
            specific_time: Some(next_run),
            status: JobStatus::Active,
            next_run,
            last_run: None,
            run_count: 0,
            created_at: NOW,
            updated_at: NOW,
        }
    }

    fn recurring(identifier: &str, next_run: i64) -> Job {
        Job {
            cron_expression: Some("*/1 * * * * *".to_string()),
            specific_time: None,
            ..one_shot(identifier, next_run)
        }
    }

    #[tokio::test]
    async fn operations_fail_before_init() {
        let store = JobStore::connect(":memory:")
            .await
            .expect("in-memory sqlite should connect");

        let error = store
            .get_by_identifier("anything")
            .await
            .expect_err("uninitialized store must refuse reads");
        assert!(matches!(error, Error::Store(StoreError::NotInitialized)));

        let error = store
            .upsert(&one_shot("anything", NOW + 1_000))
            .await
            .expect_err("uninitialized store must refuse writes");
        assert!(matches!(error, Error::Store(StoreError::NotInitialized)));
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let store = setup_store().await;
        store.init().await.expect("second init should be a no-op");
        assert!(store.is_initialized());
    }

    #[tokio::test]
    async fn exclusivity_check_rejects_malformed_rows() {
        let store = setup_store().await;

        // Both kinds set.
        let mut bad = recurring("bad-both", NOW + 1_000);
        bad.specific_time = Some(NOW + 1_000);
        assert!(store.upsert(&bad).await.is_err());

        // Neither kind set.
        let mut bad = one_shot("bad-neither", NOW + 1_000);
        bad.specific_time = None;
        assert!(store.upsert(&bad).await.is_err());
    }

    #[tokio::test]
    async fn upsert_replaces_by_identifier() {
        let store = setup_store().await;

        let mut first = recurring("job", NOW + 1_000);
        first.run_count = 7;
        first.last_run = Some(NOW - 500);
        store.upsert(&first).await.expect("first upsert");

        let replacement = one_shot("job", NOW + 9_000);
        store.upsert(&replacement).await.expect("second upsert");

        let job = store
            .get_by_identifier("job")
            .await
            .expect("fetch")
            .expect("job should exist");
        assert_eq!(job.id, replacement.id);
        assert_eq!(job.cron_expression, None);
        assert_eq!(job.specific_time, Some(NOW + 9_000));
        assert_eq!(job.run_count, 0);
        assert_eq!(job.last_run, None);
    }

    #[tokio::test]
    async fn update_status_respects_lifecycle() {
        let store = setup_store().await;
        store.upsert(&recurring("job", NOW + 1_000)).await.expect("upsert");

        // active -> paused
        assert_eq!(
            store
                .update_status("job", JobStatus::Paused, NOW + 1)
                .await
                .expect("pause"),
            1
        );
        // pausing again changes nothing
        assert_eq!(
            store
                .update_status("job", JobStatus::Paused, NOW + 2)
                .await
                .expect("re-pause"),
            0
        );
        // paused -> active
        assert_eq!(
            store
                .update_status("job", JobStatus::Active, NOW + 3)
                .await
                .expect("resume"),
            1
        );
        // active -> cancelled
        assert_eq!(
            store
                .update_status("job", JobStatus::Cancelled, NOW + 4)
                .await
                .expect("cancel"),
            1
        );
        // cancelled is terminal
        assert_eq!(
            store
                .update_status("job", JobStatus::Active, NOW + 5)
                .await
                .expect("resume after cancel"),
            0
        );
        // missing identifier affects no rows
        assert_eq!(
            store
                .update_status("missing", JobStatus::Cancelled, NOW + 6)
                .await
                .expect("cancel missing"),
            0
        );
    }

    #[tokio::test]
    async fn post_execution_is_gated_on_active() {
        let store = setup_store().await;
        store.upsert(&recurring("job", NOW + 1_000)).await.expect("upsert");

        let rows = store
            .apply_post_execution("job", NOW + 1_000, NOW + 2_000, JobStatus::Active, NOW + 1_000)
            .await
            .expect("post-execution update");
        assert_eq!(rows, 1);

        let job = store
            .get_by_identifier("job")
            .await
            .expect("fetch")
            .expect("job should exist");
        assert_eq!(job.run_count, 1);
        assert_eq!(job.last_run, Some(NOW + 1_000));
        assert_eq!(job.next_run, NOW + 2_000);

        // Pause, then the gated update must not touch the record.
        store
            .update_status("job", JobStatus::Paused, NOW + 2_000)
            .await
            .expect("pause");
        let rows = store
            .apply_post_execution("job", NOW + 3_000, NOW + 4_000, JobStatus::Active, NOW + 3_000)
            .await
            .expect("gated update");
        assert_eq!(rows, 0);

        let job = store
            .get_by_identifier("job")
            .await
            .expect("fetch")
            .expect("job should exist");
        assert_eq!(job.status, JobStatus::Paused);
        assert_eq!(job.run_count, 1);
        assert_eq!(job.next_run, NOW + 2_000);
    }

    #[tokio::test]
    async fn due_in_window_orders_limits_and_includes_overdue() {
        let store = setup_store().await;

        store.upsert(&one_shot("overdue", NOW - 5_000)).await.expect("upsert");
        store.upsert(&one_shot("soon", NOW + 1_000)).await.expect("upsert");
        store.upsert(&one_shot("later", NOW + 2_000)).await.expect("upsert");
        store.upsert(&one_shot("beyond", NOW + 100_000)).await.expect("upsert");

        let mut paused = one_shot("paused", NOW + 500);
        paused.status = JobStatus::Paused;
        store.upsert(&paused).await.expect("upsert");

        let due = store
            .due_in_window(NOW + 10_000, 10)
            .await
            .expect("window query");
        let identifiers: Vec<&str> = due.iter().map(|job| job.identifier.as_str()).collect();
        assert_eq!(identifiers, ["overdue", "soon", "later"]);

        let due = store
            .due_in_window(NOW + 10_000, 2)
            .await
            .expect("limited window query");
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].identifier, "overdue");
    }

    #[tokio::test]
    async fn aggregates_count_what_they_claim() {
        let store = setup_store().await;

        store.upsert(&one_shot("a1", NOW + 1_000)).await.expect("upsert");
        store.upsert(&one_shot("a2", NOW + 50_000)).await.expect("upsert");

        let mut done = one_shot("done", NOW - 1_000);
        done.status = JobStatus::Completed;
        done.run_count = 3;
        store.upsert(&done).await.expect("upsert");

        let mut gone = one_shot("gone", NOW + 1_000);
        gone.status = JobStatus::Cancelled;
        gone.run_count = 2;
        store.upsert(&gone).await.expect("upsert");

        assert_eq!(store.count_active().await.expect("count"), 2);
        assert_eq!(store.count_completed().await.expect("count"), 1);
        assert_eq!(store.sum_run_count().await.expect("sum"), 5);
        assert_eq!(
            store.count_active_due_by(NOW + 10_000).await.expect("count"),
            1
        );

        let counts = store.count_by_status().await.expect("count by status");
        let find = |status: JobStatus| {
            counts
                .iter()
                .find(|(s, _)| *s == status)
                .map(|(_, n)| *n)
                .unwrap_or(0)
        };
        assert_eq!(find(JobStatus::Active), 2);
        assert_eq!(find(JobStatus::Completed), 1);
        assert_eq!(find(JobStatus::Cancelled), 1);
        assert_eq!(find(JobStatus::Paused), 0);
    }

    #[tokio::test]
    async fn delete_terminal_honors_status_and_cutoff() {
        let store = setup_store().await;

        let mut old_completed = one_shot("old-completed", NOW - 10_000);
        old_completed.status = JobStatus::Completed;
        old_completed.updated_at = NOW - 10_000;
        store.upsert(&old_completed).await.expect("upsert");

        let mut fresh_completed = one_shot("fresh-completed", NOW - 1_000);
        fresh_completed.status = JobStatus::Completed;
        fresh_completed.updated_at = NOW - 1_000;
        store.upsert(&fresh_completed).await.expect("upsert");

        let mut old_cancelled = one_shot("old-cancelled", NOW - 10_000);
        old_cancelled.status = JobStatus::Cancelled;
        old_cancelled.updated_at = NOW - 10_000;
        store.upsert(&old_cancelled).await.expect("upsert");

        let deleted = store
            .delete_terminal(JobStatus::Completed, NOW - 5_000)
            .await
            .expect("delete");
        assert_eq!(deleted, 1);

        assert!(
            store
                .get_by_identifier("old-completed")
                .await
                .expect("fetch")
                .is_none()
        );
        assert!(
            store
                .get_by_identifier("fresh-completed")
                .await
                .expect("fetch")
                .is_some()
        );
        assert!(
            store
                .get_by_identifier("old-cancelled")
                .await
                .expect("fetch")
                .is_some()
        );
    }
}
