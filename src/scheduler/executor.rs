//! Per-firing execution pipeline: retries, gated state update, re-arm.

use crate::config::RetryConfig;
use crate::job::JobStatus;
use crate::schedule::next_cron_run;
use crate::scheduler::SchedulerInner;
use std::sync::Arc;
use std::time::Duration;

/// Execute one firing of `identifier`.
///
/// The handler runs through the retry loop first; whatever the outcome,
/// the firing then advances the job's durable state (`last_run`,
/// `next_run`, `run_count`) as long as the job is still active. A final
/// handler failure therefore never stalls a recurring schedule. The
/// update is gated on `status = 'active'` so a pause or cancel issued
/// while the handler was running wins over the firing.
pub(crate) async fn run_job(inner: Arc<SchedulerInner>, identifier: String) {
    let handler = inner.handlers.read().await.get(&identifier).cloned();
    let Some(handler) = handler else {
        tracing::warn!(
            identifier = %identifier,
            "timer fired for a job with no registered handler, skipping"
        );
        return;
    };

    let retry = inner.config.retry;
    let max_attempts = retry.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        match handler().await {
            Ok(()) => {
                last_error = None;
                break;
            }
            Err(error) => {
                tracing::warn!(
                    identifier = %identifier,
                    attempt,
                    max_attempts,
                    %error,
                    "handler attempt failed"
                );
                let final_attempt = attempt == max_attempts;
                last_error = Some(error);
                if final_attempt {
                    break;
                }
                tokio::time::sleep(backoff_delay(&retry, attempt)).await;
            }
        }
    }

    if let Some(error) = &last_error {
        match &inner.config.on_error {
            Some(callback) => callback(&identifier, error),
            None => tracing::error!(
                identifier = %identifier,
                %error,
                "handler failed after {max_attempts} attempts"
            ),
        }
    }

    let now = inner.config.clock.now_ms();
    let record = match inner.store.get_by_identifier(&identifier).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            tracing::warn!(
                identifier = %identifier,
                "fired job has no stored record, skipping update"
            );
            return;
        }
        Err(error) => {
            tracing::error!(
                identifier = %identifier,
                %error,
                "failed to read job record after firing"
            );
            return;
        }
    };

    if record.status != JobStatus::Active {
        tracing::debug!(
            identifier = %identifier,
            status = %record.status,
            "job left the active state during execution, skipping update"
        );
        return;
    }

    let (next_run, status) = if let Some(expression) = &record.cron_expression {
        match next_cron_run(expression, now) {
            Ok(next_run) => (next_run, JobStatus::Active),
            Err(error) => {
                tracing::error!(
                    identifier = %identifier,
                    %error,
                    "stored cron expression no longer parses, skipping update"
                );
                return;
            }
        }
    } else {
        // One-shot: keep the scheduled instant for audit, no re-arm.
        (
            record.specific_time.unwrap_or(record.next_run),
            JobStatus::Completed,
        )
    };

    let rows = match inner
        .store
        .apply_post_execution(&identifier, now, next_run, status, now)
        .await
    {
        Ok(rows) => rows,
        Err(error) => {
            tracing::error!(identifier = %identifier, %error, "failed to record firing");
            return;
        }
    };

    if rows == 0 {
        tracing::debug!(
            identifier = %identifier,
            "job was paused or cancelled mid-execution, not re-arming"
        );
        return;
    }

    if status == JobStatus::Active && next_run <= now + inner.config.look_ahead_window_ms {
        inner.arm_timer(&identifier, next_run).await;
    }

    tracing::debug!(identifier = %identifier, next_run, %status, "firing recorded");
}

fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let shift = (attempt - 1).min(63);
    let exponential = retry.base_delay_ms.saturating_mul(1u64 << shift);
    Duration::from_millis(exponential.min(retry.max_delay_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let retry = RetryConfig {
            max_attempts: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        };
        assert_eq!(backoff_delay(&retry, 1), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(&retry, 2), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(&retry, 3), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(&retry, 6), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(&retry, 10), Duration::from_millis(30_000));
    }

    #[test]
    fn backoff_survives_extreme_attempt_counts() {
        let retry = RetryConfig {
            max_attempts: u32::MAX,
            base_delay_ms: u64::MAX,
            max_delay_ms: 5_000,
        };
        assert_eq!(backoff_delay(&retry, 200), Duration::from_millis(5_000));
    }
}
