//! Schedule-input parsing and next-run computation.
//!
//! The public input is a tagged variant: a cron expression, an absolute
//! instant in milliseconds, or a chrono date-time. It is normalized
//! immediately to the internal `(cron_expression | specific_time, next_run)`
//! pair, failing fast before anything is persisted.

use crate::error::ScheduleError;
use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use std::str::FromStr;

/// What to run a job on: a recurring cron cadence or a one-shot instant.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleInput {
    /// Recurring cron expression, standard 5- or 6-field form.
    Cron(String),
    /// One-shot absolute instant, milliseconds since the Unix epoch.
    At(i64),
    /// One-shot absolute instant as a chrono date-time.
    AtDateTime(DateTime<Utc>),
}

impl From<&str> for ScheduleInput {
    fn from(expression: &str) -> Self {
        ScheduleInput::Cron(expression.to_string())
    }
}

impl From<String> for ScheduleInput {
    fn from(expression: String) -> Self {
        ScheduleInput::Cron(expression)
    }
}

impl From<i64> for ScheduleInput {
    fn from(timestamp_ms: i64) -> Self {
        ScheduleInput::At(timestamp_ms)
    }
}

impl From<DateTime<Utc>> for ScheduleInput {
    fn from(instant: DateTime<Utc>) -> Self {
        ScheduleInput::AtDateTime(instant)
    }
}

/// Normalized scheduling state, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParsedSchedule {
    pub cron_expression: Option<String>,
    pub specific_time: Option<i64>,
    pub next_run: i64,
}

/// Parse a schedule input against the current instant.
///
/// Exactly one of `cron_expression` and `specific_time` is set in the
/// result. One-shot instants must lie strictly in the future.
pub(crate) fn parse_schedule(
    input: &ScheduleInput,
    now_ms: i64,
) -> Result<ParsedSchedule, ScheduleError> {
    match input {
        ScheduleInput::Cron(expression) => {
            let next_run = next_cron_run(expression, now_ms)?;
            Ok(ParsedSchedule {
                cron_expression: Some(expression.clone()),
                specific_time: None,
                next_run,
            })
        }
        ScheduleInput::At(timestamp_ms) => parse_one_shot(*timestamp_ms, now_ms),
        ScheduleInput::AtDateTime(instant) => parse_one_shot(instant.timestamp_millis(), now_ms),
    }
}

fn parse_one_shot(specific_time: i64, now_ms: i64) -> Result<ParsedSchedule, ScheduleError> {
    if specific_time <= now_ms {
        return Err(ScheduleError::TimeInPast {
            specific_time,
            now: now_ms,
        });
    }
    Ok(ParsedSchedule {
        cron_expression: None,
        specific_time: Some(specific_time),
        next_run: specific_time,
    })
}

/// Compute the next firing instant strictly after `after_ms`.
///
/// Standard 5-field expressions get a seconds field of `0` prepended; the
/// parser itself accepts 6- and 7-field forms. Ranges, lists, steps, and
/// weekday syntax pass through unchanged.
pub(crate) fn next_cron_run(expression: &str, after_ms: i64) -> Result<i64, ScheduleError> {
    let schedule = parse_cron(expression)?;
    let anchor = timestamp_from_ms(expression, after_ms)?;

    schedule
        .after(&anchor)
        .next()
        .map(|instant| instant.timestamp_millis())
        .ok_or_else(|| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            message: "no upcoming firing time".to_string(),
        })
}

fn parse_cron(expression: &str) -> Result<Schedule, ScheduleError> {
    let normalized = normalize_cron(expression);
    Schedule::from_str(&normalized).map_err(|error| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        message: error.to_string(),
    })
}

/// The cron crate wants a seconds field; prepend `0` to 5-field input so
/// standard crontab expressions fire at the top of the minute.
fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

fn timestamp_from_ms(expression: &str, ms: i64) -> Result<DateTime<Utc>, ScheduleError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            message: format!("anchor instant {ms} is out of range"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000; // 2023-11-14T22:13:20Z

    #[test]
    fn five_field_expression_gets_zero_seconds() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("  0 9 * * 1-5  "), "0 0 9 * * 1-5");
    }

    #[test]
    fn six_field_expression_passes_through() {
        assert_eq!(normalize_cron("*/1 * * * * *"), "*/1 * * * * *");
    }

    #[test]
    fn next_run_is_strictly_after_anchor() {
        // Every second: the next firing is the following whole second.
        let next = next_cron_run("*/1 * * * * *", NOW).expect("expression should parse");
        assert!(next > NOW);
        assert!(next <= NOW + 1_000);
        assert_eq!(next % 1_000, 0);
    }

    #[test]
    fn five_field_expression_fires_on_the_minute() {
        let next = next_cron_run("*/5 * * * *", NOW).expect("expression should parse");
        assert!(next > NOW);
        assert_eq!(next % 60_000, 0);
        assert_eq!((next / 60_000) % 5, 0);
    }

    #[test]
    fn invalid_cron_is_rejected() {
        let error = parse_schedule(&ScheduleInput::Cron("not a cron".into()), NOW)
            .expect_err("garbage must not parse");
        assert!(matches!(error, ScheduleError::InvalidCron { .. }));
    }

    #[test]
    fn cron_input_sets_expression_only() {
        let parsed =
            parse_schedule(&ScheduleInput::Cron("0 0 * * *".into()), NOW).expect("should parse");
        assert_eq!(parsed.cron_expression.as_deref(), Some("0 0 * * *"));
        assert_eq!(parsed.specific_time, None);
        assert!(parsed.next_run > NOW);
    }

    #[test]
    fn future_timestamp_sets_specific_time_only() {
        let parsed = parse_schedule(&ScheduleInput::At(NOW + 5_000), NOW).expect("should parse");
        assert_eq!(parsed.cron_expression, None);
        assert_eq!(parsed.specific_time, Some(NOW + 5_000));
        assert_eq!(parsed.next_run, NOW + 5_000);
    }

    #[test]
    fn past_and_present_timestamps_are_rejected() {
        for timestamp in [NOW - 1, NOW] {
            let error = parse_schedule(&ScheduleInput::At(timestamp), NOW)
                .expect_err("past instants must be rejected");
            assert!(matches!(error, ScheduleError::TimeInPast { .. }));
        }
    }

    #[test]
    fn date_time_input_converts_to_millis() {
        let instant = Utc.timestamp_millis_opt(NOW + 60_000).unwrap();
        let parsed =
            parse_schedule(&ScheduleInput::AtDateTime(instant), NOW).expect("should parse");
        assert_eq!(parsed.specific_time, Some(NOW + 60_000));
    }
}
