//! Five-field cron evaluation.
//!
//! Expressions use the classic five fields (minute, hour, day-of-month,
//! month, day-of-week) and are evaluated in UTC. The underlying `cron`
//! crate works on six/seven-field expressions with a leading seconds
//! field, so a zero seconds field is prefixed before parsing; a schedule
//! therefore fires at second zero of each matching minute.
//!
//! Evaluation is pure. The scheduler calls it twice per recurring job:
//! once at `schedule()` time for validation and the initial fire, and once
//! after every completion for the next one.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::Error;

/// A validated five-field cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    /// Parse and validate a five-field cron expression.
    ///
    /// Fails with [`Error::InvalidCron`] when the expression does not have
    /// exactly five fields or any field is syntactically invalid or out of
    /// range.
    pub fn parse(expression: &str) -> Result<Self, Error> {
        let trimmed = expression.trim();
        if trimmed.split_whitespace().count() != 5 {
            return Err(Error::InvalidCron {
                expression: expression.to_string(),
            });
        }

        let with_seconds = format!("0 {trimmed}");
        let schedule = Schedule::from_str(&with_seconds).map_err(|_| Error::InvalidCron {
            expression: expression.to_string(),
        })?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    /// The smallest instant strictly greater than `after` that satisfies
    /// the expression, in UTC.
    ///
    /// Returns `None` when the schedule has no future fire (possible for
    /// expressions naming impossible dates).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// The validated expression, as supplied (minus surrounding
    /// whitespace).
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_every_minute() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        assert_eq!(schedule.expression(), "* * * * *");
    }

    #[test]
    fn test_parse_rejects_wrong_field_count() {
        assert!(matches!(
            CronSchedule::parse("* * * *"),
            Err(Error::InvalidCron { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("* * * * * *"),
            Err(Error::InvalidCron { .. })
        ));
        assert!(matches!(
            CronSchedule::parse(""),
            Err(Error::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_out_of_range_minute() {
        assert!(matches!(
            CronSchedule::parse("61 * * * *"),
            Err(Error::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            CronSchedule::parse("not a cron at all"),
            Err(Error::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_next_after_is_strictly_greater() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        // Exactly on a fire instant: the next fire must be the following
        // minute, not the reference itself.
        let reference = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let next = schedule.next_after(reference).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 31, 0).unwrap());
    }

    #[test]
    fn test_next_after_specific_time() {
        // 02:15 every day.
        let schedule = CronSchedule::parse("15 2 * * *").unwrap();
        let reference = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();
        let next = schedule.next_after(reference).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 2, 15, 0).unwrap());
    }

    #[test]
    fn test_next_after_mid_minute_rounds_up() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let reference = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 29).unwrap();
        let next = schedule.next_after(reference).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 31, 0).unwrap());
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let schedule = CronSchedule::parse("  0 9 * * 1-5  ").unwrap();
        assert_eq!(schedule.expression(), "0 9 * * 1-5");
    }
}
