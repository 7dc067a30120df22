//! Five-field cron schedules.
//!
//! Each field is either `*` or a bare non-negative integer in range. Ranges,
//! steps and lists are not supported.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use thiserror::Error;

/// Cron fields in expression order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    Weekday,
}

impl CronField {
    const ORDER: [CronField; 5] = [
        CronField::Minute,
        CronField::Hour,
        CronField::DayOfMonth,
        CronField::Month,
        CronField::Weekday,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CronField::Minute => "minute",
            CronField::Hour => "hour",
            CronField::DayOfMonth => "day_of_month",
            CronField::Month => "month",
            CronField::Weekday => "weekday",
        }
    }

    /// Inclusive valid range (weekday 0 = Sunday)
    pub fn range(&self) -> (u32, u32) {
        match self {
            CronField::Minute => (0, 59),
            CronField::Hour => (0, 23),
            CronField::DayOfMonth => (1, 31),
            CronField::Month => (1, 12),
            CronField::Weekday => (0, 6),
        }
    }

    fn value_at(&self, at: &DateTime<Utc>) -> u32 {
        match self {
            CronField::Minute => at.minute(),
            CronField::Hour => at.hour(),
            CronField::DayOfMonth => at.day(),
            CronField::Month => at.month(),
            CronField::Weekday => at.weekday().num_days_from_sunday(),
        }
    }
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cron parse errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("Cron field has unsupported syntax: {0}")]
    InvalidSyntax(String),

    #[error("Cron expression needs 5 fields, found {0}")]
    FieldCount(usize),

    #[error("Cron {field} value {value} out of range")]
    OutOfRange { field: CronField, value: String },
}

impl CronError {
    pub fn code(&self) -> String {
        match self {
            CronError::InvalidSyntax(_) => "cron_invalid_syntax".to_string(),
            CronError::FieldCount(_) => "cron_field_count".to_string(),
            CronError::OutOfRange { field, .. } => format!("cron_out_of_range_{}", field.name()),
        }
    }
}

/// A parsed schedule; `None` is a wildcard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronSchedule {
    fields: [Option<u32>; 5],
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let tokens: Vec<&str> = expression.split_whitespace().collect();

        // Syntax errors take precedence over the field count so `*/5` in a
        // short expression still reports the real problem.
        if let Some(bad) = tokens
            .iter()
            .find(|t| **t != "*" && !t.chars().all(|c| c.is_ascii_digit()))
        {
            return Err(CronError::InvalidSyntax((*bad).to_string()));
        }
        if tokens.len() != 5 {
            return Err(CronError::FieldCount(tokens.len()));
        }

        let mut fields = [None; 5];
        for (slot, (field, token)) in fields.iter_mut().zip(CronField::ORDER.iter().zip(tokens)) {
            if token == "*" {
                continue;
            }
            let (min, max) = field.range();
            let value = token
                .parse::<u32>()
                .ok()
                .filter(|v| (min..=max).contains(v))
                .ok_or_else(|| CronError::OutOfRange {
                    field: *field,
                    value: token.to_string(),
                })?;
            *slot = Some(value);
        }

        Ok(Self { fields })
    }

    /// Whether the schedule fires in the minute containing `at`.
    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        let at = truncate_to_minute(&at.with_timezone(&Utc));
        self.fields
            .iter()
            .zip(CronField::ORDER.iter())
            .all(|(expected, field)| expected.map_or(true, |v| v == field.value_at(&at)))
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Drop seconds and sub-seconds.
pub fn truncate_to_minute(at: &DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(*at)
}

/// Stable per-minute reference (`YYYYMMDDHHMM`, UTC)
pub fn minute_ref<Tz: TimeZone>(at: &DateTime<Tz>) -> String {
    at.with_timezone(&Utc).format("%Y%m%d%H%M").to_string()
}
