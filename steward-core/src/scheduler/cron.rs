//! Cron expression handling.

use chrono::{DateTime, Utc};
use ::cron::Schedule;
use std::str::FromStr;

use super::SchedulerError;

/// Parsed recurrence expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    /// Expression as written by the caller.
    source: String,
    /// Six or seven field form understood by the `cron` crate.
    normalized: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, SchedulerError> {
        let normalized = normalize_expression(expression)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidSchedule {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source: expression.trim().to_string(),
            normalized,
            schedule,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Next firing strictly after `from`.
    pub fn next_after(&self, from: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(from).next()
    }

    /// The hour field, when it names exactly one hour.
    pub fn fixed_hour(&self) -> Option<u32> {
        self.normalized
            .split_whitespace()
            .nth(2)
            .and_then(|h| h.parse::<u32>().ok())
            .filter(|h| *h < 24)
    }

    /// Copy of this schedule firing at `hour` instead of its fixed hour.
    ///
    /// Returns `None` when the hour field is not a single number.
    pub fn with_hour(&self, hour: u32) -> Option<Self> {
        self.fixed_hour()?;
        let fields: Vec<String> = self
            .normalized
            .split_whitespace()
            .enumerate()
            .map(|(i, f)| if i == 2 { hour.to_string() } else { f.to_string() })
            .collect();
        Self::parse(&fields.join(" ")).ok()
    }
}

/// Normalize a cron expression to the 6-field form (seconds first).
///
/// Five-field crontab expressions get a `0` seconds field; six and seven
/// field expressions are kept as-is.
pub fn normalize_expression(expression: &str) -> Result<String, SchedulerError> {
    let expression = expression.trim();
    let field_count = expression.split_whitespace().count();

    match field_count {
        // Standard crontab syntax: minute hour day month weekday
        5 => Ok(format!("0 {}", expression.split_whitespace().collect::<Vec<_>>().join(" "))),
        // Crate-native syntax includes seconds (+ optional year)
        6 | 7 => Ok(expression.split_whitespace().collect::<Vec<_>>().join(" ")),
        _ => Err(SchedulerError::InvalidSchedule {
            expression: expression.to_string(),
            reason: format!("expected 5, 6, or 7 fields, got {field_count}"),
        }),
    }
}
