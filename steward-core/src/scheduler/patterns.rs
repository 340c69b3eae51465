//! Execution pattern analysis used to retune intelligent tasks.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Minimum samples before an hour can be called optimal.
const MIN_SAMPLES: u64 = 3;
/// Success rate (percent) an hour needs to be optimal.
const OPTIMAL_SUCCESS_RATE: f64 = 80.0;
/// Number of busiest hours reported as peaks.
const PEAK_HOURS: usize = 3;

/// One completed task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionRecord {
    pub task_id: String,
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HourlyStats {
    pub hour: u32,
    pub executions: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub average_duration_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulePatterns {
    pub generated_at: Option<DateTime<Utc>>,
    pub sample_size: usize,
    /// Hours (UTC) that saw at least one run, ascending.
    pub hourly: Vec<HourlyStats>,
    /// Reliable hours, best first.
    pub optimal_hours: Vec<u32>,
    /// Busiest hours, busiest first.
    pub peak_hours: Vec<u32>,
    /// Task id -> success rate (percent).
    pub task_success: HashMap<String, f64>,
}

impl SchedulePatterns {
    pub fn from_history(records: &[TaskExecutionRecord], now: DateTime<Utc>) -> Self {
        let mut by_hour: HashMap<u32, (u64, u64, u64)> = HashMap::new();
        let mut by_task: HashMap<&str, (u64, u64)> = HashMap::new();

        for record in records {
            let entry = by_hour.entry(record.started_at.hour()).or_default();
            entry.0 += 1;
            entry.1 += u64::from(record.success);
            entry.2 += record.duration_ms;

            let task = by_task.entry(record.task_id.as_str()).or_default();
            task.0 += 1;
            task.1 += u64::from(record.success);
        }

        let mut hourly: Vec<HourlyStats> = by_hour
            .into_iter()
            .map(|(hour, (executions, successes, total_ms))| HourlyStats {
                hour,
                executions,
                successes,
                success_rate: successes as f64 / executions as f64 * 100.0,
                average_duration_ms: total_ms as f64 / executions as f64,
            })
            .collect();
        hourly.sort_by_key(|h| h.hour);

        let mut optimal: Vec<&HourlyStats> = hourly
            .iter()
            .filter(|h| h.executions >= MIN_SAMPLES && h.success_rate >= OPTIMAL_SUCCESS_RATE)
            .collect();
        optimal.sort_by(|a, b| {
            b.success_rate
                .total_cmp(&a.success_rate)
                .then(b.executions.cmp(&a.executions))
                .then(a.hour.cmp(&b.hour))
        });

        let mut busiest: Vec<&HourlyStats> = hourly.iter().collect();
        busiest.sort_by(|a, b| b.executions.cmp(&a.executions).then(a.hour.cmp(&b.hour)));

        Self {
            generated_at: Some(now),
            sample_size: records.len(),
            optimal_hours: optimal.iter().map(|h| h.hour).collect(),
            peak_hours: busiest.iter().take(PEAK_HOURS).map(|h| h.hour).collect(),
            task_success: by_task
                .into_iter()
                .map(|(id, (runs, ok))| (id.to_string(), ok as f64 / runs as f64 * 100.0))
                .collect(),
            hourly,
        }
    }

    /// Best optimal hour that is not also a peak hour.
    pub fn best_hour(&self) -> Option<u32> {
        self.optimal_hours
            .iter()
            .copied()
            .find(|h| !self.peak_hours.contains(h))
    }
}
