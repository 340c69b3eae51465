//! Task scheduler - recurring and one-shot tasks with self-tuning schedules.
//!
//! Each task owns a timer (a spawned tokio task) that sleeps until the next
//! firing and then runs [`TaskScheduler::execute_task`]. Recurring tasks use
//! cron expressions (5, 6 or 7 fields); one-shot tasks use a [`Trigger`].
//!
//! # Task lifecycle
//!
//! `scheduled → running → completed | failed`; a recurring task returns to
//! `scheduled` once its next firing is armed. Paused tasks keep their state but have no
//! timer. Runs whose preconditions do not hold are skipped and count neither
//! as success nor as failure.

pub mod cron;
pub mod patterns;

pub use self::cron::{normalize_expression, CronSchedule};
pub use self::patterns::{HourlyStats, SchedulePatterns, TaskExecutionRecord};

use crate::dsl::{evaluate_condition, EvalContext};
use crate::executor::{CommandExecutor, FunctionRegistry};
use crate::in_flight::InFlight;
use crate::workflow::WorkflowEngine;
use chrono::{DateTime, Datelike, Local, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use steward_common::bus::{publish_best_effort, Event, EventBus, Topic};
use steward_common::{SchedulerConfig, Validate, ValidationError, ValidationResult};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Executions required before a low success rate triggers optimisation.
const MIN_EXECUTIONS_FOR_OPTIMIZE: u64 = 10;

/// Command invoked when the scheduler looks unhealthy.
pub const SYSTEM_OPTIMIZE: &str = "system_optimize";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already running: {0}")]
    AlreadyRunning(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

// ============================================================================
// Task Types
// ============================================================================

/// What a task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskAction {
    Command {
        command: String,
        #[serde(default)]
        params: Map<String, Value>,
    },
    Function {
        function: String,
        #[serde(default)]
        params: Map<String, Value>,
    },
    /// Workflow by id or name.
    Workflow {
        workflow_id: String,
        #[serde(default)]
        context: Map<String, Value>,
    },
}

impl TaskAction {
    fn target(&self) -> &str {
        match self {
            TaskAction::Command { command, .. } => command,
            TaskAction::Function { function, .. } => function,
            TaskAction::Workflow { workflow_id, .. } => workflow_id,
        }
    }
}

/// One-shot trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Now,
    At(DateTime<Utc>),
}

/// Condition checked before each run. Times are local.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Precondition {
    /// `start_hour <= hour < end_hour`; wraps past midnight when start > end.
    TimeWindow { start_hour: u32, end_hour: u32 },
    Weekdays { days: Vec<Weekday> },
    /// Stop running after `count` executions.
    MaxExecutions { count: u64 },
    /// DSL expression over `$task` and `$now`.
    Expression { expr: String },
}

impl Precondition {
    fn check(&self, task: &Task, now: DateTime<Local>) -> Result<bool, String> {
        match self {
            Precondition::TimeWindow {
                start_hour,
                end_hour,
            } => {
                let hour = now.hour();
                Ok(if start_hour <= end_hour {
                    hour >= *start_hour && hour < *end_hour
                } else {
                    hour >= *start_hour || hour < *end_hour
                })
            }
            Precondition::Weekdays { days } => Ok(days.contains(&now.weekday())),
            Precondition::MaxExecutions { count } => Ok(task.execution_count < *count),
            Precondition::Expression { expr } => {
                let vars = precondition_vars(task, now);
                evaluate_condition(expr, &EvalContext::new(&vars)).map_err(|e| e.to_string())
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Precondition::TimeWindow {
                start_hour,
                end_hour,
            } => format!("time_window {start_hour}-{end_hour}"),
            Precondition::Weekdays { days } => format!("weekdays {days:?}"),
            Precondition::MaxExecutions { count } => format!("max_executions {count}"),
            Precondition::Expression { expr } => format!("expression '{expr}'"),
        }
    }
}

fn precondition_vars(task: &Task, now: DateTime<Local>) -> Map<String, Value> {
    let mut vars = Map::new();
    vars.insert(
        "task".into(),
        json!({
            "id": task.id,
            "name": task.name,
            "priority": task.priority,
            "execution_count": task.execution_count,
            "success_count": task.success_count,
            "failure_count": task.failure_count,
            "success_rate": task.success_rate,
        }),
    );
    vars.insert(
        "now".into(),
        json!({
            "hour": now.hour(),
            "minute": now.minute(),
            "weekday": now.weekday().number_from_monday(),
        }),
    );
    vars
}

/// Registration payload for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub action: TaskAction,
    /// Cron expression, or `now` for an immediate one-shot run.
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: Vec<Precondition>,
    /// Let pattern analysis move the run hour.
    #[serde(default)]
    pub intelligent: bool,
}

impl TaskConfig {
    pub fn new(name: impl Into<String>, action: TaskAction) -> Self {
        Self {
            name: name.into(),
            action,
            schedule: None,
            trigger: None,
            priority: 0,
            conditions: Vec::new(),
            intelligent: false,
        }
    }

    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(
            name,
            TaskAction::Command {
                command: command.into(),
                params: Map::new(),
            },
        )
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_condition(mut self, condition: Precondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn intelligent(mut self) -> Self {
        self.intelligent = true;
        self
    }

    /// Validate the config and parse its schedule without registering it.
    pub fn check(&self) -> Result<(), SchedulerError> {
        self.validate()?;
        self.timing().map(|_| ())
    }

    /// Split `schedule` into a cron expression or a one-shot trigger.
    fn timing(&self) -> Result<(Option<CronSchedule>, Option<Trigger>), SchedulerError> {
        match self.schedule.as_deref().map(str::trim) {
            Some(s) if s.eq_ignore_ascii_case("now") => Ok((None, Some(Trigger::Now))),
            Some(expression) => Ok((Some(CronSchedule::parse(expression)?), None)),
            None => Ok((None, self.trigger.clone())),
        }
    }
}

impl Validate for TaskConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ValidationError::missing("name"));
        }
        if self.action.target().trim().is_empty() {
            errors.push(ValidationError::missing("action"));
        }
        match (&self.schedule, &self.trigger) {
            (None, None) => errors.push(ValidationError::missing("schedule")),
            (Some(_), Some(_)) => errors.push(ValidationError::Conflict {
                reason: "set either schedule or trigger, not both".into(),
            }),
            _ => {}
        }
        for condition in &self.conditions {
            match condition {
                Precondition::TimeWindow {
                    start_hour,
                    end_hour,
                } if *start_hour > 23 || *end_hour > 24 => {
                    errors.push(ValidationError::invalid("conditions.time_window", "hours out of range"));
                }
                Precondition::Weekdays { days } if days.is_empty() => {
                    errors.push(ValidationError::invalid("conditions.weekdays", "no days given"));
                }
                Precondition::Expression { expr } if expr.trim().is_empty() => {
                    errors.push(ValidationError::missing("conditions.expression"));
                }
                _ => {}
            }
        }

        ValidationError::collect(errors)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub action: TaskAction,
    pub priority: i32,
    pub conditions: Vec<Precondition>,
    pub intelligent: bool,
    /// Cron expression as registered.
    pub base_schedule: Option<String>,
    /// Cron expression in use after intelligent retuning.
    pub effective_schedule: Option<String>,
    pub trigger: Option<Trigger>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub skip_count: u64,
    pub average_duration_ms: f64,
    pub success_rate: f64,
    pub last_error: Option<String>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_recurring(&self) -> bool {
        self.effective_schedule.is_some()
    }

    fn record_run(&mut self, success: bool, duration_ms: u64, error: Option<String>) {
        self.execution_count += 1;
        let paused = self.status == TaskStatus::Paused;
        if success {
            self.success_count += 1;
            if !paused {
                self.status = TaskStatus::Completed;
            }
        } else {
            self.failure_count += 1;
            if !paused {
                self.status = TaskStatus::Failed;
            }
            self.last_error = error;
        }
        self.average_duration_ms = (self.average_duration_ms + duration_ms as f64) / 2.0;
        self.success_rate = self.success_count as f64 / self.execution_count as f64 * 100.0;
    }
}

/// Result of one [`TaskScheduler::execute_task`] call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum TaskRunOutcome {
    Completed { output: Value, duration_ms: u64 },
    Failed { error: String, duration_ms: u64 },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_tasks: usize,
    pub active_tasks: usize,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub skipped_executions: u64,
    pub average_duration_ms: f64,
    pub success_rate: f64,
    pub last_optimization: Option<DateTime<Utc>>,
    pub pruned_tasks: u64,
}

/// What [`TaskScheduler::optimize`] did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizationReport {
    pub pruned: Vec<String>,
    pub system_optimize_invoked: bool,
    pub reason: Option<String>,
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct TaskScheduler {
    config: SchedulerConfig,
    tasks: RwLock<HashMap<String, Task>>,
    timers: RwLock<HashMap<String, JoinHandle<()>>>,
    history: RwLock<VecDeque<TaskExecutionRecord>>,
    stats: RwLock<SchedulerStats>,
    patterns: RwLock<SchedulePatterns>,
    in_flight: InFlight,
    executor: Arc<dyn CommandExecutor>,
    functions: FunctionRegistry,
    workflows: Arc<WorkflowEngine>,
    bus: Arc<dyn EventBus>,
}

impl TaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        executor: Arc<dyn CommandExecutor>,
        functions: FunctionRegistry,
        workflows: Arc<WorkflowEngine>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            config,
            tasks: RwLock::new(HashMap::new()),
            timers: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            stats: RwLock::new(SchedulerStats::default()),
            patterns: RwLock::new(SchedulePatterns::default()),
            in_flight: InFlight::default(),
            executor,
            functions,
            workflows,
            bus,
        }
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Validate, register and arm a task. Returns the task id.
    pub async fn schedule_task(self: &Arc<Self>, config: TaskConfig) -> Result<String, SchedulerError> {
        config.validate()?;
        let (schedule, trigger) = config.timing()?;

        let effective = match &schedule {
            Some(base) if config.intelligent => {
                let patterns = self.patterns.read().await;
                Some(intelligent_schedule(base, &patterns))
            }
            other => other.clone(),
        };

        let task = Task {
            id: Uuid::new_v4().to_string(),
            name: config.name,
            action: config.action,
            priority: config.priority,
            conditions: config.conditions,
            intelligent: config.intelligent,
            base_schedule: schedule.as_ref().map(|s| s.source().to_string()),
            effective_schedule: effective.as_ref().map(|s| s.normalized().to_string()),
            trigger,
            status: TaskStatus::Scheduled,
            created_at: Utc::now(),
            execution_count: 0,
            success_count: 0,
            failure_count: 0,
            skip_count: 0,
            average_duration_ms: 0.0,
            success_rate: 0.0,
            last_error: None,
            last_run: None,
            next_run: None,
        };
        let id = task.id.clone();

        tracing::info!(
            task_id = %id,
            name = %task.name,
            schedule = ?task.effective_schedule,
            trigger = ?task.trigger,
            intelligent = task.intelligent,
            "Task scheduled"
        );

        let payload = json!({
            "task_id": id,
            "name": task.name,
            "schedule": task.effective_schedule,
        });
        self.tasks.write().await.insert(id.clone(), task);
        self.stats.write().await.total_tasks += 1;
        self.arm(&id).await;
        self.publish(Topic::TaskScheduled, &id, payload).await;

        Ok(id)
    }

    /// Cancel the timer and delete the task.
    pub async fn remove_task(&self, id: &str) -> Result<Task, SchedulerError> {
        if let Some(timer) = self.timers.write().await.remove(id) {
            timer.abort();
        }
        let task = self
            .tasks
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;

        {
            let mut stats = self.stats.write().await;
            stats.total_tasks = stats.total_tasks.saturating_sub(1);
        }
        tracing::info!(task_id = %id, name = %task.name, "Task removed");
        self.publish(Topic::TaskRemoved, id, json!({ "task_id": id, "name": task.name }))
            .await;
        Ok(task)
    }

    pub async fn pause_task(&self, id: &str) -> Result<(), SchedulerError> {
        {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;
            task.status = TaskStatus::Paused;
            task.next_run = None;
        }
        if let Some(timer) = self.timers.write().await.remove(id) {
            timer.abort();
        }
        tracing::info!(task_id = %id, "Task paused");
        Ok(())
    }

    pub async fn resume_task(self: &Arc<Self>, id: &str) -> Result<(), SchedulerError> {
        {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;
            if task.status != TaskStatus::Paused {
                return Ok(());
            }
            task.status = TaskStatus::Scheduled;
        }
        self.arm(id).await;
        tracing::info!(task_id = %id, "Task resumed");
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    /// Tasks by descending priority, oldest first within a priority.
    pub async fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<_> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        tasks
    }

    /// Most recent executions, oldest first.
    pub async fn history(&self, limit: usize) -> Vec<TaskExecutionRecord> {
        let history = self.history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub async fn statistics(&self) -> SchedulerStats {
        let mut stats = self.stats.read().await.clone();
        let tasks = self.tasks.read().await;
        stats.total_tasks = tasks.len();
        stats.active_tasks = tasks
            .values()
            .filter(|t| t.status != TaskStatus::Paused)
            .count();
        stats
    }

    pub async fn patterns(&self) -> SchedulePatterns {
        self.patterns.read().await.clone()
    }

    /// Abort every timer. Tasks stay registered.
    pub async fn shutdown(&self) {
        let mut timers = self.timers.write().await;
        for (_, timer) in timers.drain() {
            timer.abort();
        }
        tracing::info!("Scheduler timers stopped");
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Run a task now, honouring its preconditions.
    ///
    /// Action failures are reported as [`TaskRunOutcome::Failed`]; `Err` is
    /// only returned for unknown tasks and overlapping exclusive runs.
    pub async fn execute_task(&self, id: &str) -> Result<TaskRunOutcome, SchedulerError> {
        let task = self
            .get_task(id)
            .await
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;

        if task.status == TaskStatus::Paused {
            return Ok(self.skip(&task, "task is paused".into()).await);
        }

        let now = Local::now();
        for condition in &task.conditions {
            match condition.check(&task, now) {
                Ok(true) => {}
                Ok(false) => {
                    let reason = format!("precondition not met: {}", condition.describe());
                    return Ok(self.skip(&task, reason).await);
                }
                Err(e) => {
                    let reason = format!("precondition error: {} ({e})", condition.describe());
                    return Ok(self.skip(&task, reason).await);
                }
            }
        }

        let claim = if self.config.exclusive_execution {
            match self.in_flight.try_claim(&task.id) {
                Some(claim) => Some(claim),
                None => return Err(SchedulerError::AlreadyRunning(task.id)),
            }
        } else {
            None
        };

        let started_at = Utc::now();
        if let Some(t) = self.tasks.write().await.get_mut(id) {
            if t.status != TaskStatus::Paused {
                t.status = TaskStatus::Running;
            }
            t.last_run = Some(started_at);
        }
        tracing::info!(task_id = %id, name = %task.name, "Running task");
        self.publish(Topic::TaskStarted, id, json!({ "task_id": id, "name": task.name }))
            .await;

        let started = Instant::now();
        let result = self.dispatch(&task).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        drop(claim);

        let success = result.is_ok();
        let error = result.as_ref().err().cloned();

        if let Some(t) = self.tasks.write().await.get_mut(id) {
            t.record_run(success, duration_ms, error.clone());
        }
        {
            let mut stats = self.stats.write().await;
            stats.total_executions += 1;
            if success {
                stats.successful_executions += 1;
            } else {
                stats.failed_executions += 1;
            }
            stats.average_duration_ms = (stats.average_duration_ms + duration_ms as f64) / 2.0;
            stats.success_rate =
                stats.successful_executions as f64 / stats.total_executions as f64 * 100.0;
        }
        {
            let mut history = self.history.write().await;
            history.push_back(TaskExecutionRecord {
                task_id: task.id.clone(),
                task_name: task.name.clone(),
                started_at,
                duration_ms,
                success,
                error: error.clone(),
            });
            while history.len() > self.config.execution_history_cap {
                history.pop_front();
            }
        }

        match result {
            Ok(output) => {
                tracing::info!(task_id = %id, duration_ms = duration_ms, "Task completed");
                self.publish(
                    Topic::TaskCompleted,
                    id,
                    json!({ "task_id": id, "name": task.name, "duration_ms": duration_ms }),
                )
                .await;
                Ok(TaskRunOutcome::Completed { output, duration_ms })
            }
            Err(error) => {
                tracing::error!(task_id = %id, error = %error, "Task failed");
                self.publish(
                    Topic::TaskFailed,
                    id,
                    json!({
                        "task_id": id,
                        "name": task.name,
                        "error": error,
                        "duration_ms": duration_ms,
                    }),
                )
                .await;
                Ok(TaskRunOutcome::Failed { error, duration_ms })
            }
        }
    }

    async fn dispatch(&self, task: &Task) -> Result<Value, String> {
        match &task.action {
            TaskAction::Command { command, params } => self
                .executor
                .execute(command, params)
                .await
                .map_err(|e| e.to_string()),
            TaskAction::Function { function, params } => {
                let mut context = Map::new();
                context.insert("task_id".into(), json!(task.id));
                context.insert("task_name".into(), json!(task.name));
                self.functions
                    .call(function, context, params.clone())
                    .await
                    .map_err(|e| e.to_string())
            }
            TaskAction::Workflow {
                workflow_id,
                context,
            } => match self.workflows.execute_workflow(workflow_id, context.clone()).await {
                Ok(run) if run.success => Ok(run.result),
                Ok(run) => Err(run
                    .error
                    .unwrap_or_else(|| format!("workflow {workflow_id} failed"))),
                Err(e) => Err(e.to_string()),
            },
        }
    }

    async fn skip(&self, task: &Task, reason: String) -> TaskRunOutcome {
        if let Some(t) = self.tasks.write().await.get_mut(&task.id) {
            t.skip_count += 1;
        }
        self.stats.write().await.skipped_executions += 1;
        tracing::debug!(task_id = %task.id, reason = %reason, "Task skipped");
        self.publish(
            Topic::TaskSkipped,
            &task.id,
            json!({ "task_id": task.id, "name": task.name, "reason": reason }),
        )
        .await;
        TaskRunOutcome::Skipped { reason }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    async fn arm(self: &Arc<Self>, id: &str) {
        let handle = tokio::spawn(timer_loop(Arc::downgrade(self), id.to_string()));
        if let Some(previous) = self.timers.write().await.insert(id.to_string(), handle) {
            previous.abort();
        }
    }

    /// Delay until the next firing and whether the task recurs.
    async fn next_firing(&self, id: &str) -> Option<(Duration, bool)> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id)?;
        if task.status == TaskStatus::Paused {
            return None;
        }

        let now = Utc::now();
        let (next, recurring) = match (&task.effective_schedule, &task.trigger) {
            (Some(expression), _) => {
                let schedule = CronSchedule::parse(expression).ok()?;
                (schedule.next_after(&now)?, true)
            }
            (None, _) if task.last_run.is_some() => return None,
            (None, Some(Trigger::Now)) => (now, false),
            (None, Some(Trigger::At(at))) => (*at, false),
            (None, None) => return None,
        };

        if recurring && matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
            task.status = TaskStatus::Scheduled;
        }
        task.next_run = Some(next);
        Some(((next - now).to_std().unwrap_or(Duration::ZERO), recurring))
    }

    // ------------------------------------------------------------------------
    // Analysis
    // ------------------------------------------------------------------------

    /// Recompute schedule patterns from recent history and retune
    /// intelligent tasks.
    pub async fn analyze_patterns(self: &Arc<Self>) -> SchedulePatterns {
        let records: Vec<_> = self.history.read().await.iter().cloned().collect();
        let patterns = SchedulePatterns::from_history(&records, Utc::now());
        *self.patterns.write().await = patterns.clone();

        tracing::info!(
            samples = patterns.sample_size,
            optimal_hours = ?patterns.optimal_hours,
            peak_hours = ?patterns.peak_hours,
            "Schedule patterns analyzed"
        );

        let mut retuned = Vec::new();
        {
            let mut tasks = self.tasks.write().await;
            for task in tasks.values_mut().filter(|t| t.intelligent) {
                let Some(base) = task.base_schedule.as_deref().and_then(|b| CronSchedule::parse(b).ok()) else {
                    continue;
                };
                let tuned = intelligent_schedule(&base, &patterns).normalized().to_string();
                if task.effective_schedule.as_deref() != Some(tuned.as_str()) {
                    tracing::info!(task_id = %task.id, schedule = %tuned, "Intelligent task retuned");
                    task.effective_schedule = Some(tuned);
                    if task.status != TaskStatus::Paused {
                        retuned.push(task.id.clone());
                    }
                }
            }
        }
        for id in retuned {
            self.arm(&id).await;
        }

        patterns
    }

    /// Prune inactive tasks and request system optimisation when the
    /// scheduler is struggling.
    pub async fn optimize(self: &Arc<Self>) -> OptimizationReport {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::days(self.config.inactive_after_days);

        let stale: Vec<String> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.last_run.unwrap_or(t.created_at) < cutoff)
            .map(|t| t.id.clone())
            .collect();

        let mut report = OptimizationReport::default();
        for id in stale {
            if self.remove_task(&id).await.is_ok() {
                report.pruned.push(id);
            }
        }

        let stats = {
            let mut stats = self.stats.write().await;
            stats.last_optimization = Some(now);
            stats.pruned_tasks += report.pruned.len() as u64;
            stats.clone()
        };

        report.reason = if stats.total_executions >= MIN_EXECUTIONS_FOR_OPTIMIZE
            && stats.success_rate < self.config.optimize_success_rate_floor
        {
            Some(format!("success rate {:.1}% below floor", stats.success_rate))
        } else if stats.average_duration_ms > self.config.slow_task_threshold_ms as f64 {
            Some(format!("average duration {:.0}ms above threshold", stats.average_duration_ms))
        } else {
            None
        };

        if let Some(reason) = &report.reason {
            let mut params = Map::new();
            params.insert("reason".into(), json!(reason));
            params.insert("success_rate".into(), json!(stats.success_rate));
            params.insert("average_duration_ms".into(), json!(stats.average_duration_ms));
            match self.executor.execute(SYSTEM_OPTIMIZE, &params).await {
                Ok(_) => report.system_optimize_invoked = true,
                Err(e) => tracing::warn!(error = %e, "System optimisation failed"),
            }
        }

        tracing::info!(
            pruned = report.pruned.len(),
            system_optimize = report.system_optimize_invoked,
            "Scheduler optimisation finished"
        );
        report
    }

    async fn publish(&self, topic: Topic, task_id: &str, payload: Value) {
        let event = Event::new(topic, "scheduler")
            .with_correlation_id(task_id)
            .with_payload(payload);
        publish_best_effort(self.bus.as_ref(), event).await;
    }
}

/// Base schedule moved to the best non-peak optimal hour, when there is one.
fn intelligent_schedule(base: &CronSchedule, patterns: &SchedulePatterns) -> CronSchedule {
    patterns
        .best_hour()
        .and_then(|hour| base.with_hour(hour))
        .unwrap_or_else(|| base.clone())
}

async fn timer_loop(scheduler: Weak<TaskScheduler>, task_id: String) {
    loop {
        let Some(firing) = (match scheduler.upgrade() {
            Some(s) => s.next_firing(&task_id).await,
            None => return,
        }) else {
            return;
        };
        let (delay, recurring) = firing;

        tokio::time::sleep(delay).await;

        let Some(s) = scheduler.upgrade() else {
            return;
        };
        // The run is detached so aborting this timer never cuts it short.
        let id = task_id.clone();
        let run = tokio::spawn(async move { s.execute_task(&id).await });
        match run.await {
            Ok(Err(e)) => tracing::warn!(task_id = %task_id, error = %e, "Scheduled run rejected"),
            Err(e) => tracing::error!(task_id = %task_id, error = %e, "Scheduled run panicked"),
            Ok(Ok(_)) => {}
        }
        if !recurring {
            return;
        }
        // Cron resolution is one second; never fire twice in the same second.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
