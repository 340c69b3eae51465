//! Workflow definitions and execution records.
//!
//! A workflow is an ordered list of [`Step`]s. Steps are tagged by `type`:
//!
//! ```yaml
//! name: morning_digest
//! auto_recover: true
//! steps:
//!   - type: command
//!     command: fetch_email
//!     output_variable: inbox
//!     on_error: retry
//!     retry_count: 3
//!   - type: condition
//!     predicate: "$inbox.unread > 0"
//!     on_true:
//!       type: command
//!       command: notify_user
//!       params: { message: "You have ${inbox.unread} unread emails" }
//!   - type: delay
//!     duration: 500
//! ```

pub mod engine;

pub use engine::{EngineStats, WorkflowEngine};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use steward_common::{Validate, ValidationError, ValidationResult};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Workflow nesting too deep: {depth} > {max}")]
    NestingTooDeep { depth: usize, max: usize },

    #[error("Workflow already running: {0}")]
    AlreadyRunning(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

// ============================================================================
// Steps
// ============================================================================

/// What happens when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Fail the execution.
    #[default]
    Propagate,
    /// Record the failure and move on.
    Continue,
    /// Re-attempt up to `retry_count` times, then propagate.
    Retry,
}

/// A delay in milliseconds, or a `${var}` resolving to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DelaySpec {
    Millis(u64),
    Expression(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepKind {
    /// Run a command through the command executor.
    Command {
        command: String,
        #[serde(default)]
        params: Map<String, Value>,
    },
    /// Call a registered function with `(context, params)`.
    Function {
        function: String,
        #[serde(default)]
        params: Map<String, Value>,
    },
    /// Evaluate `predicate` and run one of the branches.
    Condition {
        predicate: String,
        #[serde(default)]
        on_true: Option<Box<Step>>,
        #[serde(default)]
        on_false: Option<Box<Step>>,
    },
    /// Run branches concurrently against a snapshot of the context.
    Parallel {
        steps: Vec<Step>,
        /// Fail fast when any branch fails; otherwise report each branch.
        #[serde(default = "default_true")]
        wait_for_all: bool,
    },
    Delay {
        duration: DelaySpec,
    },
    /// Run another workflow (by id or name) with a merged context.
    Workflow {
        workflow_id: String,
        #[serde(default)]
        context: Map<String, Value>,
    },
}

fn default_true() -> bool {
    true
}

fn default_retry_count() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Guard expression; the step is skipped when it is false.
    #[serde(default)]
    pub condition: Option<String>,
    /// Context key that receives the step output.
    #[serde(default)]
    pub output_variable: Option<String>,
    #[serde(default)]
    pub checkpoint: bool,
    #[serde(default)]
    pub on_error: ErrorPolicy,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

impl Step {
    pub fn new(kind: StepKind) -> Self {
        Self {
            name: None,
            kind,
            condition: None,
            output_variable: None,
            checkpoint: false,
            on_error: ErrorPolicy::default(),
            retry_count: default_retry_count(),
        }
    }

    pub fn command(command: impl Into<String>) -> Self {
        Self::new(StepKind::Command {
            command: command.into(),
            params: Map::new(),
        })
    }

    pub fn function(function: impl Into<String>) -> Self {
        Self::new(StepKind::Function {
            function: function.into(),
            params: Map::new(),
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_params(mut self, new_params: Map<String, Value>) -> Self {
        if let StepKind::Command { params, .. } | StepKind::Function { params, .. } = &mut self.kind {
            *params = new_params;
        }
        self
    }

    pub fn when(mut self, guard: impl Into<String>) -> Self {
        self.condition = Some(guard.into());
        self
    }

    pub fn output(mut self, variable: impl Into<String>) -> Self {
        self.output_variable = Some(variable.into());
        self
    }

    pub fn checkpoint(mut self) -> Self {
        self.checkpoint = true;
        self
    }

    pub fn on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn retry(mut self, count: u32) -> Self {
        self.on_error = ErrorPolicy::Retry;
        self.retry_count = count;
        self
    }

    fn validate_at(&self, path: &str, errors: &mut Vec<ValidationError>) {
        if self.on_error == ErrorPolicy::Retry && self.retry_count == 0 {
            errors.push(ValidationError::invalid(
                format!("{path}.retry_count"),
                "must be at least 1",
            ));
        }
        if let Some(guard) = &self.condition {
            if guard.trim().is_empty() {
                errors.push(ValidationError::invalid(format!("{path}.condition"), "empty guard"));
            }
        }

        match &self.kind {
            StepKind::Command { command, .. } if command.trim().is_empty() => {
                errors.push(ValidationError::missing(format!("{path}.command")));
            }
            StepKind::Function { function, .. } if function.trim().is_empty() => {
                errors.push(ValidationError::missing(format!("{path}.function")));
            }
            StepKind::Workflow { workflow_id, .. } if workflow_id.trim().is_empty() => {
                errors.push(ValidationError::missing(format!("{path}.workflow_id")));
            }
            StepKind::Condition {
                predicate,
                on_true,
                on_false,
            } => {
                if predicate.trim().is_empty() {
                    errors.push(ValidationError::missing(format!("{path}.predicate")));
                }
                if let Some(step) = on_true {
                    step.validate_at(&format!("{path}.on_true"), errors);
                }
                if let Some(step) = on_false {
                    step.validate_at(&format!("{path}.on_false"), errors);
                }
            }
            StepKind::Parallel { steps, .. } => {
                if steps.is_empty() {
                    errors.push(ValidationError::invalid(
                        format!("{path}.steps"),
                        "parallel step needs at least one branch",
                    ));
                }
                for (i, step) in steps.iter().enumerate() {
                    step.validate_at(&format!("{path}.steps[{i}]"), errors);
                }
            }
            StepKind::Delay {
                duration: DelaySpec::Expression(expr),
            } if expr.trim().is_empty() => {
                errors.push(ValidationError::missing(format!("{path}.duration")));
            }
            _ => {}
        }
    }
}

// ============================================================================
// Workflows
// ============================================================================

/// Registration payload for a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<Step>,
    /// Re-run once after a failure.
    #[serde(default)]
    pub auto_recover: bool,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
            auto_recover: false,
        }
    }

    pub fn auto_recover(mut self) -> Self {
        self.auto_recover = true;
        self
    }
}

impl Validate for WorkflowDefinition {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push(ValidationError::missing("name"));
        }
        if self.steps.is_empty() {
            errors.push(ValidationError::invalid("steps", "at least one step is required"));
        }
        for (i, step) in self.steps.iter().enumerate() {
            step.validate_at(&format!("steps[{i}]"), &mut errors);
        }
        ValidationError::collect(errors)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Idle,
    Running,
}

/// A registered workflow with its running statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<Step>,
    pub auto_recover: bool,
    pub status: WorkflowStatus,
    /// Executions of this workflow currently in progress.
    #[serde(default)]
    pub active_executions: usize,
    pub created_at: DateTime<Utc>,
    pub execution_count: u64,
    pub successful_count: u64,
    pub last_execution: Option<DateTime<Utc>>,
    pub success_rate: f64,
    pub average_duration_ms: f64,
}

impl Workflow {
    pub(crate) fn from_definition(definition: WorkflowDefinition) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: definition.name,
            description: definition.description,
            steps: definition.steps,
            auto_recover: definition.auto_recover,
            status: WorkflowStatus::Idle,
            active_executions: 0,
            created_at: Utc::now(),
            execution_count: 0,
            successful_count: 0,
            last_execution: None,
            success_rate: 0.0,
            average_duration_ms: 0.0,
        }
    }

    pub(crate) fn record_run(&mut self, success: bool, duration_ms: u64) {
        self.execution_count += 1;
        if success {
            self.successful_count += 1;
        }
        self.success_rate = self.successful_count as f64 / self.execution_count as f64 * 100.0;
        self.average_duration_ms = (self.average_duration_ms + duration_ms as f64) / 2.0;
    }
}

// ============================================================================
// Executions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ExecutionStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub name: Option<String>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// One run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub context: Map<String, Value>,
    pub current_step: usize,
    pub progress: f64,
    pub step_results: Vec<StepResult>,
    pub errors: Vec<String>,
    /// Indices of completed checkpoint steps.
    pub checkpoints: Vec<usize>,
    /// Execution this run is recovering from.
    pub recovery_of: Option<String>,
    pub depth: usize,
}

impl Execution {
    pub(crate) fn start(
        workflow: &Workflow,
        context: Map<String, Value>,
        depth: usize,
        recovery_of: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            started_at: Utc::now(),
            ended_at: None,
            status: ExecutionStatus::Running,
            context,
            current_step: 0,
            progress: 0.0,
            step_results: Vec::new(),
            errors: Vec::new(),
            checkpoints: Vec::new(),
            recovery_of,
            depth,
        }
    }
}

/// Result of [`WorkflowEngine::execute_workflow`].
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRun {
    pub success: bool,
    /// Output of the last completed step.
    pub result: Value,
    pub error: Option<String>,
    pub execution: Execution,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_yaml_shapes() {
        let yaml = r#"
name: digest
auto_recover: true
steps:
  - type: command
    command: fetch_email
    output_variable: inbox
    on_error: retry
    retry_count: 2
  - type: condition
    predicate: "$inbox.unread > 0"
    on_true:
      type: command
      command: notify_user
      params:
        message: "You have ${inbox.unread} unread"
  - type: parallel
    wait_for_all: false
    steps:
      - type: function
        function: summarize
      - type: delay
        duration: "${pause_ms}"
  - type: workflow
    workflow_id: cleanup
"#;
        let def: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(def.auto_recover);
        assert_eq!(def.steps.len(), 4);
        assert_eq!(def.steps[0].on_error, ErrorPolicy::Retry);
        assert_eq!(def.steps[0].retry_count, 2);
        assert_eq!(def.steps[1].retry_count, 3);
        match &def.steps[2].kind {
            StepKind::Parallel { steps, wait_for_all } => {
                assert!(!wait_for_all);
                assert_eq!(
                    steps[1].kind,
                    StepKind::Delay {
                        duration: DelaySpec::Expression("${pause_ms}".into())
                    }
                );
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_validation_is_recursive() {
        let def = WorkflowDefinition::new(
            "bad",
            vec![Step::new(StepKind::Condition {
                predicate: "$x".into(),
                on_true: Some(Box::new(Step::new(StepKind::Parallel {
                    steps: vec![],
                    wait_for_all: true,
                }))),
                on_false: Some(Box::new(Step::command("").retry(0))),
            })],
        );
        match def.validate() {
            Err(ValidationError::Multiple(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected multiple errors, got {other:?}"),
        }

        assert!(WorkflowDefinition::new("", vec![]).validate().is_err());
    }

    #[test]
    fn test_record_run_statistics() {
        let mut wf = Workflow::from_definition(WorkflowDefinition::new("w", vec![Step::command("x")]));
        wf.record_run(true, 100);
        wf.record_run(false, 300);
        assert_eq!(wf.execution_count, 2);
        assert_eq!(wf.success_rate, 50.0);
        // (0 + 100) / 2 = 50, then (50 + 300) / 2 = 175.
        assert_eq!(wf.average_duration_ms, 175.0);
    }

    #[test]
    fn test_with_params_only_touches_callables() {
        let mut params = Map::new();
        params.insert("to".into(), json!("ana@example.com"));
        let step = Step::command("send_email").with_params(params.clone());
        assert_eq!(
            step.kind,
            StepKind::Command {
                command: "send_email".into(),
                params
            }
        );
    }
}
