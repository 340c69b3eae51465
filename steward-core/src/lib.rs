//! Steward Core - autonomous orchestration for a personal-assistant platform.
//!
//! This crate provides:
//! - A factor store of normalised system and environment signals
//! - A rule-driven decision matrix
//! - A workflow engine with branching, parallelism, retries and recovery
//! - A cron-based task scheduler that retunes itself from execution history
//! - The autonomous controller that wires them together over the event bus
//! - A YAML loader for workflow and task definitions

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod controller;
pub mod decision;
pub mod definitions;
pub mod dsl;
pub mod executor;
pub mod factors;
mod in_flight;
pub mod scheduler;
pub mod workflow;

pub use controller::{AutonomousController, ControllerHealth, ControllerStats, TASK_FAILURE, WORKFLOW_FAILURE};
pub use decision::{
    Decision, DecisionContext, DecisionError, DecisionMatrix, DecisionOptions, DecisionStats, Operator, Rule,
    NO_ACTION,
};
pub use definitions::{Definitions, DefinitionsError, LoadedDefinitions};
pub use dsl::{evaluate_condition, evaluate_expression, interpolate, EvalContext, EvalError};
pub use executor::{CommandExecutor, ExecutionError, FunctionRegistry, LoggingExecutor};
pub use factors::{FactorSnapshot, FactorStore, HealthProvider, HealthStatus, SystemHealth};
pub use scheduler::{
    Precondition, SchedulePatterns, SchedulerError, SchedulerStats, Task, TaskAction, TaskConfig,
    TaskRunOutcome, TaskScheduler, TaskStatus, Trigger,
};
pub use workflow::{
    ErrorPolicy, Execution, ExecutionStatus, Step, StepKind, Workflow, WorkflowDefinition, WorkflowEngine,
    WorkflowError, WorkflowRun,
};
