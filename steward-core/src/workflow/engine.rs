//! Workflow execution engine.

use super::{
    DelaySpec, ErrorPolicy, Execution, ExecutionStatus, Step, StepKind, StepResult, StepStatus,
    Workflow, WorkflowDefinition, WorkflowError, WorkflowRun, WorkflowStatus,
};
use crate::dsl::{evaluate_condition, interpolate_params, interpolate_value, value_to_f64, EvalContext};
use crate::executor::{CommandExecutor, ExecutionError, FunctionRegistry};
use crate::in_flight::InFlight;
use futures::future::{join_all, try_join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use steward_common::bus::{publish_best_effort, Event, EventBus, Topic};
use steward_common::{Validate, WorkflowConfig};
use tokio::sync::RwLock;

/// Aggregate engine statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub workflows: usize,
    pub running_executions: usize,
    pub retained_executions: usize,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub success_rate: f64,
}

/// Outcome of one step, after guard and retry handling.
enum StepOutcome {
    Skipped,
    Completed { output: Value, attempts: u32 },
    Failed { error: ExecutionError, attempts: u32 },
}

struct ExecutionEntry {
    execution: Execution,
    stop: Arc<AtomicBool>,
}

/// Bounded store of executions; the oldest finished run is evicted first.
#[derive(Default)]
struct ExecutionArena {
    entries: HashMap<String, ExecutionEntry>,
    order: VecDeque<String>,
}

impl ExecutionArena {
    fn insert(&mut self, execution: Execution, stop: Arc<AtomicBool>, cap: usize) {
        self.order.push_back(execution.id.clone());
        self.entries
            .insert(execution.id.clone(), ExecutionEntry { execution, stop });

        while self.entries.len() > cap {
            let oldest_finished = self.order.iter().position(|id| {
                self.entries
                    .get(id)
                    .map(|e| e.execution.status.is_finished())
                    .unwrap_or(true)
            });
            match oldest_finished {
                Some(pos) => {
                    if let Some(id) = self.order.remove(pos) {
                        self.entries.remove(&id);
                    }
                }
                // Everything retained is still running.
                None => break,
            }
        }
    }

    fn update(&mut self, execution: &Execution) {
        if let Some(entry) = self.entries.get_mut(&execution.id) {
            entry.execution = execution.clone();
        }
    }
}

pub struct WorkflowEngine {
    config: WorkflowConfig,
    workflows: RwLock<HashMap<String, Workflow>>,
    executions: RwLock<ExecutionArena>,
    in_flight: InFlight,
    executor: Arc<dyn CommandExecutor>,
    functions: FunctionRegistry,
    bus: Arc<dyn EventBus>,
}

impl WorkflowEngine {
    pub fn new(
        config: WorkflowConfig,
        executor: Arc<dyn CommandExecutor>,
        functions: FunctionRegistry,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            config,
            workflows: RwLock::new(HashMap::new()),
            executions: RwLock::new(ExecutionArena::default()),
            in_flight: InFlight::default(),
            executor,
            functions,
            bus,
        }
    }

    // ------------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------------

    /// Validate and register a workflow, returning its id.
    pub async fn create_workflow(&self, definition: WorkflowDefinition) -> Result<String, WorkflowError> {
        definition.validate()?;
        let workflow = Workflow::from_definition(definition);
        let id = workflow.id.clone();

        tracing::info!(
            workflow_id = %id,
            workflow = %workflow.name,
            steps = workflow.steps.len(),
            auto_recover = workflow.auto_recover,
            "Workflow created"
        );

        self.workflows.write().await.insert(id.clone(), workflow);
        Ok(id)
    }

    pub async fn register_function<F, Fut>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(Map<String, Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.functions.register(name, function).await;
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Look up a workflow by id, falling back to its name.
    pub async fn get_workflow(&self, id_or_name: &str) -> Option<Workflow> {
        let workflows = self.workflows.read().await;
        workflows
            .get(id_or_name)
            .or_else(|| workflows.values().find(|w| w.name == id_or_name))
            .cloned()
    }

    pub async fn list_workflows(&self) -> Vec<Workflow> {
        let mut workflows: Vec<_> = self.workflows.read().await.values().cloned().collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        workflows
    }

    pub async fn remove_workflow(&self, id: &str) -> Result<Workflow, WorkflowError> {
        let removed = self
            .workflows
            .write()
            .await
            .remove(id)
            .ok_or_else(|| WorkflowError::NotFound(id.to_string()))?;
        tracing::info!(workflow_id = %id, workflow = %removed.name, "Workflow removed");
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------------

    pub async fn get_execution(&self, id: &str) -> Option<Execution> {
        self.executions
            .read()
            .await
            .entries
            .get(id)
            .map(|e| e.execution.clone())
    }

    /// Most recent executions, oldest first.
    pub async fn executions(&self, limit: usize) -> Vec<Execution> {
        let arena = self.executions.read().await;
        let skip = arena.order.len().saturating_sub(limit);
        arena
            .order
            .iter()
            .skip(skip)
            .filter_map(|id| arena.entries.get(id).map(|e| e.execution.clone()))
            .collect()
    }

    /// Ask a running execution to stop before its next step.
    ///
    /// Returns `false` when the execution had already finished.
    pub async fn stop_execution(&self, id: &str) -> Result<bool, WorkflowError> {
        let arena = self.executions.read().await;
        let entry = arena
            .entries
            .get(id)
            .ok_or_else(|| WorkflowError::ExecutionNotFound(id.to_string()))?;

        if entry.execution.status.is_finished() {
            return Ok(false);
        }
        entry.stop.store(true, Ordering::SeqCst);
        tracing::info!(execution_id = %id, "Stop requested");
        Ok(true)
    }

    pub async fn statistics(&self) -> EngineStats {
        let workflows = self.workflows.read().await;
        let arena = self.executions.read().await;

        let total: u64 = workflows.values().map(|w| w.execution_count).sum();
        let successful: u64 = workflows.values().map(|w| w.successful_count).sum();

        EngineStats {
            workflows: workflows.len(),
            running_executions: arena
                .entries
                .values()
                .filter(|e| !e.execution.status.is_finished())
                .count(),
            retained_executions: arena.entries.len(),
            total_executions: total,
            successful_executions: successful,
            success_rate: if total > 0 {
                successful as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    /// Execute a workflow by id (or name).
    ///
    /// Step failures are reported in the returned [`WorkflowRun`]; `Err` is
    /// only returned for unknown workflows, nesting overflow and overlapping
    /// runs when exclusive execution is enabled.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        context: Map<String, Value>,
    ) -> Result<WorkflowRun, WorkflowError> {
        self.execute_at_depth(workflow_id, context, 0).await
    }

    fn execute_at_depth<'a>(
        &'a self,
        workflow_ref: &'a str,
        context: Map<String, Value>,
        depth: usize,
    ) -> BoxFuture<'a, Result<WorkflowRun, WorkflowError>> {
        Box::pin(async move {
            if depth > self.config.max_nesting_depth {
                return Err(WorkflowError::NestingTooDeep {
                    depth,
                    max: self.config.max_nesting_depth,
                });
            }

            let workflow = self
                .get_workflow(workflow_ref)
                .await
                .ok_or_else(|| WorkflowError::NotFound(workflow_ref.to_string()))?;

            let _claim = if self.config.exclusive_execution {
                match self.in_flight.try_claim(&workflow.id) {
                    Some(claim) => Some(claim),
                    None => return Err(WorkflowError::AlreadyRunning(workflow.id)),
                }
            } else {
                None
            };

            let first = self.run_once(&workflow, context.clone(), depth, None).await;
            let run = if !first.success
                && workflow.auto_recover
                && first.execution.status == ExecutionStatus::Failed
            {
                tracing::warn!(
                    workflow = %workflow.name,
                    execution_id = %first.execution.id,
                    delay_ms = self.config.recovery_delay_ms,
                    "Workflow failed, scheduling recovery"
                );
                tokio::time::sleep(self.config.recovery_delay()).await;
                self.run_once(&workflow, context, depth, Some(first.execution.id.clone()))
                    .await
            } else {
                first
            };

            Ok(run)
        })
    }

    async fn run_once(
        &self,
        workflow: &Workflow,
        context: Map<String, Value>,
        depth: usize,
        recovery_of: Option<String>,
    ) -> WorkflowRun {
        let stop = Arc::new(AtomicBool::new(false));
        let mut execution = Execution::start(workflow, context, depth, recovery_of);
        let started = Instant::now();

        self.executions.write().await.insert(
            execution.clone(),
            stop.clone(),
            self.config.execution_history_cap.max(1),
        );
        self.set_workflow_running(&workflow.id).await;

        tracing::info!(
            workflow = %workflow.name,
            execution_id = %execution.id,
            depth = depth,
            recovery_of = ?execution.recovery_of,
            "Starting workflow execution"
        );
        self.publish(Topic::ExecutionStarted, &execution, json!({})).await;

        let total = workflow.steps.len();
        let mut last_output = Value::Null;
        let mut failure: Option<String> = None;

        for (idx, step) in workflow.steps.iter().enumerate() {
            if stop.load(Ordering::SeqCst) {
                execution.status = ExecutionStatus::Stopped;
                break;
            }

            execution.current_step = idx;
            execution.progress = idx as f64 / total as f64 * 100.0;
            self.executions.write().await.update(&execution);

            let step_started = Instant::now();
            let outcome = self.run_step(step, &mut execution.context, depth).await;
            let duration_ms = step_started.elapsed().as_millis() as u64;

            let result = match outcome {
                StepOutcome::Skipped => {
                    tracing::debug!(execution_id = %execution.id, step = idx, "Step skipped by guard");
                    step_result(idx, step, StepStatus::Skipped, None, None, 0, duration_ms)
                }
                StepOutcome::Completed { output, attempts } => {
                    if let Some(var) = &step.output_variable {
                        execution.context.insert(var.clone(), output.clone());
                    }
                    if step.checkpoint {
                        execution.checkpoints.push(idx);
                    }
                    last_output = output.clone();
                    step_result(idx, step, StepStatus::Completed, Some(output), None, attempts, duration_ms)
                }
                StepOutcome::Failed { error, attempts } => {
                    let message = error.to_string();
                    execution.errors.push(format!("step {idx}: {message}"));
                    if step.on_error == ErrorPolicy::Continue {
                        tracing::warn!(
                            execution_id = %execution.id,
                            step = idx,
                            error = %message,
                            "Step failed, continuing"
                        );
                    } else {
                        failure = Some(message.clone());
                    }
                    step_result(idx, step, StepStatus::Failed, None, Some(message), attempts, duration_ms)
                }
            };
            execution.step_results.push(result);

            if failure.is_some() {
                break;
            }
        }

        execution.ended_at = Some(chrono::Utc::now());
        if execution.status != ExecutionStatus::Stopped {
            if failure.is_some() {
                execution.status = ExecutionStatus::Failed;
            } else {
                execution.status = ExecutionStatus::Completed;
                execution.progress = 100.0;
            }
        }

        let success = execution.status == ExecutionStatus::Completed;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.finish_workflow(&workflow.id, success, duration_ms).await;
        self.executions.write().await.update(&execution);

        let error = match execution.status {
            ExecutionStatus::Stopped => Some(ExecutionError::Stopped.to_string()),
            _ => failure,
        };

        match execution.status {
            ExecutionStatus::Completed => {
                tracing::info!(
                    workflow = %workflow.name,
                    execution_id = %execution.id,
                    duration_ms = duration_ms,
                    "Workflow execution completed"
                );
                self.publish(Topic::ExecutionCompleted, &execution, json!({ "duration_ms": duration_ms }))
                    .await;
            }
            ExecutionStatus::Stopped => {
                tracing::info!(
                    workflow = %workflow.name,
                    execution_id = %execution.id,
                    completed_steps = execution.step_results.len(),
                    "Workflow execution stopped"
                );
                self.publish(Topic::ExecutionStopped, &execution, json!({})).await;
            }
            _ => {
                let will_recover = workflow.auto_recover && execution.recovery_of.is_none();
                tracing::error!(
                    workflow = %workflow.name,
                    execution_id = %execution.id,
                    error = ?error,
                    will_recover = will_recover,
                    "Workflow execution failed"
                );
                self.publish(
                    Topic::ExecutionFailed,
                    &execution,
                    json!({ "error": error, "will_recover": will_recover, "duration_ms": duration_ms }),
                )
                .await;
            }
        }

        WorkflowRun {
            success,
            result: last_output,
            error,
            execution,
        }
    }

    // ------------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------------

    /// Run one step: guard, dispatch and the retry policy.
    fn run_step<'a>(
        &'a self,
        step: &'a Step,
        context: &'a mut Map<String, Value>,
        depth: usize,
    ) -> BoxFuture<'a, StepOutcome> {
        Box::pin(async move {
            if let Some(guard) = &step.condition {
                match evaluate_condition(guard, &EvalContext::new(context)) {
                    Ok(true) => {}
                    Ok(false) => return StepOutcome::Skipped,
                    Err(e) => {
                        return StepOutcome::Failed {
                            error: ExecutionError::Condition(format!("guard '{guard}': {e}")),
                            attempts: 0,
                        }
                    }
                }
            }

            let attempts = match step.on_error {
                ErrorPolicy::Retry => step.retry_count.max(1),
                _ => 1,
            };

            let mut attempt = 1;
            loop {
                match self.dispatch(&step.kind, context, depth).await {
                    Ok(output) => return StepOutcome::Completed { output, attempts: attempt },
                    Err(error) if attempt >= attempts => return StepOutcome::Failed { error, attempts: attempt },
                    Err(error) => {
                        let delay = self.config.retry_base_delay() * attempt;
                        tracing::warn!(
                            attempt = attempt,
                            max_attempts = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Step failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                }
            }
        })
    }

    /// Run a step nested in a condition or parallel step, applying its own
    /// output variable and error policy.
    async fn run_nested(
        &self,
        step: &Step,
        context: &mut Map<String, Value>,
        depth: usize,
    ) -> Result<Value, ExecutionError> {
        match self.run_step(step, context, depth).await {
            StepOutcome::Skipped => Ok(Value::Null),
            StepOutcome::Completed { output, .. } => {
                if let Some(var) = &step.output_variable {
                    context.insert(var.clone(), output.clone());
                }
                Ok(output)
            }
            StepOutcome::Failed { error, .. } if step.on_error == ErrorPolicy::Continue => {
                tracing::warn!(error = %error, "Nested step failed, continuing");
                Ok(Value::Null)
            }
            StepOutcome::Failed { error, .. } => Err(error),
        }
    }

    async fn dispatch(
        &self,
        kind: &StepKind,
        context: &mut Map<String, Value>,
        depth: usize,
    ) -> Result<Value, ExecutionError> {
        match kind {
            StepKind::Command { command, params } => {
                let params = interpolate_params(params, context);
                tracing::debug!(command = %command, "Dispatching command");
                self.executor.execute(command, &params).await
            }
            StepKind::Function { function, params } => {
                let params = interpolate_params(params, context);
                tracing::debug!(function = %function, "Calling function");
                self.functions.call(function, context.clone(), params).await
            }
            StepKind::Condition {
                predicate,
                on_true,
                on_false,
            } => {
                let holds = evaluate_condition(predicate, &EvalContext::new(context))
                    .map_err(|e| ExecutionError::Condition(format!("predicate '{predicate}': {e}")))?;
                let branch = if holds { on_true } else { on_false };
                match branch {
                    Some(step) => self.run_nested(step, context, depth).await,
                    None => Ok(Value::Bool(holds)),
                }
            }
            StepKind::Parallel { steps, wait_for_all } => {
                self.run_parallel(steps, *wait_for_all, context, depth).await
            }
            StepKind::Delay { duration } => {
                let ms = resolve_delay(duration, context)?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(ms))
            }
            StepKind::Workflow {
                workflow_id,
                context: extra,
            } => {
                let mut merged = context.clone();
                for (k, v) in interpolate_params(extra, context) {
                    merged.insert(k, v);
                }
                match self.execute_at_depth(workflow_id, merged, depth + 1).await {
                    Ok(run) if run.success => Ok(run.result),
                    Ok(run) => Err(ExecutionError::Workflow(
                        run.error.unwrap_or_else(|| format!("{workflow_id} failed")),
                    )),
                    Err(e) => Err(ExecutionError::Workflow(e.to_string())),
                }
            }
        }
    }

    async fn run_parallel(
        &self,
        steps: &[Step],
        wait_for_all: bool,
        context: &mut Map<String, Value>,
        depth: usize,
    ) -> Result<Value, ExecutionError> {
        let branches = steps.iter().map(|step| {
            let mut snapshot = context.clone();
            async move { self.run_nested(step, &mut snapshot, depth).await }
        });

        if wait_for_all {
            let outputs = try_join_all(branches).await?;
            for (step, output) in steps.iter().zip(&outputs) {
                if let Some(var) = &step.output_variable {
                    context.insert(var.clone(), output.clone());
                }
            }
            return Ok(Value::Array(outputs));
        }

        let results = join_all(branches).await;
        let mut report = Vec::with_capacity(results.len());
        for (step, result) in steps.iter().zip(results) {
            match result {
                Ok(output) => {
                    if let Some(var) = &step.output_variable {
                        context.insert(var.clone(), output.clone());
                    }
                    report.push(json!({ "success": true, "output": output }));
                }
                Err(e) => report.push(json!({ "success": false, "error": e.to_string() })),
            }
        }
        Ok(Value::Array(report))
    }

    // ------------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------------

    async fn set_workflow_running(&self, id: &str) {
        if let Some(workflow) = self.workflows.write().await.get_mut(id) {
            workflow.active_executions += 1;
            workflow.status = WorkflowStatus::Running;
            workflow.last_execution = Some(chrono::Utc::now());
        }
    }

    async fn finish_workflow(&self, id: &str, success: bool, duration_ms: u64) {
        if let Some(workflow) = self.workflows.write().await.get_mut(id) {
            workflow.active_executions = workflow.active_executions.saturating_sub(1);
            if workflow.active_executions == 0 {
                workflow.status = WorkflowStatus::Idle;
            }
            workflow.record_run(success, duration_ms);
        }
    }

    async fn publish(&self, topic: Topic, execution: &Execution, extra: Value) {
        let mut payload = json!({
            "execution_id": execution.id,
            "workflow_id": execution.workflow_id,
            "workflow_name": execution.workflow_name,
            "recovery_of": execution.recovery_of,
            "depth": execution.depth,
        });
        if let (Value::Object(base), Value::Object(extra)) = (&mut payload, extra) {
            base.extend(extra);
        }

        let event = Event::new(topic, "workflow")
            .with_correlation_id(execution.id.clone())
            .with_payload(payload);
        publish_best_effort(self.bus.as_ref(), event).await;
    }
}

fn step_result(
    index: usize,
    step: &Step,
    status: StepStatus,
    output: Option<Value>,
    error: Option<String>,
    attempts: u32,
    duration_ms: u64,
) -> StepResult {
    StepResult {
        index,
        name: step.name.clone(),
        status,
        output,
        error,
        attempts,
        duration_ms,
    }
}

fn resolve_delay(duration: &DelaySpec, context: &Map<String, Value>) -> Result<u64, ExecutionError> {
    match duration {
        DelaySpec::Millis(ms) => Ok(*ms),
        DelaySpec::Expression(expr) => {
            let resolved = interpolate_value(&Value::String(expr.clone()), context);
            value_to_f64(&resolved)
                .filter(|ms| ms.is_finite() && *ms >= 0.0)
                .map(|ms| ms.round() as u64)
                .ok_or_else(|| ExecutionError::InvalidStep(format!("delay '{expr}' is not a duration")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use steward_common::InMemoryBus;

    /// Executor that fails the first `failures` calls of each command.
    #[derive(Default)]
    struct FlakyExecutor {
        failures: usize,
        calls: AtomicUsize,
        seen: std::sync::Mutex<Vec<(String, Map<String, Value>)>>,
    }

    #[async_trait]
    impl CommandExecutor for FlakyExecutor {
        async fn execute(&self, command: &str, params: &Map<String, Value>) -> Result<Value, ExecutionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push((command.to_string(), params.clone()));
            if command == "always_fail" || n < self.failures {
                return Err(ExecutionError::command(command, "boom"));
            }
            Ok(json!({ "command": command, "call": n }))
        }
    }

    fn test_config() -> WorkflowConfig {
        WorkflowConfig {
            retry_base_delay_ms: 1,
            recovery_delay_ms: 1,
            ..WorkflowConfig::default()
        }
    }

    fn engine_with(executor: Arc<FlakyExecutor>, config: WorkflowConfig) -> WorkflowEngine {
        WorkflowEngine::new(config, executor, FunctionRegistry::new(), Arc::new(InMemoryBus::new()))
    }

    fn ctx(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn test_interpolates_params_and_stores_output() {
        let executor = Arc::new(FlakyExecutor::default());
        let engine = engine_with(executor.clone(), test_config());
        let id = engine
            .create_workflow(WorkflowDefinition::new(
                "greet",
                vec![
                    Step::command("send_email")
                        .with_params(ctx(json!({ "to": "${user.email}", "subject": "Hi ${user.name}" })))
                        .output("sent")
                        .checkpoint(),
                    Step::command("log").with_params(ctx(json!({ "call": "${sent.call}" }))),
                ],
            ))
            .await
            .unwrap();

        let run = engine
            .execute_workflow(&id, ctx(json!({ "user": { "email": "ana@example.com", "name": "Ana" } })))
            .await
            .unwrap();

        assert!(run.success);
        assert_eq!(run.execution.progress, 100.0);
        assert_eq!(run.execution.checkpoints, vec![0]);
        assert_eq!(run.execution.context["sent"]["call"], 0);

        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen[0].1["to"], "ana@example.com");
        assert_eq!(seen[0].1["subject"], "Hi Ana");
        assert_eq!(seen[1].1["call"], 0);
    }

    #[tokio::test]
    async fn test_continue_policy_proceeds() {
        let executor = Arc::new(FlakyExecutor::default());
        let engine = engine_with(executor, test_config());
        let id = engine
            .create_workflow(WorkflowDefinition::new(
                "tolerant",
                vec![
                    Step::command("always_fail").on_error(ErrorPolicy::Continue),
                    Step::command("ok"),
                ],
            ))
            .await
            .unwrap();

        let run = engine.execute_workflow(&id, Map::new()).await.unwrap();
        assert!(run.success);
        assert_eq!(run.execution.errors.len(), 1);
        assert_eq!(run.execution.step_results[0].status, StepStatus::Failed);
        assert_eq!(run.execution.step_results[1].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_propagate_stops_execution() {
        let executor = Arc::new(FlakyExecutor::default());
        let engine = engine_with(executor.clone(), test_config());
        let id = engine
            .create_workflow(WorkflowDefinition::new(
                "strict",
                vec![Step::command("always_fail"), Step::command("never_runs")],
            ))
            .await
            .unwrap();

        let run = engine.execute_workflow(&id, Map::new()).await.unwrap();
        assert!(!run.success);
        assert_eq!(run.execution.status, ExecutionStatus::Failed);
        assert_eq!(run.execution.step_results.len(), 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert!(run.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_condition_and_delay_steps() {
        let executor = Arc::new(FlakyExecutor::default());
        let engine = engine_with(executor.clone(), test_config());
        let id = engine
            .create_workflow(WorkflowDefinition::new(
                "branchy",
                vec![
                    Step::new(StepKind::Condition {
                        predicate: "$count > 3".into(),
                        on_true: Some(Box::new(Step::command("big"))),
                        on_false: Some(Box::new(Step::command("small").output("branch"))),
                    }),
                    Step::new(StepKind::Delay {
                        duration: DelaySpec::Expression("${pause}".into()),
                    })
                    .output("slept"),
                ],
            ))
            .await
            .unwrap();

        let run = engine
            .execute_workflow(&id, ctx(json!({ "count": 1, "pause": 2 })))
            .await
            .unwrap();
        assert!(run.success);
        assert_eq!(run.execution.context["slept"], json!(2));
        assert_eq!(run.execution.context["branch"]["command"], "small");
        assert_eq!(executor.seen.lock().unwrap()[0].0, "small");
    }

    #[tokio::test]
    async fn test_nested_workflow_by_name_and_depth_limit() {
        let executor = Arc::new(FlakyExecutor::default());
        let config = WorkflowConfig {
            max_nesting_depth: 2,
            ..test_config()
        };
        let engine = engine_with(executor, config);
        engine
            .create_workflow(WorkflowDefinition::new(
                "child",
                vec![Step::command("child_step")
                    .with_params(ctx(json!({ "who": "${who}" })))
                    .output("child_out")],
            ))
            .await
            .unwrap();
        let parent = engine
            .create_workflow(WorkflowDefinition::new(
                "parent",
                vec![Step::new(StepKind::Workflow {
                    workflow_id: "child".into(),
                    context: ctx(json!({ "who": "parent" })),
                })
                .output("child_result")],
            ))
            .await
            .unwrap();

        let run = engine.execute_workflow(&parent, Map::new()).await.unwrap();
        assert!(run.success);
        assert_eq!(run.result["command"], "child_step");

        let looping = engine
            .create_workflow(WorkflowDefinition::new(
                "looping",
                vec![Step::new(StepKind::Workflow {
                    workflow_id: "looping".into(),
                    context: Map::new(),
                })],
            ))
            .await
            .unwrap();
        let run = engine.execute_workflow(&looping, Map::new()).await.unwrap();
        assert!(!run.success);
        assert!(run.error.unwrap().contains("nesting too deep"));
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_error() {
        let engine = engine_with(Arc::new(FlakyExecutor::default()), test_config());
        assert!(matches!(
            engine.execute_workflow("nope", Map::new()).await,
            Err(WorkflowError::NotFound(_))
        ));
        assert!(matches!(
            engine.stop_execution("nope").await,
            Err(WorkflowError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_function_step() {
        let engine = engine_with(Arc::new(FlakyExecutor::default()), test_config());
        engine
            .register_function("count_keys", |context, params| async move {
                let offset = params.get("offset").and_then(Value::as_u64).unwrap_or(0);
                Ok(json!(context.len() as u64 + offset))
            })
            .await;
        let id = engine
            .create_workflow(WorkflowDefinition::new(
                "fn",
                vec![Step::function("count_keys").with_params(ctx(json!({ "offset": "${base}" })))],
            ))
            .await
            .unwrap();

        let run = engine.execute_workflow(&id, ctx(json!({ "base": 10, "x": 1 }))).await.unwrap();
        assert_eq!(run.result, json!(12));
    }

    #[tokio::test]
    async fn test_execution_arena_evicts_oldest_finished() {
        let config = WorkflowConfig {
            execution_history_cap: 3,
            ..test_config()
        };
        let engine = engine_with(Arc::new(FlakyExecutor::default()), config);
        let id = engine
            .create_workflow(WorkflowDefinition::new("w", vec![Step::command("ok")]))
            .await
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(engine.execute_workflow(&id, Map::new()).await.unwrap().execution.id);
        }

        let retained: Vec<_> = engine.executions(10).await.into_iter().map(|e| e.id).collect();
        assert_eq!(retained, ids[2..].to_vec());
        assert!(engine.get_execution(&ids[0]).await.is_none());

        let stats = engine.statistics().await;
        assert_eq!(stats.total_executions, 5);
        assert_eq!(stats.retained_executions, 3);
        assert_eq!(stats.success_rate, 100.0);
    }

    #[tokio::test]
    async fn test_exclusive_execution_rejects_overlap() {
        let config = WorkflowConfig {
            exclusive_execution: true,
            ..test_config()
        };
        let engine = Arc::new(engine_with(Arc::new(FlakyExecutor::default()), config));
        let id = engine
            .create_workflow(WorkflowDefinition::new(
                "slow",
                vec![Step::new(StepKind::Delay {
                    duration: DelaySpec::Millis(200),
                })],
            ))
            .await
            .unwrap();

        let first = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.execute_workflow(&id, Map::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            engine.execute_workflow(&id, Map::new()).await,
            Err(WorkflowError::AlreadyRunning(_))
        ));
        assert!(first.await.unwrap().unwrap().success);
        assert!(engine.execute_workflow(&id, Map::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_run_releases_exclusive_claim() {
        let config = WorkflowConfig {
            exclusive_execution: true,
            ..test_config()
        };
        let engine = Arc::new(engine_with(Arc::new(FlakyExecutor::default()), config));
        let id = engine
            .create_workflow(WorkflowDefinition::new(
                "paced",
                vec![Step::new(StepKind::Delay {
                    duration: DelaySpec::Expression("${pause_ms}".into()),
                })],
            ))
            .await
            .unwrap();

        let running = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.execute_workflow(&id, ctx(json!({ "pause_ms": 5_000 }))).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.in_flight.contains(&id));

        running.abort();
        let _ = running.await;
        assert!(!engine.in_flight.contains(&id));

        let run = engine
            .execute_workflow(&id, ctx(json!({ "pause_ms": 1 })))
            .await
            .unwrap();
        assert!(run.success);
    }

    #[tokio::test]
    async fn test_status_stays_running_while_any_execution_is_active() {
        let engine = Arc::new(engine_with(Arc::new(FlakyExecutor::default()), test_config()));
        let id = engine
            .create_workflow(WorkflowDefinition::new(
                "paced",
                vec![Step::new(StepKind::Delay {
                    duration: DelaySpec::Expression("${pause_ms}".into()),
                })],
            ))
            .await
            .unwrap();

        let long = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.execute_workflow(&id, ctx(json!({ "pause_ms": 300 }))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let short = engine
            .execute_workflow(&id, ctx(json!({ "pause_ms": 10 })))
            .await
            .unwrap();
        assert!(short.success);

        let workflow = engine.get_workflow(&id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Running);
        assert_eq!(workflow.active_executions, 1);

        assert!(long.await.unwrap().unwrap().success);
        let workflow = engine.get_workflow(&id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Idle);
        assert_eq!(workflow.active_executions, 0);
        assert_eq!(workflow.execution_count, 2);
    }
}
