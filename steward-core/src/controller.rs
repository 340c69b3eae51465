//! Autonomous controller - wires the decision matrix, workflow engine and
//! task scheduler together over the event bus.
//!
//! Failures reported on the bus are turned into decisions, and actionable
//! decisions are carried out through the command executor. Periodic loops
//! drive continuous analysis, health polling, pattern analysis and
//! scheduler optimisation.

use crate::decision::{Decision, DecisionContext, DecisionMatrix, DecisionOptions, DecisionStats, Rule};
use crate::definitions::{Definitions, DefinitionsError, LoadedDefinitions};
use crate::executor::{CommandExecutor, FunctionRegistry};
use crate::factors::{FactorSnapshot, FactorStore, HealthProvider};
use crate::scheduler::{SchedulerError, SchedulerStats, TaskConfig, TaskScheduler};
use crate::workflow::{EngineStats, WorkflowDefinition, WorkflowEngine, WorkflowError, WorkflowRun};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use steward_common::bus::{publish_best_effort, spawn_handler, BusError, Event, EventBus, InMemoryBus, Topic};
use steward_common::Config;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Context type used for decisions about failed workflows.
pub const WORKFLOW_FAILURE: &str = "workflow_failure";
/// Context type used for decisions about failed tasks.
pub const TASK_FAILURE: &str = "task_failure";

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStats {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    pub decisions: DecisionStats,
    pub workflows: EngineStats,
    pub scheduler: SchedulerStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerHealth {
    pub healthy: bool,
    pub running: bool,
    pub bus_healthy: bool,
    pub uptime_secs: u64,
    pub active_tasks: usize,
    pub running_executions: usize,
    pub factors: FactorSnapshot,
}

// ============================================================================
// Controller
// ============================================================================

pub struct AutonomousController {
    config: Config,
    factors: Arc<FactorStore>,
    decisions: Arc<DecisionMatrix>,
    workflows: Arc<WorkflowEngine>,
    scheduler: Arc<TaskScheduler>,
    executor: Arc<dyn CommandExecutor>,
    health: Option<Arc<dyn HealthProvider>>,
    bus: Arc<dyn EventBus>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    started_at: RwLock<Option<DateTime<Utc>>>,
}

impl AutonomousController {
    /// Controller over an in-memory bus and no health provider.
    pub fn new(config: Config, executor: Arc<dyn CommandExecutor>) -> Self {
        Self::with_parts(config, executor, Arc::new(InMemoryBus::new()), None)
    }

    pub fn with_parts(
        config: Config,
        executor: Arc<dyn CommandExecutor>,
        bus: Arc<dyn EventBus>,
        health: Option<Arc<dyn HealthProvider>>,
    ) -> Self {
        let factors = Arc::new(FactorStore::new());
        let mut matrix = DecisionMatrix::new(config.decision.clone(), factors.clone(), bus.clone());
        if let Some(provider) = &health {
            matrix = matrix.with_health_provider(provider.clone());
        }

        let functions = FunctionRegistry::new();
        let workflows = Arc::new(WorkflowEngine::new(
            config.workflow.clone(),
            executor.clone(),
            functions.clone(),
            bus.clone(),
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            config.scheduler.clone(),
            executor.clone(),
            functions,
            workflows.clone(),
            bus.clone(),
        ));

        Self {
            config,
            factors,
            decisions: Arc::new(matrix),
            workflows,
            scheduler,
            executor,
            health,
            bus,
            loops: Mutex::new(Vec::new()),
            started_at: RwLock::new(None),
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Subscribe failure handlers and spawn the periodic loops.
    ///
    /// Calling `start` on a running controller does nothing.
    pub async fn start(&self) -> Result<(), BusError> {
        let mut loops = self.loops.lock().await;
        if !loops.is_empty() {
            return Ok(());
        }

        tracing::info!("Starting autonomous controller");

        let decisions = self.decisions.clone();
        let executor = self.executor.clone();
        loops.push(
            spawn_handler(self.bus.clone(), Topic::ExecutionFailed, move |event| {
                let decisions = decisions.clone();
                let executor = executor.clone();
                async move {
                    if event.payload.get("will_recover").and_then(Value::as_bool) == Some(true) {
                        return;
                    }
                    react_to_failure(&decisions, executor.as_ref(), WORKFLOW_FAILURE, event).await;
                }
            })
            .await?,
        );

        let decisions = self.decisions.clone();
        let executor = self.executor.clone();
        loops.push(
            spawn_handler(self.bus.clone(), Topic::TaskFailed, move |event| {
                let decisions = decisions.clone();
                let executor = executor.clone();
                async move {
                    react_to_failure(&decisions, executor.as_ref(), TASK_FAILURE, event).await;
                }
            })
            .await?,
        );

        let decisions = self.decisions.clone();
        let executor = self.executor.clone();
        loops.push(spawn_periodic(
            "decision analysis",
            self.config.decision.analysis_interval(),
            move || {
                let decisions = decisions.clone();
                let executor = executor.clone();
                async move {
                    let decision = decisions.run_continuous_analysis().await;
                    act_on(&decisions, executor.as_ref(), &decision).await;
                }
            },
        ));

        let factors = self.factors.clone();
        let health = self.health.clone();
        let bus = self.bus.clone();
        loops.push(spawn_periodic(
            "health poll",
            self.config.controller.health_poll_interval(),
            move || {
                let factors = factors.clone();
                let health = health.clone();
                let bus = bus.clone();
                async move {
                    factors.refresh(health.as_deref()).await;
                    let snapshot = factors.snapshot().await;
                    let bus_healthy = bus.is_healthy().await;
                    let event = Event::new(Topic::ControllerHealth, "controller").with_payload(json!({
                        "bus_healthy": bus_healthy,
                        "factors": snapshot,
                    }));
                    publish_best_effort(bus.as_ref(), event).await;
                }
            },
        ));

        let scheduler = self.scheduler.clone();
        loops.push(spawn_periodic(
            "pattern analysis",
            self.config.scheduler.pattern_analysis_interval(),
            move || {
                let scheduler = scheduler.clone();
                async move {
                    scheduler.analyze_patterns().await;
                }
            },
        ));

        let scheduler = self.scheduler.clone();
        loops.push(spawn_periodic(
            "scheduler optimisation",
            self.config.scheduler.optimization_interval(),
            move || {
                let scheduler = scheduler.clone();
                async move {
                    scheduler.optimize().await;
                }
            },
        ));

        *self.started_at.write().await = Some(Utc::now());
        tracing::info!(loops = loops.len(), "Autonomous controller started");
        Ok(())
    }

    /// Abort the loops, handlers and task timers.
    pub async fn shutdown(&self) {
        let mut loops = self.loops.lock().await;
        for handle in loops.drain(..) {
            handle.abort();
        }
        self.scheduler.shutdown().await;
        *self.started_at.write().await = None;
        tracing::info!("Autonomous controller stopped");
    }

    pub async fn is_running(&self) -> bool {
        !self.loops.lock().await.is_empty()
    }

    // ------------------------------------------------------------------------
    // Public surface
    // ------------------------------------------------------------------------

    pub async fn make_decision(&self, context: &DecisionContext, options: &DecisionOptions) -> Decision {
        self.decisions.make_decision(context, options).await
    }

    pub async fn schedule_task(&self, config: TaskConfig) -> Result<String, SchedulerError> {
        self.scheduler.schedule_task(config).await
    }

    pub async fn remove_task(&self, id: &str) -> Result<(), SchedulerError> {
        self.scheduler.remove_task(id).await.map(|_| ())
    }

    pub async fn create_workflow(&self, definition: WorkflowDefinition) -> Result<String, WorkflowError> {
        self.workflows.create_workflow(definition).await
    }

    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        context: Map<String, Value>,
    ) -> Result<WorkflowRun, WorkflowError> {
        self.workflows.execute_workflow(workflow_id, context).await
    }

    pub async fn stop_execution(&self, execution_id: &str) -> Result<bool, WorkflowError> {
        self.workflows.stop_execution(execution_id).await
    }

    /// Most recent decisions, oldest first.
    pub async fn recent_decisions(&self, limit: usize) -> Vec<Decision> {
        self.decisions.history(limit).await
    }

    pub async fn rules(&self) -> Vec<Rule> {
        self.decisions.rules().await
    }

    pub async fn statistics(&self) -> ControllerStats {
        let started_at = *self.started_at.read().await;
        ControllerStats {
            running: started_at.is_some(),
            started_at,
            uptime_secs: uptime_secs(started_at),
            decisions: self.decisions.statistics().await,
            workflows: self.workflows.statistics().await,
            scheduler: self.scheduler.statistics().await,
        }
    }

    pub async fn health(&self) -> ControllerHealth {
        let started_at = *self.started_at.read().await;
        let bus_healthy = self.bus.is_healthy().await;
        ControllerHealth {
            healthy: bus_healthy,
            running: started_at.is_some(),
            bus_healthy,
            uptime_secs: uptime_secs(started_at),
            active_tasks: self.scheduler.statistics().await.active_tasks,
            running_executions: self.workflows.statistics().await.running_executions,
            factors: self.factors.snapshot().await,
        }
    }

    /// Register every workflow, then every task, from a YAML file.
    pub async fn load_definitions(&self, path: &Path) -> Result<LoadedDefinitions, DefinitionsError> {
        let definitions = Definitions::load(path)?;
        self.register_definitions(definitions).await
    }

    pub async fn register_definitions(&self, definitions: Definitions) -> Result<LoadedDefinitions, DefinitionsError> {
        let known: HashSet<String> = self
            .workflows
            .list_workflows()
            .await
            .into_iter()
            .flat_map(|w| [w.id, w.name])
            .collect();
        definitions.check(&known)?;

        let mut loaded = LoadedDefinitions::default();
        for workflow in definitions.workflows {
            let name = workflow.name.clone();
            let id = self
                .workflows
                .create_workflow(workflow)
                .await
                .map_err(|source| DefinitionsError::Workflow { name, source })?;
            loaded.workflows.push(id);
        }
        for task in definitions.tasks {
            let name = task.name.clone();
            let id = self
                .scheduler
                .schedule_task(task)
                .await
                .map_err(|source| DefinitionsError::Task { name, source })?;
            loaded.tasks.push(id);
        }

        tracing::info!(
            workflows = loaded.workflows.len(),
            tasks = loaded.tasks.len(),
            "Definitions loaded"
        );
        Ok(loaded)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn decisions(&self) -> &Arc<DecisionMatrix> {
        &self.decisions
    }

    pub fn workflows(&self) -> &Arc<WorkflowEngine> {
        &self.workflows
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn factors(&self) -> &Arc<FactorStore> {
        &self.factors
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }
}

fn uptime_secs(started_at: Option<DateTime<Utc>>) -> u64 {
    started_at
        .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
        .unwrap_or(0)
}

async fn react_to_failure(
    decisions: &DecisionMatrix,
    executor: &dyn CommandExecutor,
    context_type: &str,
    event: Event,
) {
    tracing::debug!(
        topic = %event.topic,
        correlation_id = ?event.correlation_id,
        context_type = %context_type,
        "Failure reported, deciding on a response"
    );
    let context = DecisionContext::new(context_type).with_payload(event.payload);
    let decision = decisions.make_decision(&context, &DecisionOptions::default()).await;
    act_on(decisions, executor, &decision).await;
}

/// Carry out an actionable decision and report the outcome.
async fn act_on(decisions: &DecisionMatrix, executor: &dyn CommandExecutor, decision: &Decision) {
    if !decision.is_actionable() {
        return;
    }

    let mut params = Map::new();
    params.insert("decision_id".into(), json!(decision.id));
    params.insert("context_type".into(), json!(decision.context_type));
    params.insert("confidence".into(), json!(decision.confidence));

    let success = match executor.execute(&decision.action, &params).await {
        Ok(_) => {
            tracing::info!(decision_id = %decision.id, action = %decision.action, "Decision carried out");
            true
        }
        Err(e) => {
            tracing::warn!(decision_id = %decision.id, action = %decision.action, error = %e, "Decision action failed");
            false
        }
    };

    if let Err(e) = decisions.record_outcome(&decision.id, success).await {
        tracing::debug!(error = %e, "Decision outcome not recorded");
    }
}

/// Run `tick` every `period`, starting one period from now.
fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            tracing::debug!(loop_name = name, "Periodic loop tick");
            tick().await;
        }
    })
}
