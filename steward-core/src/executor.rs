//! Action dispatch seams: the external command executor and in-process functions.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Failure of a single action.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("Command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("Function '{name}' failed: {message}")]
    Function { name: String, message: String },

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Invalid step: {0}")]
    InvalidStep(String),

    #[error("Condition error: {0}")]
    Condition(String),

    #[error("Nested workflow failed: {0}")]
    Workflow(String),

    #[error("Execution stopped")]
    Stopped,
}

impl ExecutionError {
    /// Convenience constructor for executor implementations.
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
        }
    }
}

/// Runs named commands against the outside world (mail, messaging, system
/// maintenance).
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str, params: &Map<String, Value>) -> Result<Value, ExecutionError>;
}

/// Executor that only logs what it would run.
///
/// Used by the standalone binary, which has no real integrations attached.
#[derive(Debug, Default, Clone)]
pub struct LoggingExecutor;

#[async_trait]
impl CommandExecutor for LoggingExecutor {
    async fn execute(&self, command: &str, params: &Map<String, Value>) -> Result<Value, ExecutionError> {
        let params = Value::Object(params.clone());
        tracing::info!(command = %command, params = %params, "Command dispatched");
        Ok(serde_json::json!({ "command": command, "status": "logged" }))
    }
}

/// Registered function: `(context, params) -> value`.
pub type StepFunction =
    Arc<dyn Fn(Map<String, Value>, Map<String, Value>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Named in-process functions callable from workflow steps and tasks.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Arc<RwLock<HashMap<String, StepFunction>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a function.
    pub async fn register<F, Fut>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(Map<String, Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
    {
        let name = name.into();
        let wrapped: StepFunction = Arc::new(move |ctx, params| Box::pin(function(ctx, params)));
        tracing::debug!(function = %name, "Function registered");
        self.functions.write().await.insert(name, wrapped);
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.functions.read().await.contains_key(name)
    }

    /// Invoke a function by name.
    pub async fn call(
        &self,
        name: &str,
        context: Map<String, Value>,
        params: Map<String, Value>,
    ) -> Result<Value, ExecutionError> {
        let function = self
            .functions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutionError::UnknownFunction(name.to_string()))?;

        function(context, params)
            .await
            .map_err(|message| ExecutionError::Function {
                name: name.to_string(),
                message,
            })
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_registry_call() {
        let registry = FunctionRegistry::new();
        registry
            .register("double", |_ctx, params| async move {
                let n = params.get("n").and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(n * 2))
            })
            .await;

        let mut params = Map::new();
        params.insert("n".into(), json!(21));
        let out = registry.call("double", Map::new(), params).await.unwrap();
        assert_eq!(out, json!(42));
        assert!(registry.contains("double").await);
    }

    #[tokio::test]
    async fn test_registry_errors() {
        let registry = FunctionRegistry::new();
        registry
            .register("fail", |_ctx, _params| async move { Err("nope".to_string()) })
            .await;

        let err = registry.call("fail", Map::new(), Map::new()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Function { ref message, .. } if message == "nope"));

        let err = registry.call("missing", Map::new(), Map::new()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::UnknownFunction(_)));
    }

    #[test]
    fn test_logging_executor() {
        let out = tokio_test::block_on(LoggingExecutor.execute("notify_user", &Map::new()));
        let out = tokio_test::assert_ok!(out);
        assert_eq!(out["status"], "logged");
    }
}
