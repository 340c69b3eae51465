//! Steward - autonomous orchestration service entry point.

use anyhow::{Context, Result};
use std::sync::Arc;
use steward_common::logging::init_logging_with_exclusions;
use steward_common::Config;
use steward_core::{AutonomousController, LoggingExecutor};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load_and_validate()?;

    // Initialize logging
    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Steward v{}", env!("CARGO_PKG_VERSION"));

    let definitions = config.definitions_path.clone();
    let controller = AutonomousController::new(config, Arc::new(LoggingExecutor));

    if let Some(path) = definitions {
        let loaded = controller
            .load_definitions(&path)
            .await
            .with_context(|| format!("Failed to load definitions from {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            workflows = loaded.workflows.len(),
            tasks = loaded.tasks.len(),
            "Startup definitions registered"
        );
    }

    controller.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    controller.shutdown().await;

    Ok(())
}
