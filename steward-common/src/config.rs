//! Configuration management for Steward.
//!
//! The orchestration core reads a single file at `~/.steward/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (STEWARD_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `STEWARD_LOG_LEVEL` → observability.log_level
//! - `STEWARD_LOG_FORMAT` → observability.log_format
//! - `STEWARD_MIN_CONFIDENCE` → decision.min_confidence
//! - `STEWARD_EXCLUSIVE_EXECUTION` → workflow.exclusive_execution, scheduler.exclusive_execution
//! - `STEWARD_DEFINITIONS` → definitions_path

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".steward"),
        |dirs| dirs.home_dir().join(".steward"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// JSON Schema reference
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Logging configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Decision matrix configuration
    #[serde(default)]
    pub decision: DecisionConfig,

    /// Workflow engine configuration
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// Task scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Controller configuration
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Optional YAML file with workflow and task definitions loaded at startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definitions_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("STEWARD_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(format) = std::env::var("STEWARD_LOG_FORMAT") {
            self.observability.log_format = format;
        }
        if let Ok(raw) = std::env::var("STEWARD_MIN_CONFIDENCE") {
            match raw.parse() {
                Ok(value) => self.decision.min_confidence = value,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid STEWARD_MIN_CONFIDENCE"),
            }
        }
        if let Ok(raw) = std::env::var("STEWARD_EXCLUSIVE_EXECUTION") {
            let exclusive = matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on");
            self.workflow.exclusive_execution = exclusive;
            self.scheduler.exclusive_execution = exclusive;
        }
        if let Ok(path) = std::env::var("STEWARD_DEFINITIONS") {
            let expanded = shellexpand::tilde(&path).into_owned();
            self.definitions_path = Some(PathBuf::from(expanded));
        }
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).with_context(|| {
                    format!("Failed to create config directory {}", dir.display())
                })?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}

// ============================================================================
// Observability
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets demoted to `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Decision Matrix
// ============================================================================

/// Decision matrix configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// Minimum confidence (0-100) a decision needs to avoid the fallback path
    #[serde(default = "default_min_confidence")]
    pub min_confidence: u8,

    /// Action returned when no rule clears the confidence bar
    #[serde(default = "default_fallback_action")]
    pub fallback_action: String,

    /// Maximum number of decisions retained in history
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,

    /// Interval of the continuous analysis loop
    #[serde(default = "default_analysis_interval")]
    pub analysis_interval_secs: u64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            fallback_action: default_fallback_action(),
            history_cap: default_history_cap(),
            analysis_interval_secs: default_analysis_interval(),
        }
    }
}

impl DecisionConfig {
    pub fn analysis_interval(&self) -> Duration {
        Duration::from_secs(self.analysis_interval_secs)
    }
}

fn default_min_confidence() -> u8 {
    30
}

fn default_fallback_action() -> String {
    "no_action".into()
}

fn default_history_cap() -> usize {
    1000
}

fn default_analysis_interval() -> u64 {
    300
}

// ============================================================================
// Workflow Engine
// ============================================================================

/// Workflow engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Base delay for linear retry backoff (attempt × base)
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Delay before the single auto-recovery re-run
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,

    /// Maximum number of executions kept in memory
    #[serde(default = "default_history_cap")]
    pub execution_history_cap: usize,

    /// Maximum sub-workflow nesting depth
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,

    /// Reject overlapping executions of the same workflow
    #[serde(default)]
    pub exclusive_execution: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: default_retry_base_delay_ms(),
            recovery_delay_ms: default_recovery_delay_ms(),
            execution_history_cap: default_history_cap(),
            max_nesting_depth: default_max_nesting_depth(),
            exclusive_execution: false,
        }
    }
}

impl WorkflowConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_recovery_delay_ms() -> u64 {
    5000
}

fn default_max_nesting_depth() -> usize {
    8
}

// ============================================================================
// Task Scheduler
// ============================================================================

/// Task scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval of the pattern analysis loop
    #[serde(default = "default_pattern_interval")]
    pub pattern_analysis_interval_secs: u64,

    /// Interval of the auto-optimization pass
    #[serde(default = "default_optimization_interval")]
    pub optimization_interval_secs: u64,

    /// Maximum number of task execution records kept for analysis
    #[serde(default = "default_history_cap")]
    pub execution_history_cap: usize,

    /// Tasks idle for longer than this are pruned by the optimizer
    #[serde(default = "default_inactive_after_days")]
    pub inactive_after_days: i64,

    /// Average duration above which the optimizer requests a system optimization
    #[serde(default = "default_slow_task_threshold_ms")]
    pub slow_task_threshold_ms: u64,

    /// Success rate (percent) below which the optimizer requests a system optimization
    #[serde(default = "default_optimize_success_rate_floor")]
    pub optimize_success_rate_floor: f64,

    /// Skip a firing while the previous run of the same task is still in flight
    #[serde(default)]
    pub exclusive_execution: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pattern_analysis_interval_secs: default_pattern_interval(),
            optimization_interval_secs: default_optimization_interval(),
            execution_history_cap: default_history_cap(),
            inactive_after_days: default_inactive_after_days(),
            slow_task_threshold_ms: default_slow_task_threshold_ms(),
            optimize_success_rate_floor: default_optimize_success_rate_floor(),
            exclusive_execution: false,
        }
    }
}

impl SchedulerConfig {
    pub fn pattern_analysis_interval(&self) -> Duration {
        Duration::from_secs(self.pattern_analysis_interval_secs)
    }

    pub fn optimization_interval(&self) -> Duration {
        Duration::from_secs(self.optimization_interval_secs)
    }
}

fn default_pattern_interval() -> u64 {
    3600
}

fn default_optimization_interval() -> u64 {
    6 * 3600
}

fn default_inactive_after_days() -> i64 {
    30
}

fn default_slow_task_threshold_ms() -> u64 {
    30_000
}

fn default_optimize_success_rate_floor() -> f64 {
    80.0
}

// ============================================================================
// Controller
// ============================================================================

/// Autonomous controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Interval of the health polling loop
    #[serde(default = "default_health_poll_interval")]
    pub health_poll_interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            health_poll_interval_secs: default_health_poll_interval(),
        }
    }
}

impl ControllerConfig {
    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_secs(self.health_poll_interval_secs)
    }
}

fn default_health_poll_interval() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.decision.min_confidence, 30);
        assert_eq!(config.decision.history_cap, 1000);
        assert_eq!(config.decision.fallback_action, "no_action");
        assert_eq!(config.workflow.retry_base_delay(), Duration::from_secs(1));
        assert_eq!(config.scheduler.pattern_analysis_interval_secs, 3600);
        assert_eq!(config.controller.health_poll_interval_secs, 30);
        assert!(!config.workflow.exclusive_execution);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"decision": {"min_confidence": 55}, "observability": {"format": "json"}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.decision.min_confidence, 55);
        assert_eq!(config.decision.history_cap, 1000);
        assert_eq!(config.observability.log_format, "json");
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.workflow.recovery_delay_ms = 250;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.workflow.recovery_delay_ms, 250);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
