//! Validation for configuration sections and registration payloads.
//!
//! The same `ValidationError` is used when rejecting a malformed task,
//! workflow or rule at registration time.

use thiserror::Error;

use crate::config::{
    Config, ControllerConfig, DecisionConfig, ObservabilityConfig, SchedulerConfig,
    WorkflowConfig,
};

/// Validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Conflict: {reason}")]
    Conflict { reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

impl ValidationError {
    /// Shorthand for [`ValidationError::MissingField`].
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Shorthand for [`ValidationError::InvalidValue`].
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Collapse a list of errors into a single result.
    pub fn collect(mut errors: Vec<ValidationError>) -> ValidationResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ValidationError::Multiple(errors)),
        }
    }
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections and payloads.
pub trait Validate {
    /// Validate this value.
    fn validate(&self) -> ValidationResult<()>;
}

impl Validate for Config {
    fn validate(&self) -> ValidationResult<()> {
        let results = [
            self.observability.validate(),
            self.decision.validate(),
            self.workflow.validate(),
            self.scheduler.validate(),
            self.controller.validate(),
        ];

        ValidationError::collect(results.into_iter().filter_map(Result::err).collect())
    }
}

impl Config {
    /// Load, apply environment overrides and validate configuration.
    pub fn load_and_validate() -> anyhow::Result<Self> {
        let config = Self::load_with_env()?;
        Validate::validate(&config).map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(config)
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::invalid(
                "observability.log_level",
                format!("must be one of {valid_levels:?}"),
            ));
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ValidationError::invalid(
                "observability.log_format",
                "must be \"json\" or \"pretty\"",
            ));
        }

        Ok(())
    }
}

impl Validate for DecisionConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if self.min_confidence > 100 {
            errors.push(ValidationError::invalid(
                "decision.min_confidence",
                "must be between 0 and 100",
            ));
        }
        if self.fallback_action.trim().is_empty() {
            errors.push(ValidationError::missing("decision.fallback_action"));
        }
        if self.history_cap == 0 {
            errors.push(ValidationError::invalid("decision.history_cap", "must be positive"));
        }
        if self.analysis_interval_secs == 0 {
            errors.push(ValidationError::invalid(
                "decision.analysis_interval_secs",
                "must be positive",
            ));
        }

        ValidationError::collect(errors)
    }
}

impl Validate for WorkflowConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if self.execution_history_cap == 0 {
            errors.push(ValidationError::invalid(
                "workflow.execution_history_cap",
                "must be positive",
            ));
        }
        if self.max_nesting_depth == 0 {
            errors.push(ValidationError::invalid(
                "workflow.max_nesting_depth",
                "must be positive",
            ));
        }

        ValidationError::collect(errors)
    }
}

impl Validate for SchedulerConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if self.pattern_analysis_interval_secs == 0 {
            errors.push(ValidationError::invalid(
                "scheduler.pattern_analysis_interval_secs",
                "must be positive",
            ));
        }
        if self.optimization_interval_secs == 0 {
            errors.push(ValidationError::invalid(
                "scheduler.optimization_interval_secs",
                "must be positive",
            ));
        }
        if self.execution_history_cap == 0 {
            errors.push(ValidationError::invalid(
                "scheduler.execution_history_cap",
                "must be positive",
            ));
        }
        if self.inactive_after_days <= 0 {
            errors.push(ValidationError::invalid(
                "scheduler.inactive_after_days",
                "must be positive",
            ));
        }
        if !(0.0..=100.0).contains(&self.optimize_success_rate_floor) {
            errors.push(ValidationError::invalid(
                "scheduler.optimize_success_rate_floor",
                "must be between 0 and 100",
            ));
        }

        ValidationError::collect(errors)
    }
}

impl Validate for ControllerConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.health_poll_interval_secs == 0 {
            return Err(ValidationError::invalid(
                "controller.health_poll_interval_secs",
                "must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Validate::validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_min_confidence_out_of_range() {
        let mut config = Config::default();
        config.decision.min_confidence = 120;
        let err = Validate::validate(&config).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { ref field, .. } if field == "decision.min_confidence"));
    }

    #[test]
    fn test_multiple_errors_are_collected() {
        let mut config = Config::default();
        config.observability.log_format = "xml".into();
        config.scheduler.execution_history_cap = 0;
        config.controller.health_poll_interval_secs = 0;

        match Validate::validate(&config) {
            Err(ValidationError::Multiple(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("Expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_collect_single_error_is_unwrapped() {
        let result = ValidationError::collect(vec![ValidationError::missing("name")]);
        assert!(matches!(result, Err(ValidationError::MissingField { .. })));
    }
}
