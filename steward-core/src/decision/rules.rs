//! Decision rules and their conditions.

use crate::factors::FactorSnapshot;
use serde::{Deserialize, Serialize};
use steward_common::{Validate, ValidationError, ValidationResult};

/// Tolerance used by the `=` operator.
const EQ_EPSILON: f64 = 1e-9;

/// Comparison applied to a factor value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operator", content = "value")]
pub enum Operator {
    #[serde(rename = ">")]
    Gt(f64),
    #[serde(rename = "<")]
    Lt(f64),
    #[serde(rename = ">=")]
    Gte(f64),
    #[serde(rename = "<=")]
    Lte(f64),
    #[serde(rename = "=")]
    Eq(f64),
    /// Inclusive range `[lo, hi]`.
    #[serde(rename = "between")]
    Between(f64, f64),
}

impl Operator {
    pub fn matches(&self, actual: f64) -> bool {
        match *self {
            Operator::Gt(t) => actual > t,
            Operator::Lt(t) => actual < t,
            Operator::Gte(t) => actual >= t,
            Operator::Lte(t) => actual <= t,
            Operator::Eq(t) => (actual - t).abs() < EQ_EPSILON,
            Operator::Between(lo, hi) => actual >= lo && actual <= hi,
        }
    }
}

/// `factor <operator> threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub factor: String,
    #[serde(flatten)]
    pub operator: Operator,
}

impl Condition {
    pub fn new(factor: impl Into<String>, operator: Operator) -> Self {
        Self {
            factor: factor.into(),
            operator,
        }
    }

    pub fn holds(&self, factors: &FactorSnapshot) -> bool {
        self.operator.matches(factors.get(&self.factor))
    }
}

/// A decision rule: when all conditions hold, its actions become candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub actions: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub confidence_boost: u8,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default = "default_approval_threshold")]
    pub approval_threshold: u8,
}

fn default_weight() -> f64 {
    1.0
}

fn default_approval_threshold() -> u8 {
    100
}

impl Rule {
    pub fn new(id: impl Into<String>, actions: &[&str]) -> Self {
        Self {
            id: id.into(),
            conditions: Vec::new(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
            priority: 0,
            weight: default_weight(),
            confidence_boost: 0,
            auto_approve: false,
            approval_threshold: default_approval_threshold(),
        }
    }

    pub fn when(mut self, factor: &str, operator: Operator) -> Self {
        self.conditions.push(Condition::new(factor, operator));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_boost(mut self, boost: u8) -> Self {
        self.confidence_boost = boost;
        self
    }

    /// Allow the keyword override to bypass the confidence threshold.
    pub fn auto_approve(mut self, threshold: u8) -> Self {
        self.auto_approve = true;
        self.approval_threshold = threshold;
        self
    }

    /// Whether every condition holds.
    pub fn is_applicable(&self, factors: &FactorSnapshot) -> bool {
        self.conditions.iter().all(|c| c.holds(factors))
    }

    /// Fraction of conditions satisfied; 1.0 for an unconditional rule.
    pub fn satisfied_fraction(&self, factors: &FactorSnapshot) -> f64 {
        if self.conditions.is_empty() {
            return 1.0;
        }
        let met = self.conditions.iter().filter(|c| c.holds(factors)).count();
        met as f64 / self.conditions.len() as f64
    }

    pub fn has_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }
}

impl Validate for Rule {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push(ValidationError::missing("id"));
        }
        if self.actions.is_empty() || self.actions.iter().any(|a| a.trim().is_empty()) {
            errors.push(ValidationError::invalid(
                "actions",
                "at least one non-empty action is required",
            ));
        }
        if !self.weight.is_finite() || self.weight <= 0.0 {
            errors.push(ValidationError::invalid("weight", "must be finite and positive"));
        }
        if self.approval_threshold > 100 {
            errors.push(ValidationError::invalid("approval_threshold", "must be at most 100"));
        }
        for condition in &self.conditions {
            if condition.factor.trim().is_empty() {
                errors.push(ValidationError::missing("conditions.factor"));
            }
            if let Operator::Between(lo, hi) = condition.operator {
                if lo > hi {
                    errors.push(ValidationError::invalid(
                        format!("conditions.{}", condition.factor),
                        format!("between bounds out of order: {lo} > {hi}"),
                    ));
                }
            }
        }

        ValidationError::collect(errors)
    }
}

/// Built-in rule set installed at construction.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new("email_communication", &["send_email"])
            .when("integrations.gmail", Operator::Gte(0.5))
            .when("system.health", Operator::Gte(0.5))
            .with_priority(5)
            .with_boost(20)
            .auto_approve(70),
        Rule::new("whatsapp_communication", &["send_whatsapp"])
            .when("integrations.whatsapp", Operator::Gte(0.5))
            .with_priority(5)
            .with_boost(15),
        Rule::new("whatsapp_auto_response", &["send_whatsapp_auto_response"])
            .when("integrations.whatsapp", Operator::Gte(0.5))
            .when("user.activity", Operator::Lt(0.3))
            .with_priority(6)
            .with_boost(25)
            .auto_approve(60),
        Rule::new("system_optimization", &["system_optimize"])
            .when("system.memory", Operator::Gt(0.8))
            .with_priority(7)
            .with_weight(1.5),
        Rule::new("resource_cleanup", &["cleanup_storage", "system_optimize"])
            .when("system.disk", Operator::Gt(0.85))
            .with_priority(6),
        Rule::new("critical_alert", &["notify_user", "system_optimize"])
            .when("system.health", Operator::Lt(0.3))
            .with_priority(10)
            .with_weight(2.0),
        Rule::new("workflow_recovery", &["retry_workflow", "notify_user"])
            .when("system.health", Operator::Between(0.3, 0.8))
            .with_priority(8),
        Rule::new("idle_maintenance", &["run_maintenance"])
            .when("user.activity", Operator::Lt(0.2))
            .when("environment.business_hours", Operator::Lt(0.5))
            .with_priority(2),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Operator::Gt(0.5), 0.6, true; "gt above")]
    #[test_case(Operator::Gt(0.5), 0.5, false; "gt equal")]
    #[test_case(Operator::Lt(0.5), 0.4, true; "lt below")]
    #[test_case(Operator::Gte(0.5), 0.5, true; "gte equal")]
    #[test_case(Operator::Lte(0.5), 0.51, false; "lte above")]
    #[test_case(Operator::Eq(0.3), 0.1 + 0.2, true; "eq float tolerance")]
    #[test_case(Operator::Between(0.3, 0.8), 0.3, true; "between lower bound")]
    #[test_case(Operator::Between(0.3, 0.8), 0.8, true; "between upper bound")]
    #[test_case(Operator::Between(0.3, 0.8), 0.81, false; "between outside")]
    fn test_operator(op: Operator, actual: f64, expected: bool) {
        assert_eq!(op.matches(actual), expected);
    }

    #[test]
    fn test_condition_serde_shape() {
        let cond: Condition = serde_json::from_value(serde_json::json!({
            "factor": "system.health",
            "operator": "between",
            "value": [0.3, 0.8]
        }))
        .unwrap();
        assert_eq!(cond.operator, Operator::Between(0.3, 0.8));

        let cond: Condition = serde_json::from_value(serde_json::json!({
            "factor": "system.memory",
            "operator": ">",
            "value": 0.8
        }))
        .unwrap();
        assert_eq!(cond.operator, Operator::Gt(0.8));
    }

    #[test]
    fn test_validation() {
        assert!(Rule::new("ok", &["a"]).validate().is_ok());
        assert!(Rule::new("", &["a"]).validate().is_err());
        assert!(Rule::new("x", &[]).validate().is_err());
        assert!(Rule::new("x", &["a"]).with_weight(0.0).validate().is_err());
        assert!(Rule::new("x", &["a"])
            .when("f", Operator::Between(0.9, 0.1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_default_rules_are_valid_and_unique() {
        let rules = default_rules();
        let mut ids: Vec<_> = rules.iter().map(|r| r.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), rules.len());
        for rule in &rules {
            assert!(rule.validate().is_ok(), "{} invalid", rule.id);
        }
    }
}
