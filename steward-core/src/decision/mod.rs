//! Decision matrix - rule scoring over live factors.
//!
//! Each decision refreshes the factor store, scores every action offered by
//! an applicable rule and returns the best one with a 0-100 confidence.
//!
//! # Flow
//!
//! 1. Refresh factors from the health provider (best effort)
//! 2. Score candidate actions (see [`scoring::score_actions`])
//! 3. Apply the keyword override for communication contexts, which may
//!    auto-approve a rule's action regardless of the threshold
//! 4. Fall back when confidence is below `min_confidence`
//! 5. Record the decision and publish `decision:made`

pub mod rules;
pub mod scoring;

pub use rules::{default_rules, Condition, Operator, Rule};
pub use scoring::{confidence_from_score, score_actions, ActionScore, Scoring, NO_ACTION};

use crate::factors::{FactorSnapshot, FactorStore, HealthProvider};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use steward_common::bus::{publish_best_effort, Event, EventBus, Topic};
use steward_common::{DecisionConfig, Validate, ValidationError};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Number of runner-up actions kept on a decision.
const MAX_ALTERNATIVES: usize = 3;

/// Context type used by the periodic analysis.
pub const CONTINUOUS_ANALYSIS: &str = "continuous_analysis";

/// Keyword overrides, most specific first: `(keyword, rule id)`.
const KEYWORD_RULES: &[(&str, &str)] = &[
    ("whatsapp_auto_response", "whatsapp_auto_response"),
    ("whatsapp", "whatsapp_communication"),
    ("email", "email_communication"),
];

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("Rule already registered: {0}")]
    DuplicateRule(String),

    #[error("Decision not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// What the decision is about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionContext {
    #[serde(rename = "type")]
    pub context_type: String,
    /// Free-form payload. Only `type` participates in rule matching.
    #[serde(default)]
    pub payload: Value,
}

impl DecisionContext {
    pub fn new(context_type: impl Into<String>) -> Self {
        Self {
            context_type: context_type.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionOptions {
    pub min_confidence: Option<u8>,
    pub fallback_action: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub context_type: String,
    pub action: String,
    pub confidence: u8,
    pub score: f64,
    pub alternatives: Vec<ActionScore>,
    pub fallback: bool,
    pub auto_approved: bool,
    pub matched_rules: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Decision {
    /// Whether the decision asks for something to be done.
    pub fn is_actionable(&self) -> bool {
        !self.fallback && self.action != NO_ACTION
    }
}

/// Outcome counts reported back through [`DecisionMatrix::record_outcome`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionStats {
    pub total_decisions: u64,
    pub average_latency_ms: f64,
    pub last_decision: Option<DateTime<Utc>>,
    pub fallback_count: u64,
    pub auto_approved_count: u64,
    /// Action -> reported outcomes.
    pub outcomes: HashMap<String, OutcomeCounts>,
}

// ============================================================================
// Decision Matrix
// ============================================================================

pub struct DecisionMatrix {
    config: DecisionConfig,
    rules: RwLock<Vec<Rule>>,
    factors: Arc<FactorStore>,
    health: Option<Arc<dyn HealthProvider>>,
    history: RwLock<VecDeque<Decision>>,
    stats: RwLock<DecisionStats>,
    bus: Arc<dyn EventBus>,
}

impl DecisionMatrix {
    /// Create a matrix with the built-in rule set.
    pub fn new(config: DecisionConfig, factors: Arc<FactorStore>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            config,
            rules: RwLock::new(default_rules()),
            factors,
            health: None,
            history: RwLock::new(VecDeque::new()),
            stats: RwLock::new(DecisionStats::default()),
            bus,
        }
    }

    /// Create a matrix with no rules.
    pub fn empty(config: DecisionConfig, factors: Arc<FactorStore>, bus: Arc<dyn EventBus>) -> Self {
        let matrix = Self::new(config, factors, bus);
        Self {
            rules: RwLock::new(Vec::new()),
            ..matrix
        }
    }

    pub fn with_health_provider(mut self, provider: Arc<dyn HealthProvider>) -> Self {
        self.health = Some(provider);
        self
    }

    /// Register a rule after validating it.
    pub async fn register_rule(&self, rule: Rule) -> Result<(), DecisionError> {
        rule.validate()?;
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(DecisionError::DuplicateRule(rule.id));
        }
        tracing::info!(rule_id = %rule.id, actions = ?rule.actions, "Rule registered");
        rules.push(rule);
        Ok(())
    }

    pub async fn rules(&self) -> Vec<Rule> {
        self.rules.read().await.clone()
    }

    pub async fn factors(&self) -> FactorSnapshot {
        self.factors.snapshot().await
    }

    /// Decide what to do for `context`. Never fails; problems produce a
    /// fallback decision with `error` set.
    pub async fn make_decision(&self, context: &DecisionContext, options: &DecisionOptions) -> Decision {
        let started = Instant::now();

        self.factors.refresh(self.health.as_deref()).await;
        let snapshot = self.factors.snapshot().await;
        let rules = self.rules.read().await.clone();

        let mut decision = self.evaluate(&rules, &snapshot, context, options);
        decision.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            decision_id = %decision.id,
            context_type = %decision.context_type,
            action = %decision.action,
            confidence = decision.confidence,
            fallback = decision.fallback,
            auto_approved = decision.auto_approved,
            "Decision made"
        );

        self.record(decision.clone()).await;
        decision
    }

    fn evaluate(
        &self,
        rules: &[Rule],
        factors: &FactorSnapshot,
        context: &DecisionContext,
        options: &DecisionOptions,
    ) -> Decision {
        let scoring = score_actions(rules, factors);
        let fallback_action = options
            .fallback_action
            .clone()
            .unwrap_or_else(|| self.config.fallback_action.clone());

        let (action, score) = match scoring.best() {
            Some(best) => (best.action.clone(), best.score),
            None => (NO_ACTION.to_string(), 0.0),
        };

        let mut decision = Decision {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            context_type: context.context_type.clone(),
            action,
            confidence: 0,
            score,
            alternatives: scoring
                .ranked
                .iter()
                .skip(1)
                .take(MAX_ALTERNATIVES)
                .cloned()
                .collect(),
            fallback: false,
            auto_approved: false,
            matched_rules: scoring.matched_rules.clone(),
            error: None,
            duration_ms: 0,
        };

        let Some(confidence) = confidence_from_score(score) else {
            tracing::error!(score = score, "Non-finite decision score");
            decision.error = Some(format!("non-finite score: {score}"));
            decision.action = fallback_action;
            decision.fallback = true;
            return decision;
        };
        decision.confidence = confidence;

        if let Some(rule) = keyword_rule(rules, &context.context_type) {
            let boosted = confidence.saturating_add(rule.confidence_boost).min(100);
            decision.confidence = boosted;

            if rule.auto_approve && boosted >= rule.approval_threshold {
                if let Some(first) = rule.actions.first() {
                    tracing::debug!(rule_id = %rule.id, confidence = boosted, "Auto-approved by rule");
                    decision.alternatives = scoring
                        .ranked
                        .iter()
                        .filter(|a| &a.action != first)
                        .take(MAX_ALTERNATIVES)
                        .cloned()
                        .collect();
                    decision.action = first.clone();
                    decision.auto_approved = true;
                    return decision;
                }
            }
        }

        let min_confidence = options.min_confidence.unwrap_or(self.config.min_confidence);
        if decision.confidence < min_confidence {
            tracing::debug!(
                confidence = decision.confidence,
                min_confidence = min_confidence,
                "Confidence below threshold, using fallback"
            );
            decision.action = fallback_action;
            decision.fallback = true;
        }

        decision
    }

    async fn record(&self, decision: Decision) {
        {
            let mut stats = self.stats.write().await;
            stats.total_decisions += 1;
            stats.average_latency_ms = (stats.average_latency_ms + decision.duration_ms as f64) / 2.0;
            stats.last_decision = Some(decision.timestamp);
            if decision.fallback {
                stats.fallback_count += 1;
            }
            if decision.auto_approved {
                stats.auto_approved_count += 1;
            }
        }

        let event = Event::new(Topic::DecisionMade, "decision")
            .with_correlation_id(decision.id.clone())
            .with_payload(&decision);

        {
            let mut history = self.history.write().await;
            history.push_back(decision);
            while history.len() > self.config.history_cap {
                history.pop_front();
            }
        }

        publish_best_effort(self.bus.as_ref(), event).await;
    }

    /// Most recent decisions, oldest first.
    pub async fn history(&self, limit: usize) -> Vec<Decision> {
        let history = self.history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub async fn statistics(&self) -> DecisionStats {
        self.stats.read().await.clone()
    }

    /// Report how a decision turned out.
    ///
    /// Outcomes are only counted per action; rule weights are not adjusted.
    pub async fn record_outcome(&self, decision_id: &str, success: bool) -> Result<(), DecisionError> {
        let action = self
            .history
            .read()
            .await
            .iter()
            .find(|d| d.id == decision_id)
            .map(|d| d.action.clone())
            .ok_or_else(|| DecisionError::NotFound(decision_id.to_string()))?;

        let mut stats = self.stats.write().await;
        let counts = stats.outcomes.entry(action).or_default();
        if success {
            counts.successes += 1;
        } else {
            counts.failures += 1;
        }
        Ok(())
    }

    /// Periodic analysis pass: refresh and decide on the current state.
    pub async fn run_continuous_analysis(&self) -> Decision {
        tracing::debug!("Running continuous analysis");
        self.make_decision(&DecisionContext::new(CONTINUOUS_ANALYSIS), &DecisionOptions::default())
            .await
    }
}

/// The keyword override rule for a context type, if registered.
fn keyword_rule<'a>(rules: &'a [Rule], context_type: &str) -> Option<&'a Rule> {
    let context_type = context_type.to_lowercase();
    let (_, rule_id) = KEYWORD_RULES
        .iter()
        .find(|(keyword, _)| context_type.contains(keyword))?;
    rules.iter().find(|r| r.id == *rule_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_common::InMemoryBus;

    fn matrix(rules: Vec<Rule>) -> (DecisionMatrix, Arc<FactorStore>) {
        let factors = Arc::new(FactorStore::new());
        let matrix = DecisionMatrix::empty(DecisionConfig::default(), factors.clone(), Arc::new(InMemoryBus::new()));
        *matrix.rules.try_write().unwrap() = rules;
        (matrix, factors)
    }

    #[tokio::test]
    async fn test_no_rules_falls_back() {
        let (matrix, _) = matrix(Vec::new());
        let decision = matrix
            .make_decision(&DecisionContext::new("anything"), &DecisionOptions::default())
            .await;
        assert_eq!(decision.action, NO_ACTION);
        assert_eq!(decision.confidence, 0);
        assert!(decision.fallback);
        assert!(!decision.is_actionable());
    }

    #[tokio::test]
    async fn test_fallback_action_override() {
        let (matrix, factors) = matrix(vec![Rule::new("r", &["act"])
            .when("x", Operator::Gt(0.1))
            .when("y", Operator::Gt(0.1))]);
        factors.set("x", 0.5).await;
        let options = DecisionOptions {
            min_confidence: Some(101),
            fallback_action: Some("ask_user".into()),
        };
        let decision = matrix.make_decision(&DecisionContext::new("t"), &options).await;
        assert_eq!(decision.action, "ask_user");
        assert!(decision.fallback);
    }

    #[tokio::test]
    async fn test_alternatives_are_capped() {
        let (matrix, _) = matrix(vec![Rule::new("many", &["a", "b", "c", "d", "e"])]);
        let decision = matrix
            .make_decision(&DecisionContext::new("t"), &DecisionOptions::default())
            .await;
        assert_eq!(decision.action, "a");
        assert_eq!(decision.confidence, 100);
        assert_eq!(decision.alternatives.len(), MAX_ALTERNATIVES);
    }

    #[tokio::test]
    async fn test_keyword_boost_without_auto_approve() {
        let (matrix, factors) = matrix(vec![
            Rule::new("whatsapp_communication", &["send_whatsapp"])
                .when("integrations.whatsapp", Operator::Gte(0.5))
                .when("user.activity", Operator::Lt(0.9))
                .with_boost(15),
            Rule::new("other", &["send_whatsapp"])
                .when("never", Operator::Gt(0.5))
                .with_weight(3.0),
        ]);
        factors.set("integrations.whatsapp", 1.0).await;
        // send_whatsapp: (1.0 * 1 + 0.0 * 3) / 4 = 0.25 -> 25, boosted to 40.
        let decision = matrix
            .make_decision(&DecisionContext::new("whatsapp_message"), &DecisionOptions::default())
            .await;
        assert_eq!(decision.action, "send_whatsapp");
        assert_eq!(decision.confidence, 40);
        assert!(!decision.fallback);
        assert!(!decision.auto_approved);
    }

    #[tokio::test]
    async fn test_register_rule_rejects_duplicates_and_invalid() {
        let (matrix, _) = matrix(Vec::new());
        matrix.register_rule(Rule::new("r", &["a"])).await.unwrap();
        assert!(matches!(
            matrix.register_rule(Rule::new("r", &["b"])).await,
            Err(DecisionError::DuplicateRule(_))
        ));
        assert!(matches!(
            matrix.register_rule(Rule::new("bad", &[])).await,
            Err(DecisionError::Validation(_))
        ));
        assert_eq!(matrix.rules().await.len(), 1);
    }

    #[tokio::test]
    async fn test_record_outcome_counts_per_action() {
        let (matrix, _) = matrix(vec![Rule::new("r", &["act"])]);
        let decision = matrix
            .make_decision(&DecisionContext::new("t"), &DecisionOptions::default())
            .await;
        matrix.record_outcome(&decision.id, true).await.unwrap();
        matrix.record_outcome(&decision.id, false).await.unwrap();
        assert!(matrix.record_outcome("missing", true).await.is_err());

        let stats = matrix.statistics().await;
        assert_eq!(stats.total_decisions, 1);
        assert_eq!(stats.outcomes["act"].successes, 1);
        assert_eq!(stats.outcomes["act"].failures, 1);
    }

    #[tokio::test]
    async fn test_decision_event_published() {
        let factors = Arc::new(FactorStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
        let mut receiver = bus.subscribe(Topic::DecisionMade).await.unwrap();
        let matrix = DecisionMatrix::new(DecisionConfig::default(), factors, bus);

        let decision = matrix.run_continuous_analysis().await;
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.correlation_id.as_deref(), Some(decision.id.as_str()));
        assert_eq!(event.payload["context_type"], CONTINUOUS_ANALYSIS);
    }
}
