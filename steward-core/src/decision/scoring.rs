//! Action scoring over a rule set.

use super::rules::Rule;
use crate::factors::FactorSnapshot;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Action name used when nothing applies.
pub const NO_ACTION: &str = "no_action";

/// Scored candidate action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionScore {
    pub action: String,
    pub score: f64,
    /// Highest priority among the rules offering this action.
    #[serde(default)]
    pub priority: i32,
}

/// Outcome of scoring every rule against a factor snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Scoring {
    /// Rules whose conditions all hold, in registration order.
    pub matched_rules: Vec<String>,
    /// Candidates, best first.
    pub ranked: Vec<ActionScore>,
}

impl Scoring {
    pub fn best(&self) -> Option<&ActionScore> {
        self.ranked.first()
    }
}

/// Score every action offered by an applicable rule.
///
/// An action's score is the weighted mean, over all rules that list it, of
/// each rule's satisfied-condition fraction. Ties go to the higher priority,
/// then to the action first seen in registration order.
pub fn score_actions(rules: &[Rule], factors: &FactorSnapshot) -> Scoring {
    let applicable: Vec<&Rule> = rules.iter().filter(|r| r.is_applicable(factors)).collect();
    let matched_rules = applicable.iter().map(|r| r.id.clone()).collect();

    let mut universe: Vec<&str> = Vec::new();
    for rule in &applicable {
        for action in &rule.actions {
            if !universe.contains(&action.as_str()) {
                universe.push(action);
            }
        }
    }

    let mut ranked: Vec<(usize, ActionScore)> = universe
        .into_iter()
        .enumerate()
        .map(|(order, action)| {
            let mut weighted = 0.0;
            let mut total_weight = 0.0;
            let mut priority = i32::MIN;
            for rule in rules.iter().filter(|r| r.has_action(action)) {
                weighted += rule.weight * rule.satisfied_fraction(factors);
                total_weight += rule.weight;
                priority = priority.max(rule.priority);
            }
            let score = if total_weight > 0.0 {
                weighted / total_weight
            } else {
                0.0
            };
            (
                order,
                ActionScore {
                    action: action.to_string(),
                    score,
                    priority,
                },
            )
        })
        .collect();

    ranked.sort_by(|(order_a, a), (order_b, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| order_a.cmp(order_b))
    });

    Scoring {
        matched_rules,
        ranked: ranked.into_iter().map(|(_, s)| s).collect(),
    }
}

/// Map a score in `[0, 1]` to an integer confidence in `[0, 100]`.
///
/// Non-finite scores map to `None`.
pub fn confidence_from_score(score: f64) -> Option<u8> {
    if !score.is_finite() {
        return None;
    }
    Some((score * 100.0).round().clamp(0.0, 100.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::rules::Operator;
    use proptest::prelude::*;

    fn snapshot(entries: &[(&str, f64)]) -> FactorSnapshot {
        entries.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn test_conjunction_required_for_applicability() {
        let rules = vec![Rule::new("r", &["act"])
            .when("a", Operator::Gt(0.5))
            .when("b", Operator::Gt(0.5))];

        let partial = score_actions(&rules, &snapshot(&[("a", 0.9), ("b", 0.1)]));
        assert!(partial.matched_rules.is_empty());
        assert!(partial.best().is_none());

        let full = score_actions(&rules, &snapshot(&[("a", 0.9), ("b", 0.9)]));
        assert_eq!(full.matched_rules, vec!["r"]);
        assert_eq!(full.best().unwrap().score, 1.0);
    }

    #[test]
    fn test_score_averages_over_all_rules_listing_action() {
        let rules = vec![
            Rule::new("strong", &["optimize"]).when("mem", Operator::Gt(0.8)),
            Rule::new("weak", &["optimize"])
                .when("mem", Operator::Gt(0.8))
                .when("disk", Operator::Gt(0.8))
                .with_weight(3.0),
        ];
        let scoring = score_actions(&rules, &snapshot(&[("mem", 0.9), ("disk", 0.1)]));
        // (1.0 * 1 + 0.5 * 3) / 4
        let best = scoring.best().unwrap();
        assert_eq!(best.action, "optimize");
        assert!((best.score - 0.625).abs() < 1e-9);
    }

    #[test]
    fn test_ties_prefer_priority_then_order() {
        let rules = vec![
            Rule::new("first", &["a"]).with_priority(1),
            Rule::new("second", &["b"]).with_priority(5),
            Rule::new("third", &["c"]).with_priority(5),
        ];
        let scoring = score_actions(&rules, &snapshot(&[]));
        let order: Vec<_> = scoring.ranked.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_non_finite_score() {
        assert_eq!(confidence_from_score(f64::NAN), None);
        assert_eq!(confidence_from_score(f64::INFINITY), None);
        assert_eq!(confidence_from_score(0.625), Some(63));
    }

    proptest! {
        #[test]
        fn confidence_always_within_bounds(score in proptest::num::f64::ANY) {
            if let Some(confidence) = confidence_from_score(score) {
                prop_assert!(confidence <= 100);
            } else {
                prop_assert!(!score.is_finite());
            }
        }
    }
}
