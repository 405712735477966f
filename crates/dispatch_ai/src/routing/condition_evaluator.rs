//! Pure scoring of routing conditions against a request.
//!
//! Each condition scores 0..=100. A rule's aggregate is the weighted sum of
//! its condition scores; the router never reads any state here.

use crate::types::{
    AvailabilityTier, ConditionKind, RoutingPriority, RoutingRequest, RoutingRule,
};

pub const FULL_MATCH: f64 = 100.0;
pub const PARTIAL_MATCH: f64 = 50.0;
pub const HIGH_AVAILABILITY_SCORE: f64 = 80.0;
pub const STANDARD_AVAILABILITY_SCORE: f64 = 50.0;

/// Aggregate result of scoring one rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleScore {
    /// Sum of `score * weight` over all conditions.
    pub aggregate: f64,
    /// Conditions that scored above zero.
    pub matched: usize,
}

impl RuleScore {
    pub fn is_match(&self) -> bool {
        self.matched > 0
    }
}

/// Score of a single condition, 0..=100.
pub fn score_condition(condition: &ConditionKind, request: &RoutingRequest) -> f64 {
    match condition {
        ConditionKind::Capability { operator, value } => {
            if request
                .capabilities
                .iter()
                .any(|cap| operator.matches(cap, value))
            {
                FULL_MATCH
            } else {
                0.0
            }
        }
        ConditionKind::Cost { .. } | ConditionKind::Performance { .. } => {
            match (condition.priority_tier(), request.priority) {
                (_, None) => 0.0,
                (_, Some(RoutingPriority::Balanced)) => PARTIAL_MATCH,
                (Some(tier), Some(wanted)) if tier == wanted => FULL_MATCH,
                _ => 0.0,
            }
        }
        ConditionKind::Latency { operator, value } => match request.max_latency() {
            Some(budget) if operator.holds(budget, *value) => FULL_MATCH,
            _ => 0.0,
        },
        ConditionKind::Availability { value } => match value {
            AvailabilityTier::High => HIGH_AVAILABILITY_SCORE,
            AvailabilityTier::Standard | AvailabilityTier::Low => STANDARD_AVAILABILITY_SCORE,
        },
        ConditionKind::Geographic { operator, value } => match request.geographic.as_deref() {
            Some(region) if operator.matches(region, value) => FULL_MATCH,
            _ => 0.0,
        },
    }
}

/// Requested capabilities matched by the rule's capability conditions. A
/// model routed through the rule must offer every one of them.
pub fn required_capabilities<'r>(rule: &RoutingRule, request: &'r RoutingRequest) -> Vec<&'r str> {
    request
        .capabilities
        .iter()
        .filter(|cap| {
            rule.conditions.iter().any(|cond| match &cond.kind {
                ConditionKind::Capability { operator, value } => operator.matches(cap, value),
                _ => false,
            })
        })
        .map(String::as_str)
        .collect()
}

pub fn score_rule(rule: &RoutingRule, request: &RoutingRequest) -> RuleScore {
    rule.conditions
        .iter()
        .fold(RuleScore { aggregate: 0.0, matched: 0 }, |acc, cond| {
            let score = score_condition(&cond.kind, request);
            RuleScore {
                aggregate: acc.aggregate + score * cond.weight,
                matched: acc.matched + usize::from(score > 0.0),
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Comparator, MatchOperator, RoutingCondition, RoutingStrategy};
    use chrono::Utc;

    fn cost_ceiling() -> ConditionKind {
        ConditionKind::Cost {
            operator: Comparator::LessThan,
            value: 0.01,
        }
    }

    fn perf_floor() -> ConditionKind {
        ConditionKind::Performance {
            operator: Comparator::GreaterThan,
            value: 80.0,
        }
    }

    fn rule(conditions: Vec<RoutingCondition>) -> RoutingRule {
        let now = Utc::now();
        RoutingRule {
            id: "r".into(),
            name: "r".into(),
            strategy: RoutingStrategy::Custom,
            is_active: true,
            conditions,
            targets: vec![],
            fallback_model: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn capability_equals_and_contains() {
        let req = RoutingRequest::new().with_capability("Text-Generation");
        let equals = ConditionKind::Capability {
            operator: MatchOperator::Equals,
            value: "text-generation".into(),
        };
        let contains = ConditionKind::Capability {
            operator: MatchOperator::Contains,
            value: "generation".into(),
        };
        let miss = ConditionKind::Capability {
            operator: MatchOperator::Equals,
            value: "vision".into(),
        };
        assert_eq!(score_condition(&equals, &req), FULL_MATCH);
        assert_eq!(score_condition(&contains, &req), FULL_MATCH);
        assert_eq!(score_condition(&miss, &req), 0.0);
    }

    #[test]
    fn cost_condition_follows_priority() {
        let cond = cost_ceiling();
        let score = |p: Option<RoutingPriority>| {
            let mut req = RoutingRequest::new();
            req.priority = p;
            score_condition(&cond, &req)
        };
        assert_eq!(score(Some(RoutingPriority::Cost)), FULL_MATCH);
        assert_eq!(score(Some(RoutingPriority::Balanced)), PARTIAL_MATCH);
        assert_eq!(score(Some(RoutingPriority::Performance)), 0.0);
        assert_eq!(score(None), 0.0);
    }

    #[test]
    fn performance_condition_mirrors_cost() {
        let cond = perf_floor();
        let perf = RoutingRequest::new().with_priority(RoutingPriority::Performance);
        let cost = RoutingRequest::new().with_priority(RoutingPriority::Cost);
        let balanced = RoutingRequest::new().with_priority(RoutingPriority::Balanced);
        assert_eq!(score_condition(&cond, &perf), FULL_MATCH);
        assert_eq!(score_condition(&cond, &cost), 0.0);
        assert_eq!(score_condition(&cond, &balanced), PARTIAL_MATCH);
    }

    #[test]
    fn latency_compares_request_budget() {
        let cond = ConditionKind::Latency {
            operator: Comparator::LessOrEqual,
            value: 1000.0,
        };
        assert_eq!(
            score_condition(&cond, &RoutingRequest::new().with_max_latency(500.0)),
            FULL_MATCH
        );
        assert_eq!(
            score_condition(&cond, &RoutingRequest::new().with_max_latency(2000.0)),
            0.0
        );
        assert_eq!(score_condition(&cond, &RoutingRequest::new()), 0.0);
    }

    #[test]
    fn availability_is_request_independent() {
        let req = RoutingRequest::new();
        let high = ConditionKind::Availability {
            value: AvailabilityTier::High,
        };
        let std = ConditionKind::Availability {
            value: AvailabilityTier::Standard,
        };
        assert_eq!(score_condition(&high, &req), 80.0);
        assert_eq!(score_condition(&std, &req), 50.0);
    }

    #[test]
    fn geographic_matches_region() {
        let cond = ConditionKind::Geographic {
            operator: MatchOperator::Contains,
            value: "eu".into(),
        };
        assert_eq!(
            score_condition(&cond, &RoutingRequest::new().with_geographic("eu-west-1")),
            FULL_MATCH
        );
        assert_eq!(
            score_condition(&cond, &RoutingRequest::new().with_geographic("us-east-1")),
            0.0
        );
        assert_eq!(score_condition(&cond, &RoutingRequest::new()), 0.0);
    }

    #[test]
    fn rule_score_sums_weighted_conditions() {
        let r = rule(vec![
            RoutingCondition::new(cost_ceiling(), 2.0),
            RoutingCondition::new(perf_floor(), 1.0),
        ]);
        let req = RoutingRequest::new().with_priority(RoutingPriority::Cost);
        let score = score_rule(&r, &req);
        assert_eq!(score.aggregate, 200.0);
        assert_eq!(score.matched, 1);
        assert!(score.is_match());
    }

    #[test]
    fn rule_without_conditions_never_matches() {
        let score = score_rule(&rule(vec![]), &RoutingRequest::new());
        assert!(!score.is_match());
        assert_eq!(score.aggregate, 0.0);
    }
}
