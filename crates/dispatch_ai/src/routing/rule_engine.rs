//! Rule-based model selection.
//!
//! 1. Score every active rule against the request and keep those with at
//!    least one matching condition.
//! 2. The highest aggregate wins; the first rule wins ties.
//! 3. Walk the winner's targets by weight (heaviest first) and pick the first
//!    live one, then the fallback model. When the rule matched on a
//!    capability, only models offering it qualify.
//! 4. With no winning rule, fall back to default routing over all live
//!    models, ranked by the request priority.

use std::sync::Arc;

use tracing::{debug, info, warn};

use dispatch_core::{DispatchError, Result, RoutingSettings};

use crate::deadline::Deadline;
use crate::health::HealthMonitor;
use crate::registry::Registry;
use crate::rules::RuleBook;
use crate::types::{Candidate, Model, RoutingPriority, RoutingRequest, RoutingResult, RoutingRule};

use super::condition_evaluator::{RuleScore, required_capabilities, score_rule};

/// Default-routing weight on performance for balanced requests.
const BALANCED_PERFORMANCE_WEIGHT: f64 = 0.6;
/// Default-routing weight on input price for balanced requests.
const BALANCED_COST_WEIGHT: f64 = 0.4;

/// Selects a model for each request.
pub struct Router {
    registry: Arc<Registry>,
    rules: Arc<RuleBook>,
    health: Arc<HealthMonitor>,
    settings: RoutingSettings,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        rules: Arc<RuleBook>,
        health: Arc<HealthMonitor>,
        settings: RoutingSettings,
    ) -> Self {
        Self {
            registry,
            rules,
            health,
            settings,
        }
    }

    /// Routes a request. Deterministic for a fixed catalog, rule set and
    /// health state.
    pub fn route(&self, request: &RoutingRequest, deadline: Deadline) -> Result<RoutingResult> {
        let rules = self.rules.active_rules(deadline)?;
        match select_rule(&rules, request) {
            Some((rule, score)) => {
                debug!(rule = %rule.name, aggregate = score.aggregate, "Rule matched");
                self.route_by_rule(rule, score, request, deadline)
            }
            None => self.route_by_default(request, deadline),
        }
    }

    fn is_live(&self, candidate: &Candidate, deadline: Deadline) -> Result<bool> {
        Ok(candidate.is_eligible() && self.health.is_routable(&candidate.provider.id, deadline)?)
    }

    fn live_candidate(
        &self,
        model_id: &str,
        required: &[&str],
        deadline: Deadline,
    ) -> Result<Option<Candidate>> {
        match self.registry.candidate(model_id, deadline)? {
            Some(candidate) if !required.iter().all(|c| candidate.model.has_capability(c)) => {
                debug!(
                    model = %candidate.model.name,
                    ?required,
                    "Target lacks a matched capability"
                );
                Ok(None)
            }
            Some(candidate) if self.is_live(&candidate, deadline)? => Ok(Some(candidate)),
            Some(_) => Ok(None),
            None => {
                warn!(model_id, "Rule references a model that no longer exists");
                Ok(None)
            }
        }
    }

    fn route_by_rule(
        &self,
        rule: &RoutingRule,
        score: RuleScore,
        request: &RoutingRequest,
        deadline: Deadline,
    ) -> Result<RoutingResult> {
        let required = required_capabilities(rule, request);
        let mut targets: Vec<_> = rule.targets.iter().collect();
        targets.sort_by(|a, b| b.weight.total_cmp(&a.weight));

        let mut live: Vec<Model> = Vec::new();
        for target in targets {
            if live.iter().any(|m| m.id == target.model_id) {
                continue;
            }
            if let Some(candidate) = self.live_candidate(&target.model_id, &required, deadline)? {
                live.push(candidate.model);
            }
        }

        let confidence = (score.aggregate / 100.0).min(1.0);
        if !live.is_empty() {
            let model = live.remove(0);
            live.truncate(self.settings.max_alternatives);
            info!(rule = %rule.name, model = %model.name, confidence, "Routed by rule");
            return Ok(RoutingResult {
                reason: format!("matched rule '{}' (score {:.1})", rule.name, score.aggregate),
                model,
                rule: Some(rule.clone()),
                confidence,
                alternatives: live,
            });
        }

        if let Some(fallback_id) = rule.fallback_model.as_deref() {
            if let Some(candidate) = self.live_candidate(fallback_id, &required, deadline)? {
                info!(rule = %rule.name, model = %candidate.model.name, "Routed to rule fallback");
                return Ok(RoutingResult {
                    reason: format!(
                        "matched rule '{}'; all targets unavailable, using fallback",
                        rule.name
                    ),
                    model: candidate.model,
                    rule: Some(rule.clone()),
                    confidence,
                    alternatives: Vec::new(),
                });
            }
        }

        warn!(rule = %rule.name, "No eligible target or fallback");
        Err(DispatchError::NoEligibleModel(format!(
            "rule '{}' has no eligible target or fallback",
            rule.name
        )))
    }

    fn route_by_default(
        &self,
        request: &RoutingRequest,
        deadline: Deadline,
    ) -> Result<RoutingResult> {
        let capability = request.capabilities.first().map(String::as_str);
        let mut candidates = Vec::new();
        for candidate in self.registry.live_candidates(capability, deadline)? {
            if self.health.is_routable(&candidate.provider.id, deadline)? {
                candidates.push(candidate.model);
            }
        }

        let Some(best) = pick_default(&candidates, request.priority) else {
            return Err(DispatchError::NotFound(match capability {
                Some(cap) => format!("no eligible model with capability '{cap}'"),
                None => "no eligible model".to_string(),
            }));
        };

        let model = candidates.remove(best);
        candidates.truncate(self.settings.max_alternatives);
        let priority = request.priority.unwrap_or(RoutingPriority::Balanced);
        info!(model = %model.name, ?priority, "Routed by default ranking");
        Ok(RoutingResult {
            reason: format!("no rule matched; best {priority:?} ranking").to_lowercase(),
            model,
            rule: None,
            confidence: self.settings.default_confidence,
            alternatives: candidates,
        })
    }
}

/// Highest-scoring rule with at least one matching condition. Earlier rules
/// win ties; a zero aggregate never wins.
pub fn select_rule<'a>(
    rules: &'a [RoutingRule],
    request: &RoutingRequest,
) -> Option<(&'a RoutingRule, RuleScore)> {
    let mut best: Option<(&RoutingRule, RuleScore)> = None;
    for rule in rules {
        let score = score_rule(rule, request);
        if !score.is_match() || score.aggregate <= 0.0 {
            continue;
        }
        if best.is_none_or(|(_, b)| score.aggregate > b.aggregate) {
            best = Some((rule, score));
        }
    }
    best
}

/// Index of the best model for default routing; the first model wins ties.
pub fn pick_default(models: &[Model], priority: Option<RoutingPriority>) -> Option<usize> {
    let key = |m: &Model| -> f64 {
        match priority {
            Some(RoutingPriority::Performance) => m.performance - m.latency_ms,
            Some(RoutingPriority::Cost) => -m.input_price(),
            Some(RoutingPriority::Balanced) | None => {
                BALANCED_PERFORMANCE_WEIGHT * m.performance - BALANCED_COST_WEIGHT * m.input_price()
            }
        }
    };
    let mut best: Option<(usize, f64)> = None;
    for (idx, model) in models.iter().enumerate() {
        let k = key(model);
        if best.is_none_or(|(_, b)| k > b) {
            best = Some((idx, k));
        }
    }
    best.map(|(idx, _)| idx)
}
