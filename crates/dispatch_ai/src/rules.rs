//! Authoring and lookup of routing rules.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use dispatch_core::{DispatchError, Result};

use crate::deadline::Deadline;
use crate::store::{DeleteOutcome, Store};
use crate::types::{
    ConditionKind, NewRule, RoutingCondition, RoutingRule, RoutingTarget, RuleUpdate,
};

/// Validated CRUD over [`RoutingRule`]s.
pub struct RuleBook {
    store: Arc<dyn Store>,
}

impl RuleBook {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Parses a loosely typed rule payload. Unknown condition types and
    /// malformed fields are rejected as validation errors.
    pub fn parse_rule(json: &str) -> Result<NewRule> {
        serde_json::from_str(json)
            .map_err(|e| DispatchError::Validation(format!("invalid rule payload: {e}")))
    }

    pub fn create_rule(&self, input: NewRule) -> Result<RoutingRule> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(DispatchError::Validation("rule name is required".into()));
        }
        if self.store.find_rule_by_name(&name)?.is_some() {
            return Err(DispatchError::Validation(format!(
                "rule '{name}' already exists"
            )));
        }
        self.validate_conditions(&input.conditions)?;
        self.validate_targets(&input.targets)?;
        self.validate_fallback(input.fallback_model.as_deref())?;

        let now = Utc::now();
        let rule = RoutingRule {
            id: Uuid::new_v4().to_string(),
            name,
            strategy: input.strategy,
            is_active: input.is_active,
            conditions: input.conditions,
            targets: input.targets,
            fallback_model: input.fallback_model,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_rule(&rule)?;
        info!(
            rule = %rule.name,
            id = %rule.id,
            targets = rule.targets.len(),
            "Created routing rule"
        );
        Ok(rule)
    }

    pub fn update_rule(&self, id: &str, update: RuleUpdate) -> Result<RoutingRule> {
        let mut rule = self.get_rule(id)?;
        if let Some(name) = update.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(DispatchError::Validation("rule name is required".into()));
            }
            if let Some(existing) = self.store.find_rule_by_name(&name)? {
                if existing.id != rule.id {
                    return Err(DispatchError::Validation(format!(
                        "rule '{name}' already exists"
                    )));
                }
            }
            rule.name = name;
        }
        if let Some(strategy) = update.strategy {
            rule.strategy = strategy;
        }
        if let Some(active) = update.is_active {
            rule.is_active = active;
        }
        if let Some(conditions) = update.conditions {
            self.validate_conditions(&conditions)?;
            rule.conditions = conditions;
        }
        if let Some(targets) = update.targets {
            self.validate_targets(&targets)?;
            rule.targets = targets;
        }
        if let Some(fallback) = update.fallback_model {
            self.validate_fallback(fallback.as_deref())?;
            rule.fallback_model = fallback;
        }
        rule.updated_at = Utc::now();
        self.store.update_rule(&rule)?;
        info!(rule = %rule.name, id = %rule.id, "Updated routing rule");
        Ok(rule)
    }

    pub fn delete_rule(&self, id: &str) -> Result<()> {
        match self.store.delete_rule(id)? {
            DeleteOutcome::Deleted => {
                info!(id, "Deleted routing rule");
                Ok(())
            }
            DeleteOutcome::NotFound => Err(DispatchError::NotFound(format!("rule {id}"))),
            DeleteOutcome::Blocked(by) => Err(DispatchError::Conflict(format!(
                "rule {id} is referenced by: {}",
                by.join(", ")
            ))),
        }
    }

    pub fn get_rule(&self, id: &str) -> Result<RoutingRule> {
        self.store
            .get_rule(id)?
            .ok_or_else(|| DispatchError::NotFound(format!("rule {id}")))
    }

    pub fn list_rules(&self, active_only: bool) -> Result<Vec<RoutingRule>> {
        self.store.list_rules(active_only)
    }

    /// Active rules in authoring order, for the router.
    pub fn active_rules(&self, deadline: Deadline) -> Result<Vec<RoutingRule>> {
        deadline.check("rule lookup")?;
        self.store.list_rules(true)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    fn validate_conditions(&self, conditions: &[RoutingCondition]) -> Result<()> {
        for cond in conditions {
            let kind = cond.kind.type_name();
            if !cond.weight.is_finite() || cond.weight < 0.0 {
                return Err(DispatchError::Validation(format!(
                    "{kind} condition weight must be a non-negative number"
                )));
            }
            match &cond.kind {
                ConditionKind::Capability { value, .. }
                | ConditionKind::Geographic { value, .. } => {
                    if value.trim().is_empty() {
                        return Err(DispatchError::Validation(format!(
                            "{kind} condition value must not be empty"
                        )));
                    }
                }
                ConditionKind::Performance { value, .. }
                | ConditionKind::Cost { value, .. }
                | ConditionKind::Latency { value, .. } => {
                    if !value.is_finite() || *value < 0.0 {
                        return Err(DispatchError::Validation(format!(
                            "{kind} condition value must be a non-negative number"
                        )));
                    }
                }
                ConditionKind::Availability { .. } => {}
            }
        }
        Ok(())
    }

    fn validate_targets(&self, targets: &[RoutingTarget]) -> Result<()> {
        if targets.is_empty() {
            return Err(DispatchError::Validation(
                "a rule needs at least one target".into(),
            ));
        }
        for target in targets {
            if !target.weight.is_finite() || target.weight <= 0.0 {
                return Err(DispatchError::Validation(format!(
                    "target {} weight must be positive",
                    target.model_id
                )));
            }
            if self.store.get_model(&target.model_id)?.is_none() {
                return Err(DispatchError::Validation(format!(
                    "target model {} does not exist",
                    target.model_id
                )));
            }
        }
        Ok(())
    }

    fn validate_fallback(&self, fallback: Option<&str>) -> Result<()> {
        if let Some(id) = fallback {
            if self.store.get_model(id)?.is_none() {
                return Err(DispatchError::Validation(format!(
                    "fallback model {id} does not exist"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::store::SqliteStore;
    use crate::types::{MatchOperator, NewModel, NewProvider, RoutingStrategy};

    struct Fixture {
        rules: RuleBook,
        model_a: String,
        model_b: String,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let reg = Registry::new(store.clone());
        let p = reg.create_provider(NewProvider::new("p")).unwrap();
        let a = reg.register_model(NewModel::new(&p.id, "a")).unwrap();
        let b = reg.register_model(NewModel::new(&p.id, "b")).unwrap();
        Fixture {
            rules: RuleBook::new(store),
            model_a: a.id,
            model_b: b.id,
        }
    }

    fn vision() -> ConditionKind {
        ConditionKind::Capability {
            operator: MatchOperator::Equals,
            value: "vision".into(),
        }
    }

    #[test]
    fn create_and_list() {
        let f = fixture();
        let rule = f
            .rules
            .create_rule(
                NewRule::new("vision", RoutingStrategy::Capability)
                    .condition(vision(), 2.0)
                    .target(&f.model_a, 1.0)
                    .fallback(&f.model_b),
            )
            .unwrap();
        f.rules
            .create_rule(
                NewRule::new("off", RoutingStrategy::Cost)
                    .target(&f.model_b, 1.0)
                    .inactive(),
            )
            .unwrap();

        let loaded = f.rules.get_rule(&rule.id).unwrap();
        assert_eq!(loaded.name, "vision");
        assert_eq!(loaded.conditions, rule.conditions);
        assert_eq!(loaded.fallback_model.as_deref(), Some(f.model_b.as_str()));
        assert_eq!(f.rules.list_rules(false).unwrap().len(), 2);
        let active = f.rules.active_rules(Deadline::none()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "vision");
    }

    #[test]
    fn rule_without_targets_rejected() {
        let f = fixture();
        let err = f
            .rules
            .create_rule(NewRule::new("empty", RoutingStrategy::Cost))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[test]
    fn non_positive_target_weight_rejected() {
        let f = fixture();
        for weight in [0.0, -1.0, f64::NAN] {
            let err = f
                .rules
                .create_rule(NewRule::new("w", RoutingStrategy::Cost).target(&f.model_a, weight))
                .unwrap_err();
            assert!(matches!(err, DispatchError::Validation(_)));
        }
    }

    #[test]
    fn unknown_target_or_fallback_rejected() {
        let f = fixture();
        assert!(
            f.rules
                .create_rule(NewRule::new("t", RoutingStrategy::Cost).target("ghost", 1.0))
                .is_err()
        );
        assert!(
            f.rules
                .create_rule(
                    NewRule::new("f", RoutingStrategy::Cost)
                        .target(&f.model_a, 1.0)
                        .fallback("ghost")
                )
                .is_err()
        );
    }

    #[test]
    fn duplicate_name_rejected() {
        let f = fixture();
        let new = || NewRule::new("dup", RoutingStrategy::Cost).target(&f.model_a, 1.0);
        f.rules.create_rule(new()).unwrap();
        assert!(matches!(
            f.rules.create_rule(new()),
            Err(DispatchError::Validation(_))
        ));
    }

    #[test]
    fn parse_rule_rejects_unknown_condition_type() {
        let ok = r#"{
            "name": "cheap",
            "strategy": "cost",
            "conditions": [{"type": "cost", "operator": "less_than", "value": 0.01, "weight": 1}],
            "targets": [{"model_id": "m", "weight": 1}]
        }"#;
        let parsed = RuleBook::parse_rule(ok).unwrap();
        assert_eq!(parsed.conditions.len(), 1);
        assert!(parsed.is_active);

        let bad = ok.replace(r#""type": "cost""#, r#""type": "mood""#);
        assert!(matches!(
            RuleBook::parse_rule(&bad),
            Err(DispatchError::Validation(_))
        ));
    }

    #[test]
    fn update_revalidates_targets_and_clears_fallback() {
        let f = fixture();
        let rule = f
            .rules
            .create_rule(
                NewRule::new("r", RoutingStrategy::Cost)
                    .target(&f.model_a, 1.0)
                    .fallback(&f.model_b),
            )
            .unwrap();

        let bad = RuleUpdate {
            targets: Some(vec![]),
            ..Default::default()
        };
        assert!(f.rules.update_rule(&rule.id, bad).is_err());

        let updated = f
            .rules
            .update_rule(
                &rule.id,
                RuleUpdate {
                    fallback_model: Some(None),
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.fallback_model, None);
        assert!(!updated.is_active);
    }

    #[test]
    fn delete_unknown_rule_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.rules.delete_rule("nope"),
            Err(DispatchError::NotFound(_))
        ));
    }
}
