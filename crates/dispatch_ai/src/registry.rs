//! Provider and model catalog.
//!
//! Every write is validated here before it reaches the [`Store`]; the
//! router only ever reads through [`Registry::candidate`] and
//! [`Registry::live_candidates`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use dispatch_core::{DispatchError, Result};

use crate::deadline::Deadline;
use crate::store::{DeleteOutcome, Store};
use crate::types::{
    Candidate, DEFAULT_PERFORMANCE, Model, ModelFilter, ModelPricing, ModelUpdate, NewModel,
    NewProvider, Page, Provider, ProviderStatus, ProviderUpdate,
};

fn validate_name(kind: &str, name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DispatchError::Validation(format!("{kind} name is required")));
    }
    Ok(trimmed.to_string())
}

fn validate_pricing(pricing: &ModelPricing) -> Result<()> {
    for (label, price) in [("input", pricing.input), ("output", pricing.output)] {
        if let Some(p) = price {
            if !p.is_finite() || p < 0.0 {
                return Err(DispatchError::Validation(format!(
                    "{label} price must be a non-negative number"
                )));
            }
        }
    }
    Ok(())
}

fn validate_capabilities(capabilities: Vec<String>) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(capabilities.len());
    for cap in capabilities {
        let cap = cap.trim().to_string();
        if cap.is_empty() {
            return Err(DispatchError::Validation("capability must not be empty".into()));
        }
        if !out.iter().any(|c| c.eq_ignore_ascii_case(&cap)) {
            out.push(cap);
        }
    }
    Ok(out)
}

/// CRUD and lookup over providers and models.
pub struct Registry {
    store: Arc<dyn Store>,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    // -----------------------------------------------------------------------
    // Providers
    // -----------------------------------------------------------------------

    pub fn create_provider(&self, input: NewProvider) -> Result<Provider> {
        let name = validate_name("provider", &input.name)?;
        if self.store.find_provider_by_name(&name)?.is_some() {
            return Err(DispatchError::Validation(format!(
                "provider '{name}' already exists"
            )));
        }
        let now = Utc::now();
        let provider = Provider {
            id: Uuid::new_v4().to_string(),
            name,
            status: input.status,
            priority: input.priority,
            endpoints: input.endpoints,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_provider(&provider)?;
        info!(provider = %provider.name, id = %provider.id, "Registered provider");
        Ok(provider)
    }

    pub fn update_provider(&self, id: &str, update: ProviderUpdate) -> Result<Provider> {
        let mut provider = self.get_provider(id)?;
        if let Some(name) = update.name {
            let name = validate_name("provider", &name)?;
            if let Some(existing) = self.store.find_provider_by_name(&name)? {
                if existing.id != provider.id {
                    return Err(DispatchError::Validation(format!(
                        "provider '{name}' already exists"
                    )));
                }
            }
            provider.name = name;
        }
        if let Some(status) = update.status {
            if status != provider.status {
                info!(
                    provider = %provider.name,
                    from = ?provider.status,
                    to = ?status,
                    "Provider status changed"
                );
            }
            provider.status = status;
        }
        if let Some(priority) = update.priority {
            provider.priority = priority;
        }
        if let Some(endpoints) = update.endpoints {
            provider.endpoints = endpoints;
        }
        provider.updated_at = Utc::now();
        self.store.update_provider(&provider)?;
        Ok(provider)
    }

    /// Fails with `Conflict` while models still belong to the provider.
    pub fn delete_provider(&self, id: &str) -> Result<()> {
        match self.store.delete_provider(id)? {
            DeleteOutcome::Deleted => {
                info!(id, "Deleted provider");
                Ok(())
            }
            DeleteOutcome::NotFound => Err(DispatchError::NotFound(format!("provider {id}"))),
            DeleteOutcome::Blocked(models) => Err(DispatchError::Conflict(format!(
                "provider {id} still owns models: {}",
                models.join(", ")
            ))),
        }
    }

    pub fn get_provider(&self, id: &str) -> Result<Provider> {
        self.store
            .get_provider(id)?
            .ok_or_else(|| DispatchError::NotFound(format!("provider {id}")))
    }

    pub fn list_providers(
        &self,
        status: Option<ProviderStatus>,
        page: Page,
    ) -> Result<Vec<Provider>> {
        self.store.list_providers(status, page)
    }

    // -----------------------------------------------------------------------
    // Models
    // -----------------------------------------------------------------------

    pub fn register_model(&self, input: NewModel) -> Result<Model> {
        let name = validate_name("model", &input.name)?;
        let provider = self.get_provider(&input.provider_id).map_err(|_| {
            DispatchError::Validation(format!("provider {} does not exist", input.provider_id))
        })?;
        if self.store.find_model_by_name(&provider.id, &name)?.is_some() {
            return Err(DispatchError::Validation(format!(
                "model '{name}' already exists for provider '{}'",
                provider.name
            )));
        }
        validate_pricing(&input.pricing)?;
        let performance = input.performance.unwrap_or(DEFAULT_PERFORMANCE);
        if !(0.0..=100.0).contains(&performance) {
            return Err(DispatchError::Validation(
                "performance must be within 0..=100".into(),
            ));
        }
        let latency_ms = input.latency_ms.unwrap_or(0.0);
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return Err(DispatchError::Validation(
                "latency must be a non-negative number".into(),
            ));
        }

        let now = Utc::now();
        let model = Model {
            id: Uuid::new_v4().to_string(),
            provider_id: provider.id,
            name,
            status: input.status,
            capabilities: validate_capabilities(input.capabilities)?,
            pricing: input.pricing,
            performance,
            latency_ms,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_model(&model)?;
        info!(model = %model.name, provider = %provider.name, id = %model.id, "Registered model");
        Ok(model)
    }

    pub fn update_model(&self, id: &str, update: ModelUpdate) -> Result<Model> {
        let mut model = self.get_model(id)?;
        if let Some(name) = update.name {
            let name = validate_name("model", &name)?;
            if let Some(existing) = self.store.find_model_by_name(&model.provider_id, &name)? {
                if existing.id != model.id {
                    return Err(DispatchError::Validation(format!(
                        "model '{name}' already exists for this provider"
                    )));
                }
            }
            model.name = name;
        }
        if let Some(status) = update.status {
            model.status = status;
        }
        if let Some(capabilities) = update.capabilities {
            model.capabilities = validate_capabilities(capabilities)?;
        }
        if let Some(pricing) = update.pricing {
            validate_pricing(&pricing)?;
            model.pricing = pricing;
        }
        model.updated_at = Utc::now();
        self.store.update_model(&model)?;
        Ok(model)
    }

    /// Fails with `Conflict` while a rule targets the model or names it as
    /// fallback.
    pub fn delete_model(&self, id: &str) -> Result<()> {
        match self.store.delete_model(id)? {
            DeleteOutcome::Deleted => {
                info!(id, "Deleted model");
                Ok(())
            }
            DeleteOutcome::NotFound => Err(DispatchError::NotFound(format!("model {id}"))),
            DeleteOutcome::Blocked(rules) => Err(DispatchError::Conflict(format!(
                "model {id} is referenced by rules: {}",
                rules.join(", ")
            ))),
        }
    }

    pub fn get_model(&self, id: &str) -> Result<Model> {
        self.store
            .get_model(id)?
            .ok_or_else(|| DispatchError::NotFound(format!("model {id}")))
    }

    pub fn list_models(&self, filter: &ModelFilter, page: Page) -> Result<Vec<Model>> {
        self.store.list_models(filter, page)
    }

    /// Models whose capabilities contain `capability` (case-insensitive),
    /// best performance first, then higher provider priority.
    pub fn find_by_capability(&self, capability: &str, deadline: Deadline) -> Result<Vec<Model>> {
        Ok(self
            .capability_candidates(Some(capability), deadline)?
            .into_iter()
            .map(|c| c.model)
            .collect())
    }

    fn capability_candidates(
        &self,
        capability: Option<&str>,
        deadline: Deadline,
    ) -> Result<Vec<Candidate>> {
        deadline.check("registry lookup")?;
        let providers: HashMap<String, Provider> = self
            .store
            .list_providers(None, Page::all())?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        deadline.check("registry lookup")?;
        let models = self.store.list_models(&ModelFilter::default(), Page::all())?;

        let mut candidates: Vec<Candidate> = models
            .into_iter()
            .filter(|m| capability.is_none_or(|cap| m.has_capability(cap)))
            .filter_map(|model| {
                let provider = providers.get(&model.provider_id)?.clone();
                Some(Candidate { model, provider })
            })
            .collect();

        if capability.is_some() {
            candidates.sort_by(|a, b| {
                b.model
                    .performance
                    .total_cmp(&a.model.performance)
                    .then_with(|| b.provider.priority.cmp(&a.provider.priority))
            });
        }
        debug!(
            capability = capability.unwrap_or("*"),
            matches = candidates.len(),
            "capability lookup"
        );
        Ok(candidates)
    }

    /// Eligible candidates for default routing: those matching `capability`
    /// when given, otherwise every model, in catalog order.
    pub fn live_candidates(
        &self,
        capability: Option<&str>,
        deadline: Deadline,
    ) -> Result<Vec<Candidate>> {
        Ok(self
            .capability_candidates(capability, deadline)?
            .into_iter()
            .filter(Candidate::is_eligible)
            .collect())
    }

    /// Resolves a model id together with its provider, or `None` when either
    /// no longer exists.
    pub fn candidate(&self, model_id: &str, deadline: Deadline) -> Result<Option<Candidate>> {
        deadline.check("registry lookup")?;
        let Some(model) = self.store.get_model(model_id)? else {
            return Ok(None);
        };
        let Some(provider) = self.store.get_provider(&model.provider_id)? else {
            return Ok(None);
        };
        Ok(Some(Candidate { model, provider }))
    }

    // -----------------------------------------------------------------------
    // Feedback
    // -----------------------------------------------------------------------

    /// The single write path for the feedback-owned columns.
    pub fn apply_feedback(&self, model_id: &str, performance: f64, latency_ms: f64) -> Result<()> {
        let performance = performance.clamp(0.0, 100.0);
        if self
            .store
            .set_model_performance(model_id, performance, latency_ms.max(0.0))?
        {
            debug!(model_id, performance, latency_ms, "Applied feedback");
            Ok(())
        } else {
            Err(DispatchError::NotFound(format!("model {model_id}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::{ModelStatus, NewRule, RoutingStrategy};

    fn registry() -> (Registry, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        (Registry::new(store.clone()), store)
    }

    #[test]
    fn provider_name_required_and_unique() {
        let (reg, _) = registry();
        assert!(matches!(
            reg.create_provider(NewProvider::new("  ")),
            Err(DispatchError::Validation(_))
        ));
        reg.create_provider(NewProvider::new("openai")).unwrap();
        assert!(matches!(
            reg.create_provider(NewProvider::new("openai")),
            Err(DispatchError::Validation(_))
        ));
    }

    #[test]
    fn model_requires_existing_provider() {
        let (reg, _) = registry();
        let err = reg
            .register_model(NewModel::new("ghost", "gpt-4"))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[test]
    fn model_name_unique_per_provider() {
        let (reg, _) = registry();
        let a = reg.create_provider(NewProvider::new("a")).unwrap();
        let b = reg.create_provider(NewProvider::new("b")).unwrap();
        reg.register_model(NewModel::new(&a.id, "shared")).unwrap();
        reg.register_model(NewModel::new(&b.id, "shared")).unwrap();
        assert!(reg.register_model(NewModel::new(&a.id, "shared")).is_err());
    }

    #[test]
    fn negative_price_rejected() {
        let (reg, _) = registry();
        let p = reg.create_provider(NewProvider::new("p")).unwrap();
        let err = reg
            .register_model(NewModel::new(&p.id, "m").with_pricing(-1.0, 0.0))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[test]
    fn new_model_gets_default_performance() {
        let (reg, _) = registry();
        let p = reg.create_provider(NewProvider::new("p")).unwrap();
        let m = reg.register_model(NewModel::new(&p.id, "m")).unwrap();
        assert_eq!(m.performance, DEFAULT_PERFORMANCE);
    }

    #[test]
    fn find_by_capability_orders_by_performance_then_priority() {
        let (reg, _) = registry();
        let low = reg
            .create_provider(NewProvider::new("low").with_priority(1))
            .unwrap();
        let high = reg
            .create_provider(NewProvider::new("high").with_priority(9))
            .unwrap();
        let slow = reg
            .register_model(
                NewModel::new(&low.id, "slow")
                    .with_capabilities(&["Vision"])
                    .with_performance(40.0, 0.0),
            )
            .unwrap();
        let tie_low = reg
            .register_model(
                NewModel::new(&low.id, "tie-low")
                    .with_capabilities(&["vision"])
                    .with_performance(80.0, 0.0),
            )
            .unwrap();
        let tie_high = reg
            .register_model(
                NewModel::new(&high.id, "tie-high")
                    .with_capabilities(&["computer-vision"])
                    .with_performance(80.0, 0.0),
            )
            .unwrap();
        reg.register_model(NewModel::new(&high.id, "text").with_capabilities(&["text"]))
            .unwrap();

        let found = reg.find_by_capability("VISION", Deadline::none()).unwrap();
        let ids: Vec<_> = found.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec![tie_high.id, tie_low.id, slow.id]);
    }

    #[test]
    fn live_candidates_skip_inactive_and_suspended() {
        let (reg, _) = registry();
        let up = reg.create_provider(NewProvider::new("up")).unwrap();
        let down = reg
            .create_provider(NewProvider::new("down").with_status(ProviderStatus::Suspended))
            .unwrap();
        let ok = reg.register_model(NewModel::new(&up.id, "ok")).unwrap();
        reg.register_model(NewModel::new(&up.id, "off").with_status(ModelStatus::Inactive))
            .unwrap();
        reg.register_model(NewModel::new(&down.id, "orphaned")).unwrap();

        let live = reg.live_candidates(None, Deadline::none()).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].model.id, ok.id);
    }

    #[test]
    fn delete_provider_with_models_conflicts() {
        let (reg, _) = registry();
        let p = reg.create_provider(NewProvider::new("p")).unwrap();
        let m = reg.register_model(NewModel::new(&p.id, "m")).unwrap();

        assert!(matches!(
            reg.delete_provider(&p.id),
            Err(DispatchError::Conflict(_))
        ));
        reg.delete_model(&m.id).unwrap();
        reg.delete_provider(&p.id).unwrap();
        assert!(matches!(
            reg.get_provider(&p.id),
            Err(DispatchError::NotFound(_))
        ));
    }

    #[test]
    fn delete_model_referenced_by_rule_conflicts() {
        let (reg, store) = registry();
        let p = reg.create_provider(NewProvider::new("p")).unwrap();
        let m = reg.register_model(NewModel::new(&p.id, "m")).unwrap();
        let rules = crate::rules::RuleBook::new(store);
        rules
            .create_rule(NewRule::new("r", RoutingStrategy::Cost).target(&m.id, 1.0))
            .unwrap();

        assert!(matches!(
            reg.delete_model(&m.id),
            Err(DispatchError::Conflict(_))
        ));
        assert!(reg.get_model(&m.id).is_ok());
    }

    #[test]
    fn update_cannot_touch_performance() {
        let (reg, _) = registry();
        let p = reg.create_provider(NewProvider::new("p")).unwrap();
        let m = reg.register_model(NewModel::new(&p.id, "m")).unwrap();
        reg.apply_feedback(&m.id, 91.0, 120.0).unwrap();

        let updated = reg
            .update_model(
                &m.id,
                ModelUpdate {
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(reg.get_model(&m.id).unwrap().performance, 91.0);
    }

    #[test]
    fn apply_feedback_clamps_and_reports_unknown() {
        let (reg, _) = registry();
        let p = reg.create_provider(NewProvider::new("p")).unwrap();
        let m = reg.register_model(NewModel::new(&p.id, "m")).unwrap();
        reg.apply_feedback(&m.id, 140.0, 10.0).unwrap();
        assert_eq!(reg.get_model(&m.id).unwrap().performance, 100.0);
        assert!(matches!(
            reg.apply_feedback("missing", 50.0, 1.0),
            Err(DispatchError::NotFound(_))
        ));
    }

    #[test]
    fn expired_deadline_stops_lookup() {
        let (reg, _) = registry();
        let past = Deadline::at(std::time::Instant::now());
        assert!(matches!(
            reg.find_by_capability("x", past),
            Err(DispatchError::DeadlineExceeded { .. })
        ));
    }
}
