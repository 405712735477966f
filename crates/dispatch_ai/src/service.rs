//! Dispatch service: the single entry point callers and the admin API use.
//!
//! Wires the registry, rule book, health monitor, metrics collector and
//! router around one [`Store`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use dispatch_core::{DispatchConfig, Result};

use crate::deadline::Deadline;
use crate::feedback::{FeedbackStats, FeedbackWorker};
use crate::health::{HealthMonitor, HttpProbe, ProviderProbe};
use crate::metrics::MetricsCollector;
use crate::registry::Registry;
use crate::routing::Router;
use crate::rules::RuleBook;
use crate::store::{SqliteStore, Store};
use crate::types::{
    HealthReport, Model, ModelFilter, ModelUpdate, ModelUsageStats, NewModel, NewProvider,
    NewRule, NewUsageRecord, Page, Provider, ProviderStatus, ProviderUpdate, ProviderUsageStats,
    RoutingRequest, RoutingResult, RoutingRule, RuleUpdate, UsageFilter, UsagePeriod,
    UsageRecord, UsageStats,
};

pub struct DispatchService {
    registry: Arc<Registry>,
    rules: Arc<RuleBook>,
    health: Arc<HealthMonitor>,
    metrics: MetricsCollector,
    router: Router,
    config: DispatchConfig,
}

impl DispatchService {
    /// Builds the service over an existing store and probe.
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn Store>,
        probe: Arc<dyn ProviderProbe>,
    ) -> Self {
        let registry = Arc::new(Registry::new(store.clone()));
        let rules = Arc::new(RuleBook::new(store.clone()));
        let health = Arc::new(HealthMonitor::new(
            store.clone(),
            registry.clone(),
            probe,
            config.health.clone(),
        ));
        let metrics = MetricsCollector::new(store, registry.clone(), config.feedback.clone());
        let router = Router::new(
            registry.clone(),
            rules.clone(),
            health.clone(),
            config.routing.clone(),
        );
        Self {
            registry,
            rules,
            health,
            metrics,
            router,
            config,
        }
    }

    /// Opens the SQLite store from the config and probes over HTTP.
    pub fn open(config: DispatchConfig) -> anyhow::Result<Self> {
        let path = config.db_path()?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_at(&path)?);
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.health.probe_timeout_ms))
            .build()?;
        let probe: Arc<dyn ProviderProbe> = Arc::new(HttpProbe::with_client(client));
        info!("Dispatch service ready (database: {})", path.display());
        Ok(Self::new(config, store, probe))
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Starts the background feedback worker. Call once from within a tokio
    /// runtime.
    pub fn start_background(&self) -> Option<JoinHandle<()>> {
        self.metrics.start_feedback()
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Routes with the configured request timeout, if any.
    pub fn route_request(&self, request: &RoutingRequest) -> Result<RoutingResult> {
        let deadline = self
            .config
            .routing
            .request_timeout_ms
            .map_or_else(Deadline::none, |ms| Deadline::after(Duration::from_millis(ms)));
        self.router.route(request, deadline)
    }

    pub fn route_request_with_deadline(
        &self,
        request: &RoutingRequest,
        deadline: Deadline,
    ) -> Result<RoutingResult> {
        self.router.route(request, deadline)
    }

    // -----------------------------------------------------------------------
    // Providers
    // -----------------------------------------------------------------------

    pub fn create_provider(&self, input: NewProvider) -> Result<Provider> {
        self.registry.create_provider(input)
    }

    pub fn update_provider(&self, id: &str, update: ProviderUpdate) -> Result<Provider> {
        self.registry.update_provider(id, update)
    }

    pub fn delete_provider(&self, id: &str) -> Result<()> {
        self.registry.delete_provider(id)?;
        self.health.forget(id);
        Ok(())
    }

    pub fn get_provider(&self, id: &str) -> Result<Provider> {
        self.registry.get_provider(id)
    }

    pub fn list_providers(
        &self,
        status: Option<ProviderStatus>,
        page: Page,
    ) -> Result<Vec<Provider>> {
        self.registry.list_providers(status, page)
    }

    // -----------------------------------------------------------------------
    // Models
    // -----------------------------------------------------------------------

    pub fn register_model(&self, input: NewModel) -> Result<Model> {
        self.registry.register_model(input)
    }

    pub fn update_model(&self, id: &str, update: ModelUpdate) -> Result<Model> {
        self.registry.update_model(id, update)
    }

    pub fn delete_model(&self, id: &str) -> Result<()> {
        self.registry.delete_model(id)
    }

    pub fn get_model(&self, id: &str) -> Result<Model> {
        self.registry.get_model(id)
    }

    pub fn list_models(&self, filter: &ModelFilter, page: Page) -> Result<Vec<Model>> {
        self.registry.list_models(filter, page)
    }

    pub fn find_by_capability(&self, capability: &str) -> Result<Vec<Model>> {
        self.registry.find_by_capability(capability, Deadline::none())
    }

    // -----------------------------------------------------------------------
    // Rules
    // -----------------------------------------------------------------------

    pub fn create_rule(&self, input: NewRule) -> Result<RoutingRule> {
        self.rules.create_rule(input)
    }

    /// Creates a rule from a JSON payload.
    pub fn create_rule_json(&self, json: &str) -> Result<RoutingRule> {
        self.rules.create_rule(RuleBook::parse_rule(json)?)
    }

    pub fn update_rule(&self, id: &str, update: RuleUpdate) -> Result<RoutingRule> {
        self.rules.update_rule(id, update)
    }

    pub fn delete_rule(&self, id: &str) -> Result<()> {
        self.rules.delete_rule(id)
    }

    pub fn get_rule(&self, id: &str) -> Result<RoutingRule> {
        self.rules.get_rule(id)
    }

    pub fn list_rules(&self, active_only: bool) -> Result<Vec<RoutingRule>> {
        self.rules.list_rules(active_only)
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    pub async fn health_check(&self, provider_id: &str) -> Result<HealthReport> {
        self.health.check(provider_id).await
    }

    pub async fn batch_health_check(&self) -> Result<HashMap<String, HealthReport>> {
        self.health.check_all().await
    }

    pub fn latest_health(&self) -> HashMap<String, HealthReport> {
        self.health.latest_all()
    }

    // -----------------------------------------------------------------------
    // Usage and feedback
    // -----------------------------------------------------------------------

    pub fn record_usage(
        &self,
        user_id: Option<&str>,
        record: NewUsageRecord,
    ) -> Result<UsageRecord> {
        self.metrics.record_usage(user_id, record)
    }

    pub fn model_usage_stats(
        &self,
        period: UsagePeriod,
        filter: &UsageFilter,
    ) -> Result<Vec<ModelUsageStats>> {
        self.metrics.model_usage_stats(period, filter)
    }

    pub fn provider_usage_stats(
        &self,
        period: UsagePeriod,
        filter: &UsageFilter,
    ) -> Result<Vec<ProviderUsageStats>> {
        self.metrics.provider_usage_stats(period, filter)
    }

    pub fn total_usage_stats(
        &self,
        period: UsagePeriod,
        filter: &UsageFilter,
    ) -> Result<UsageStats> {
        self.metrics.total_usage_stats(period, filter)
    }

    pub fn feedback(&self) -> &FeedbackWorker {
        self.metrics.feedback()
    }

    pub fn feedback_stats(&self) -> FeedbackStats {
        self.metrics.feedback().stats()
    }

    /// Queues a recomputation for every model with recent usage.
    pub fn refresh_performance(&self) -> Result<usize> {
        self.metrics.feedback().refresh_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConditionKind, MatchOperator, RoutingStrategy};
    use async_trait::async_trait;

    struct AlwaysUp;

    #[async_trait]
    impl ProviderProbe for AlwaysUp {
        async fn check(&self, _provider: &Provider) -> Result<()> {
            Ok(())
        }
    }

    fn service(config: DispatchConfig) -> DispatchService {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        DispatchService::new(config, store, Arc::new(AlwaysUp))
    }

    #[test]
    fn rule_json_round_trips_through_service() {
        let svc = service(DispatchConfig::default());
        let p = svc.create_provider(NewProvider::new("p")).unwrap();
        let m = svc
            .register_model(NewModel::new(&p.id, "m").with_capabilities(&["vision"]))
            .unwrap();
        let json = format!(
            r#"{{"name":"vision","strategy":"capability",
                "conditions":[{{"type":"capability","operator":"equals","value":"vision","weight":1}}],
                "targets":[{{"model_id":"{}","weight":1}}]}}"#,
            m.id
        );
        let rule = svc.create_rule_json(&json).unwrap();
        assert_eq!(
            rule.conditions[0].kind,
            ConditionKind::Capability {
                operator: MatchOperator::Equals,
                value: "vision".into()
            }
        );
        assert_eq!(rule.strategy, RoutingStrategy::Capability);

        let routed = svc
            .route_request(&RoutingRequest::new().with_capability("vision"))
            .unwrap();
        assert_eq!(routed.model.id, m.id);
    }

    #[test]
    fn configured_timeout_applies() {
        let mut config = DispatchConfig::default();
        config.routing.request_timeout_ms = Some(60_000);
        let svc = service(config);
        let p = svc.create_provider(NewProvider::new("p")).unwrap();
        svc.register_model(NewModel::new(&p.id, "m")).unwrap();
        assert!(svc.route_request(&RoutingRequest::new()).is_ok());
    }

    #[tokio::test]
    async fn open_uses_configured_database_and_http_checks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dispatch.db");
        let config = DispatchConfig {
            database_path: Some(path.clone()),
            ..Default::default()
        };
        let svc = DispatchService::open(config).unwrap();
        assert!(path.exists());

        // No endpoints: the HTTP probe fails and the provider is gated.
        let p = svc.create_provider(NewProvider::new("bare")).unwrap();
        let report = svc.health_check(&p.id).await.unwrap();
        assert_eq!(report.status, crate::types::HealthStatus::Unhealthy);
        assert!(report.message.contains("no endpoints"));
    }

    #[tokio::test]
    async fn deleting_provider_clears_cached_health() {
        let svc = service(DispatchConfig::default());
        let p = svc.create_provider(NewProvider::new("p")).unwrap();
        svc.health_check(&p.id).await.unwrap();
        assert!(svc.latest_health().contains_key(&p.id));

        svc.delete_provider(&p.id).unwrap();
        assert!(svc.latest_health().is_empty());
    }
}
