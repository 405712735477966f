use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use dispatch_core::DispatchError;

/// Performance assigned to a model before the feedback loop has scored it.
pub const DEFAULT_PERFORMANCE: f64 = 50.0;

fn parse_error(kind: &str, value: &str) -> DispatchError {
    DispatchError::Validation(format!("unknown {kind} '{value}'"))
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Active,
    Degraded,
    Suspended,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Suspended => "suspended",
        }
    }
}

impl FromStr for ProviderStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "degraded" => Ok(Self::Degraded),
            "suspended" => Ok(Self::Suspended),
            other => Err(parse_error("provider status", other)),
        }
    }
}

/// An external AI backend vendor hosting models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub status: ProviderStatus,
    /// Tie-break weight; higher wins.
    pub priority: i32,
    /// Named endpoint URLs (`health`, `chat`, ...).
    pub endpoints: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProvider {
    pub name: String,
    #[serde(default = "default_provider_status")]
    pub status: ProviderStatus,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
}

fn default_provider_status() -> ProviderStatus {
    ProviderStatus::Active
}

impl NewProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ProviderStatus::Active,
            priority: 0,
            endpoints: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_status(mut self, status: ProviderStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_endpoint(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.endpoints.insert(name.into(), url.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderUpdate {
    pub name: Option<String>,
    pub status: Option<ProviderStatus>,
    pub priority: Option<i32>,
    pub endpoints: Option<BTreeMap<String, String>>,
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Active,
    Inactive,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl FromStr for ModelStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(parse_error("model status", other)),
        }
    }
}

/// Per-1K-token prices. A missing price counts as free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub input: Option<f64>,
    #[serde(default)]
    pub output: Option<f64>,
}

impl ModelPricing {
    pub fn new(input: f64, output: f64) -> Self {
        Self {
            input: Some(input),
            output: Some(output),
        }
    }
}

/// One AI capability endpoint owned by exactly one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub provider_id: String,
    pub name: String,
    pub status: ModelStatus,
    pub capabilities: Vec<String>,
    pub pricing: ModelPricing,
    /// 0..=100, written only by the feedback loop.
    pub performance: f64,
    /// Rolling average latency in milliseconds.
    pub latency_ms: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Case-insensitive containment match over the capability list.
    pub fn has_capability(&self, capability: &str) -> bool {
        let needle = capability.to_lowercase();
        self.capabilities
            .iter()
            .any(|c| c.to_lowercase().contains(&needle))
    }

    pub fn input_price(&self) -> f64 {
        self.pricing.input.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewModel {
    pub provider_id: String,
    pub name: String,
    #[serde(default = "default_model_status")]
    pub status: ModelStatus,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub pricing: ModelPricing,
    /// Seed score; defaults to [`DEFAULT_PERFORMANCE`].
    #[serde(default)]
    pub performance: Option<f64>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
}

fn default_model_status() -> ModelStatus {
    ModelStatus::Active
}

impl NewModel {
    pub fn new(provider_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            name: name.into(),
            status: ModelStatus::Active,
            capabilities: Vec::new(),
            pricing: ModelPricing::default(),
            performance: None,
            latency_ms: None,
        }
    }

    pub fn with_capabilities(mut self, caps: &[&str]) -> Self {
        self.capabilities = caps.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_pricing(mut self, input: f64, output: f64) -> Self {
        self.pricing = ModelPricing::new(input, output);
        self
    }

    pub fn with_status(mut self, status: ModelStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_performance(mut self, performance: f64, latency_ms: f64) -> Self {
        self.performance = Some(performance);
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// Admin-editable model fields. Performance and latency are owned by the
/// feedback loop and cannot be set here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub name: Option<String>,
    pub status: Option<ModelStatus>,
    pub capabilities: Option<Vec<String>>,
    pub pricing: Option<ModelPricing>,
}

/// A model together with its owning provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub model: Model,
    pub provider: Provider,
}

impl Candidate {
    /// `model.status == ACTIVE && provider.status == ACTIVE`
    pub fn is_eligible(&self) -> bool {
        self.model.status == ModelStatus::Active && self.provider.status == ProviderStatus::Active
    }
}

// ---------------------------------------------------------------------------
// Routing rules
// ---------------------------------------------------------------------------

/// Informational strategy tag carried by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Capability,
    Cost,
    Performance,
    Balanced,
    Custom,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capability => "capability",
            Self::Cost => "cost",
            Self::Performance => "performance",
            Self::Balanced => "balanced",
            Self::Custom => "custom",
        }
    }
}

impl FromStr for RoutingStrategy {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "capability" => Ok(Self::Capability),
            "cost" => Ok(Self::Cost),
            "performance" => Ok(Self::Performance),
            "balanced" => Ok(Self::Balanced),
            "custom" => Ok(Self::Custom),
            other => Err(parse_error("routing strategy", other)),
        }
    }
}

/// String match used by capability and geographic conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOperator {
    Equals,
    Contains,
}

impl MatchOperator {
    /// Case-insensitive comparison of `candidate` against `value`.
    pub fn matches(&self, candidate: &str, value: &str) -> bool {
        let candidate = candidate.to_lowercase();
        let value = value.to_lowercase();
        match self {
            Self::Equals => candidate == value,
            Self::Contains => candidate.contains(&value),
        }
    }
}

/// Numeric comparator used by latency, cost and performance conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    Equals,
}

impl Comparator {
    /// Evaluates `lhs <op> rhs`.
    pub fn holds(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::LessThan => lhs < rhs,
            Self::LessOrEqual => lhs <= rhs,
            Self::GreaterThan => lhs > rhs,
            Self::GreaterOrEqual => lhs >= rhs,
            Self::Equals => (lhs - rhs).abs() < f64::EPSILON,
        }
    }

    fn is_upper_bound(&self) -> bool {
        matches!(self, Self::LessThan | Self::LessOrEqual | Self::Equals)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityTier {
    High,
    Standard,
    Low,
}

/// What a routing condition inspects. The set is closed: payloads with an
/// unknown `type` fail to deserialize when a rule is authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionKind {
    Capability {
        operator: MatchOperator,
        value: String,
    },
    Performance {
        operator: Comparator,
        value: f64,
    },
    Cost {
        operator: Comparator,
        value: f64,
    },
    Latency {
        operator: Comparator,
        value: f64,
    },
    Availability {
        value: AvailabilityTier,
    },
    Geographic {
        operator: MatchOperator,
        value: String,
    },
}

impl ConditionKind {
    /// The request priority a cost/performance condition is aimed at.
    ///
    /// A cost ceiling (`less_than`) targets cost-sensitive requests while a
    /// cost floor targets performance-seeking ones; performance conditions
    /// mirror that.
    pub fn priority_tier(&self) -> Option<RoutingPriority> {
        match self {
            Self::Cost { operator, .. } => Some(if operator.is_upper_bound() {
                RoutingPriority::Cost
            } else {
                RoutingPriority::Performance
            }),
            Self::Performance { operator, .. } => Some(match operator {
                Comparator::LessThan | Comparator::LessOrEqual => RoutingPriority::Cost,
                _ => RoutingPriority::Performance,
            }),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Capability { .. } => "capability",
            Self::Performance { .. } => "performance",
            Self::Cost { .. } => "cost",
            Self::Latency { .. } => "latency",
            Self::Availability { .. } => "availability",
            Self::Geographic { .. } => "geographic",
        }
    }
}

/// One weighted scoring criterion within a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingCondition {
    #[serde(flatten)]
    pub kind: ConditionKind,
    #[serde(default = "default_condition_weight")]
    pub weight: f64,
}

fn default_condition_weight() -> f64 {
    1.0
}

impl RoutingCondition {
    pub fn new(kind: ConditionKind, weight: f64) -> Self {
        Self { kind, weight }
    }
}

/// A candidate model within a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingTarget {
    pub model_id: String,
    pub weight: f64,
    #[serde(default)]
    pub priority: i32,
}

impl RoutingTarget {
    pub fn new(model_id: impl Into<String>, weight: f64) -> Self {
        Self {
            model_id: model_id.into(),
            weight,
            priority: 0,
        }
    }
}

/// Named, weighted decision unit matching requests to candidate models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    pub name: String,
    pub strategy: RoutingStrategy,
    pub is_active: bool,
    pub conditions: Vec<RoutingCondition>,
    pub targets: Vec<RoutingTarget>,
    pub fallback_model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRule {
    pub name: String,
    #[serde(default = "default_strategy")]
    pub strategy: RoutingStrategy,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub conditions: Vec<RoutingCondition>,
    pub targets: Vec<RoutingTarget>,
    #[serde(default)]
    pub fallback_model: Option<String>,
}

fn default_strategy() -> RoutingStrategy {
    RoutingStrategy::Custom
}

fn default_true() -> bool {
    true
}

impl NewRule {
    pub fn new(name: impl Into<String>, strategy: RoutingStrategy) -> Self {
        Self {
            name: name.into(),
            strategy,
            is_active: true,
            conditions: Vec::new(),
            targets: Vec::new(),
            fallback_model: None,
        }
    }

    pub fn condition(mut self, kind: ConditionKind, weight: f64) -> Self {
        self.conditions.push(RoutingCondition::new(kind, weight));
        self
    }

    pub fn target(mut self, model_id: impl Into<String>, weight: f64) -> Self {
        self.targets.push(RoutingTarget::new(model_id, weight));
        self
    }

    pub fn fallback(mut self, model_id: impl Into<String>) -> Self {
        self.fallback_model = Some(model_id.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub strategy: Option<RoutingStrategy>,
    pub is_active: Option<bool>,
    pub conditions: Option<Vec<RoutingCondition>>,
    pub targets: Option<Vec<RoutingTarget>>,
    /// `Some(None)` clears the fallback.
    pub fallback_model: Option<Option<String>>,
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPriority {
    Cost,
    Performance,
    Balanced,
}

/// An inference request's routing requirements.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingRequest {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub priority: Option<RoutingPriority>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub geographic: Option<String>,
    #[serde(default)]
    pub max_latency_ms: Option<f64>,
    /// Free-form caller context.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl RoutingRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_priority(mut self, priority: RoutingPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_geographic(mut self, region: impl Into<String>) -> Self {
        self.geographic = Some(region.into());
        self
    }

    pub fn with_max_latency(mut self, ms: f64) -> Self {
        self.max_latency_ms = Some(ms);
        self
    }

    /// Latency budget from the typed field, or `max_latency` / `maxLatency`
    /// in the free-form context.
    pub fn max_latency(&self) -> Option<f64> {
        self.max_latency_ms.or_else(|| {
            ["max_latency", "maxLatency"]
                .iter()
                .find_map(|key| self.context.get(*key).and_then(|v| v.as_f64()))
        })
    }
}

/// The routing decision returned to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingResult {
    pub model: Model,
    /// The rule that matched, or `None` for default routing.
    pub rule: Option<RoutingRule>,
    /// 0..=1
    pub confidence: f64,
    pub reason: String,
    /// Other live candidates, best first.
    pub alternatives: Vec<Model>,
}

// ---------------------------------------------------------------------------
// Usage and performance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    Success,
    Error,
    Timeout,
    RateLimited,
    Cancelled,
}

impl UsageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for UsageStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            "rate_limited" => Ok(Self::RateLimited),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(parse_error("usage status", other)),
        }
    }
}

/// Immutable log of one completed or attempted AI call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub model_id: String,
    /// Owning provider at the time of the call.
    pub provider_id: String,
    pub user_id: Option<String>,
    pub request_tokens: u32,
    pub response_tokens: u32,
    pub cost: f64,
    pub latency_ms: f64,
    pub status: UsageStatus,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn total_tokens(&self) -> u64 {
        u64::from(self.request_tokens) + u64::from(self.response_tokens)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUsageRecord {
    pub model_id: String,
    #[serde(default)]
    pub request_tokens: u32,
    #[serde(default)]
    pub response_tokens: u32,
    #[serde(default)]
    pub cost: f64,
    pub latency_ms: f64,
    pub status: UsageStatus,
}

impl NewUsageRecord {
    pub fn success(model_id: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            model_id: model_id.into(),
            request_tokens: 0,
            response_tokens: 0,
            cost: 0.0,
            latency_ms,
            status: UsageStatus::Success,
        }
    }

    pub fn with_status(mut self, status: UsageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_tokens(mut self, request: u32, response: u32) -> Self {
        self.request_tokens = request;
        self.response_tokens = response;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Rolling-window performance summary for a model. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub id: String,
    pub model_id: String,
    pub requests: u64,
    pub avg_latency_ms: f64,
    pub token_efficiency: f64,
    /// 0..=1
    pub quality_score: f64,
    pub created_at: DateTime<Utc>,
}

/// One health-probe window for a provider. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetricWindow {
    pub provider_id: String,
    pub request_count: u64,
    pub error_count: u64,
    pub uptime_pct: f64,
    pub avg_latency_ms: f64,
    pub recorded_at: DateTime<Utc>,
}

impl ProviderMetricWindow {
    /// Error rate in percent; a window without traffic has none.
    pub fn error_rate_pct(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 * 100.0 / self.request_count as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub provider_id: String,
    pub status: HealthStatus,
    pub message: String,
    pub latency_ms: u64,
    pub uptime_pct: f64,
    pub error_rate_pct: f64,
    pub checked_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Listing and statistics
// ---------------------------------------------------------------------------

/// Offset/limit pagination. `limit: None` returns everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: u32,
    pub limit: Option<u32>,
}

impl Page {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(offset: u32, limit: u32) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelFilter {
    pub provider_id: Option<String>,
    pub status: Option<ModelStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsagePeriod {
    Hour,
    Day,
    Week,
    Month,
    All,
}

impl UsagePeriod {
    /// Start of the period ending at `now`; `None` for [`UsagePeriod::All`].
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Hour => Some(now - Duration::hours(1)),
            Self::Day => Some(now - Duration::days(1)),
            Self::Week => Some(now - Duration::weeks(1)),
            Self::Month => Some(now - Duration::days(30)),
            Self::All => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageFilter {
    pub user_id: Option<String>,
    pub model_id: Option<String>,
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
    pub success_rate: f64,
    pub request_tokens: u64,
    pub response_tokens: u64,
    pub total_cost: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUsageStats {
    pub model_id: String,
    pub stats: UsageStats,
    pub latest_snapshot: Option<PerformanceSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsageStats {
    pub provider_id: String,
    pub stats: UsageStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(caps: &[&str]) -> Model {
        let now = Utc::now();
        Model {
            id: "m".into(),
            provider_id: "p".into(),
            name: "m".into(),
            status: ModelStatus::Active,
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            pricing: ModelPricing::default(),
            performance: DEFAULT_PERFORMANCE,
            latency_ms: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn capability_match_is_case_insensitive_containment() {
        let m = model(&["Text-Generation", "vision"]);
        assert!(m.has_capability("text-generation"));
        assert!(m.has_capability("VISION"));
        assert!(m.has_capability("generation"));
        assert!(!m.has_capability("audio"));
    }

    #[test]
    fn missing_input_price_is_free() {
        let m = model(&[]);
        assert_eq!(m.input_price(), 0.0);
    }

    #[test]
    fn condition_json_uses_type_tag() {
        let json = r#"{"type":"cost","operator":"less_than","value":0.01,"weight":1}"#;
        let cond: RoutingCondition = serde_json::from_str(json).unwrap();
        assert_eq!(
            cond.kind,
            ConditionKind::Cost {
                operator: Comparator::LessThan,
                value: 0.01
            }
        );
        assert_eq!(cond.weight, 1.0);
    }

    #[test]
    fn unknown_condition_type_is_rejected() {
        let json = r#"{"type":"sentiment","operator":"equals","value":"happy","weight":1}"#;
        assert!(serde_json::from_str::<RoutingCondition>(json).is_err());
    }

    #[test]
    fn cost_ceiling_targets_cost_priority() {
        let ceiling = ConditionKind::Cost {
            operator: Comparator::LessThan,
            value: 0.01,
        };
        let floor = ConditionKind::Cost {
            operator: Comparator::GreaterThan,
            value: 1.0,
        };
        assert_eq!(ceiling.priority_tier(), Some(RoutingPriority::Cost));
        assert_eq!(floor.priority_tier(), Some(RoutingPriority::Performance));

        let perf = ConditionKind::Performance {
            operator: Comparator::GreaterOrEqual,
            value: 80.0,
        };
        assert_eq!(perf.priority_tier(), Some(RoutingPriority::Performance));
    }

    #[test]
    fn max_latency_reads_context_fallback() {
        let mut req = RoutingRequest::new();
        assert_eq!(req.max_latency(), None);
        req.context
            .insert("maxLatency".into(), serde_json::json!(1500));
        assert_eq!(req.max_latency(), Some(1500.0));
        req.max_latency_ms = Some(200.0);
        assert_eq!(req.max_latency(), Some(200.0));
    }

    #[test]
    fn window_error_rate() {
        let w = ProviderMetricWindow {
            provider_id: "p".into(),
            request_count: 10,
            error_count: 1,
            uptime_pct: 100.0,
            avg_latency_ms: 0.0,
            recorded_at: Utc::now(),
        };
        assert_eq!(w.error_rate_pct(), 10.0);
        let idle = ProviderMetricWindow {
            request_count: 0,
            error_count: 0,
            ..w
        };
        assert_eq!(idle.error_rate_pct(), 0.0);
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [
            UsageStatus::Success,
            UsageStatus::Error,
            UsageStatus::Timeout,
            UsageStatus::RateLimited,
            UsageStatus::Cancelled,
        ] {
            assert_eq!(s.as_str().parse::<UsageStatus>().unwrap(), s);
        }
        assert!("bogus".parse::<ProviderStatus>().is_err());
    }
}
