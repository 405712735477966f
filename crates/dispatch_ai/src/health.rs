//! Provider health monitoring.
//!
//! A probe is a lightweight liveness call against a provider. Every probe
//! appends a [`ProviderMetricWindow`] and the provider is classified over
//! the most recent windows. Latest reports are cached in memory and gate
//! routing: an `unhealthy` provider is skipped until a later probe clears it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dispatch_core::{DispatchError, HealthSettings, Result};

use crate::deadline::Deadline;
use crate::registry::Registry;
use crate::store::Store;
use crate::types::{HealthReport, HealthStatus, Page, Provider, ProviderMetricWindow};

/// Tolerance for percentage threshold comparisons.
const EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// A liveness check against one provider.
#[async_trait]
pub trait ProviderProbe: Send + Sync {
    /// Returns `Err(DispatchError::Probe)` when the provider did not answer
    /// successfully. Timeouts are enforced by the caller.
    async fn check(&self, provider: &Provider) -> Result<()>;
}

/// HTTP GET against the provider's `health` endpoint, or its first endpoint.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn endpoint(provider: &Provider) -> Option<&str> {
        provider
            .endpoints
            .get("health")
            .or_else(|| provider.endpoints.values().next())
            .map(String::as_str)
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderProbe for HttpProbe {
    async fn check(&self, provider: &Provider) -> Result<()> {
        let url = Self::endpoint(provider).ok_or_else(|| {
            DispatchError::Probe(format!("provider '{}' has no endpoints", provider.name))
        })?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DispatchError::Probe(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Probe(format!("{url}: HTTP {status}")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Window aggregates a classification was based on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub status: HealthStatus,
    pub uptime_pct: f64,
    pub error_rate_pct: f64,
}

/// Classifies a provider from its recent windows and the latest probe latency.
///
/// Unhealthy when the mean error rate is strictly above the threshold;
/// otherwise degraded when mean uptime is strictly below its threshold or the
/// probe was slower than allowed.
pub fn classify(
    settings: &HealthSettings,
    windows: &[ProviderMetricWindow],
    probe_latency_ms: u64,
) -> Classification {
    let (uptime_pct, error_rate_pct) = if windows.is_empty() {
        (100.0, 0.0)
    } else {
        let n = windows.len() as f64;
        (
            windows.iter().map(|w| w.uptime_pct).sum::<f64>() / n,
            windows.iter().map(|w| w.error_rate_pct()).sum::<f64>() / n,
        )
    };

    let status = if error_rate_pct > settings.unhealthy_error_rate_pct + EPSILON {
        HealthStatus::Unhealthy
    } else if uptime_pct < settings.degraded_uptime_pct - EPSILON
        || probe_latency_ms > settings.degraded_latency_ms
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    Classification {
        status,
        uptime_pct,
        error_rate_pct,
    }
}

/// Appends a metric window covering the provider's usage since its previous
/// window, then returns the most recent `window_count` windows. Runs on the
/// blocking pool.
fn record_window(
    store: &dyn Store,
    settings: &HealthSettings,
    provider: &Provider,
    up: bool,
    latency_ms: u64,
) -> Vec<ProviderMetricWindow> {
    let now = Utc::now();
    let since = store
        .recent_provider_windows(&provider.id, 1)
        .ok()
        .and_then(|w| w.into_iter().next())
        .map(|w| w.recorded_at)
        .unwrap_or_else(|| now - ChronoDuration::seconds(settings.check_interval_secs as i64));
    let counts = store
        .provider_usage_counts(&provider.id, since, now)
        .unwrap_or_else(|e| {
            warn!(provider = %provider.name, "Failed to count usage: {e}");
            Default::default()
        });

    let window = ProviderMetricWindow {
        provider_id: provider.id.clone(),
        request_count: counts.requests,
        error_count: counts.errors,
        uptime_pct: if up { 100.0 } else { 0.0 },
        avg_latency_ms: latency_ms as f64,
        recorded_at: now,
    };
    if let Err(e) = store.append_provider_window(&window) {
        warn!(provider = %provider.name, "Failed to record metric window: {e}");
    }

    match store.recent_provider_windows(&provider.id, settings.window_count) {
        Ok(windows) if !windows.is_empty() => windows,
        Ok(_) => vec![window],
        Err(e) => {
            warn!(provider = %provider.name, "Failed to load metric windows: {e}");
            vec![window]
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Probes providers, records metric windows and caches the latest reports.
pub struct HealthMonitor {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    probe: Arc<dyn ProviderProbe>,
    settings: HealthSettings,
    reports: RwLock<HashMap<String, HealthReport>>,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        probe: Arc<dyn ProviderProbe>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            store,
            registry,
            probe,
            settings,
            reports: RwLock::new(HashMap::new()),
        }
    }

    /// Probes one provider. Probe failures and timeouts become an
    /// `unhealthy` report; only an unknown provider id is an error.
    pub async fn check(&self, provider_id: &str) -> Result<HealthReport> {
        let provider = self.registry.get_provider(provider_id)?;
        Ok(self.probe_provider(&provider).await)
    }

    /// Probes every registered provider, at most
    /// `max_concurrent_probes` at a time.
    pub async fn check_all(&self) -> Result<HashMap<String, HealthReport>> {
        let providers = self.registry.list_providers(None, Page::all())?;
        Ok(self.check_providers(providers).await)
    }

    /// Probes the given providers concurrently. One slow or failing provider
    /// never delays or fails the others beyond its own timeout.
    pub async fn check_providers(&self, providers: Vec<Provider>) -> HashMap<String, HealthReport> {
        let started = Instant::now();
        let total = providers.len();
        let reports: HashMap<String, HealthReport> = futures::stream::iter(providers)
            .map(|provider| async move {
                let report = self.probe_provider(&provider).await;
                (provider.id, report)
            })
            .buffer_unordered(self.settings.max_concurrent_probes.max(1))
            .collect()
            .await;

        let unhealthy = reports
            .values()
            .filter(|r| r.status == HealthStatus::Unhealthy)
            .count();
        info!(
            providers = total,
            unhealthy,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch health check complete"
        );
        reports
    }

    async fn probe_provider(&self, provider: &Provider) -> HealthReport {
        let timeout = Duration::from_millis(self.settings.probe_timeout_ms);
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.probe.check(provider)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("probe timed out after {}ms", timeout.as_millis())),
        };

        let store = self.store.clone();
        let settings = self.settings.clone();
        let owned = provider.clone();
        let up = failure.is_none();
        let windows = tokio::task::spawn_blocking(move || {
            record_window(store.as_ref(), &settings, &owned, up, latency_ms)
        })
        .await
        .unwrap_or_else(|e| {
            warn!(provider = %provider.name, "Metric window task failed: {e}");
            Vec::new()
        });
        let classification = classify(&self.settings, &windows, latency_ms);

        let (status, message) = match failure {
            Some(reason) => (HealthStatus::Unhealthy, reason),
            None => (
                classification.status,
                match classification.status {
                    HealthStatus::Healthy => "ok".to_string(),
                    HealthStatus::Degraded => format!(
                        "uptime {:.1}%, probe latency {latency_ms}ms",
                        classification.uptime_pct
                    ),
                    HealthStatus::Unhealthy => format!(
                        "error rate {:.1}% over {} windows",
                        classification.error_rate_pct,
                        windows.len()
                    ),
                },
            ),
        };

        let report = HealthReport {
            provider_id: provider.id.clone(),
            status,
            message,
            latency_ms,
            uptime_pct: classification.uptime_pct,
            error_rate_pct: classification.error_rate_pct,
            checked_at: Utc::now(),
        };

        let previous = self
            .reports
            .write()
            .insert(provider.id.clone(), report.clone());
        match previous.map(|r| r.status) {
            Some(prev) if prev != report.status => {
                info!(
                    provider = %provider.name,
                    from = ?prev,
                    to = ?report.status,
                    "Provider health changed"
                );
            }
            _ if report.status == HealthStatus::Unhealthy => {
                warn!(provider = %provider.name, reason = %report.message, "Provider unhealthy");
            }
            _ => debug!(
                provider = %provider.name,
                status = ?report.status,
                latency_ms,
                "Probe complete"
            ),
        }
        report
    }

    /// Latest cached report for a provider, if it was ever probed.
    pub fn latest(&self, provider_id: &str) -> Option<HealthReport> {
        self.reports.read().get(provider_id).cloned()
    }

    pub fn latest_all(&self) -> HashMap<String, HealthReport> {
        self.reports.read().clone()
    }

    /// Whether routing may use the provider. Never-probed providers are live.
    pub fn is_routable(&self, provider_id: &str, deadline: Deadline) -> Result<bool> {
        deadline.check("health lookup")?;
        Ok(self
            .reports
            .read()
            .get(provider_id)
            .is_none_or(|r| r.status != HealthStatus::Unhealthy))
    }

    /// Drops the cached report for a provider.
    pub fn forget(&self, provider_id: &str) {
        self.reports.write().remove(provider_id);
    }
}
