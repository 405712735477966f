//! Usage recording and read-only usage statistics.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use dispatch_core::{DispatchError, FeedbackSettings, Result};

use crate::feedback::{FeedbackWorker, SnapshotBuilder};
use crate::registry::Registry;
use crate::store::{StatsGrouping, Store};
use crate::types::{
    ModelUsageStats, NewUsageRecord, ProviderUsageStats, UsageFilter, UsagePeriod, UsageRecord,
    UsageStats,
};

fn validate_record(input: &NewUsageRecord) -> Result<()> {
    if !input.latency_ms.is_finite() || input.latency_ms < 0.0 {
        return Err(DispatchError::Validation(
            "latency must be a non-negative number".into(),
        ));
    }
    if !input.cost.is_finite() || input.cost < 0.0 {
        return Err(DispatchError::Validation(
            "cost must be a non-negative number".into(),
        ));
    }
    Ok(())
}

/// Appends usage records and triggers performance feedback.
pub struct MetricsCollector {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    feedback: FeedbackWorker,
    recompute_every: u32,
    since_trigger: Mutex<HashMap<String, u32>>,
}

impl MetricsCollector {
    pub fn new(store: Arc<dyn Store>, registry: Arc<Registry>, settings: FeedbackSettings) -> Self {
        let recompute_every = settings.recompute_every.max(1);
        let builder = Arc::new(SnapshotBuilder::new(
            store.clone(),
            registry.clone(),
            settings,
        ));
        Self {
            store,
            registry,
            feedback: FeedbackWorker::new(builder),
            recompute_every,
            since_trigger: Mutex::new(HashMap::new()),
        }
    }

    pub fn feedback(&self) -> &FeedbackWorker {
        &self.feedback
    }

    /// Starts the background feedback worker on the current runtime.
    pub fn start_feedback(&self) -> Option<JoinHandle<()>> {
        self.feedback.start()
    }

    /// Durably appends a usage record, then queues a recomputation for the
    /// model every `recompute_every` records. The queueing never blocks and
    /// its failures never surface here.
    pub fn record_usage(
        &self,
        user_id: Option<&str>,
        input: NewUsageRecord,
    ) -> Result<UsageRecord> {
        validate_record(&input)?;
        let model = self.registry.get_model(&input.model_id)?;
        let record = UsageRecord {
            id: Uuid::new_v4().to_string(),
            model_id: model.id,
            provider_id: model.provider_id,
            user_id: user_id.map(String::from),
            request_tokens: input.request_tokens,
            response_tokens: input.response_tokens,
            cost: input.cost,
            latency_ms: input.latency_ms,
            status: input.status,
            created_at: Utc::now(),
        };
        self.store.append_usage(&record)?;
        debug!(
            model_id = %record.model_id,
            status = ?record.status,
            latency_ms = record.latency_ms,
            "Recorded usage"
        );

        if self.should_trigger(&record.model_id) {
            self.feedback.enqueue(&record.model_id);
        }
        Ok(record)
    }

    fn should_trigger(&self, model_id: &str) -> bool {
        let mut counts = self.since_trigger.lock();
        let count = counts.entry(model_id.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.recompute_every {
            *count = 0;
            true
        } else {
            false
        }
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    /// Per-model aggregates with each model's latest snapshot, busiest first.
    pub fn model_usage_stats(
        &self,
        period: UsagePeriod,
        filter: &UsageFilter,
    ) -> Result<Vec<ModelUsageStats>> {
        let since = period.since(Utc::now());
        self.store
            .aggregate_usage(StatsGrouping::Model, since, filter)?
            .into_iter()
            .filter_map(|g| g.key.map(|k| (k, g.stats)))
            .map(|(model_id, stats)| -> Result<ModelUsageStats> {
                let latest_snapshot = self.store.recent_snapshots(&model_id, 1)?.into_iter().next();
                Ok(ModelUsageStats {
                    model_id,
                    stats,
                    latest_snapshot,
                })
            })
            .collect()
    }

    /// Per-provider aggregates, busiest first.
    pub fn provider_usage_stats(
        &self,
        period: UsagePeriod,
        filter: &UsageFilter,
    ) -> Result<Vec<ProviderUsageStats>> {
        let since = period.since(Utc::now());
        Ok(self
            .store
            .aggregate_usage(StatsGrouping::Provider, since, filter)?
            .into_iter()
            .filter_map(|g| {
                g.key.map(|provider_id| ProviderUsageStats {
                    provider_id,
                    stats: g.stats,
                })
            })
            .collect())
    }

    pub fn total_usage_stats(
        &self,
        period: UsagePeriod,
        filter: &UsageFilter,
    ) -> Result<UsageStats> {
        let since = period.since(Utc::now());
        Ok(self
            .store
            .aggregate_usage(StatsGrouping::Total, since, filter)?
            .into_iter()
            .next()
            .map(|g| g.stats)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::{NewModel, NewProvider, UsageStatus};

    struct Fixture {
        metrics: MetricsCollector,
        registry: Arc<Registry>,
        model_a: String,
        model_b: String,
        provider: String,
    }

    fn fixture(settings: FeedbackSettings) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = Arc::new(Registry::new(store.clone()));
        let p = registry.create_provider(NewProvider::new("p")).unwrap();
        let a = registry.register_model(NewModel::new(&p.id, "a")).unwrap();
        let b = registry.register_model(NewModel::new(&p.id, "b")).unwrap();
        Fixture {
            metrics: MetricsCollector::new(store, registry.clone(), settings),
            registry,
            model_a: a.id,
            model_b: b.id,
            provider: p.id,
        }
    }

    #[test]
    fn record_fills_provider_and_user() {
        let f = fixture(FeedbackSettings::default());
        let rec = f
            .metrics
            .record_usage(
                Some("alice"),
                NewUsageRecord::success(&f.model_a, 120.0).with_tokens(10, 20),
            )
            .unwrap();
        assert_eq!(rec.provider_id, f.provider);
        assert_eq!(rec.user_id.as_deref(), Some("alice"));
        assert_eq!(rec.total_tokens(), 30);
    }

    #[test]
    fn unknown_model_is_not_found() {
        let f = fixture(FeedbackSettings::default());
        let err = f
            .metrics
            .record_usage(None, NewUsageRecord::success("ghost", 1.0))
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
    }

    #[test]
    fn negative_latency_rejected() {
        let f = fixture(FeedbackSettings::default());
        assert!(matches!(
            f.metrics
                .record_usage(None, NewUsageRecord::success(&f.model_a, -5.0)),
            Err(DispatchError::Validation(_))
        ));
    }

    #[test]
    fn recording_does_not_wait_for_feedback() {
        // Worker never started: records still land and performance is untouched.
        let f = fixture(FeedbackSettings::default());
        for _ in 0..5 {
            f.metrics
                .record_usage(None, NewUsageRecord::success(&f.model_a, 100.0))
                .unwrap();
        }
        assert_eq!(f.registry.get_model(&f.model_a).unwrap().performance, 50.0);
        assert_eq!(f.metrics.feedback().pending(), 1);
        assert_eq!(f.metrics.feedback().stats().coalesced, 4);
    }

    #[test]
    fn trigger_every_n_records() {
        let f = fixture(FeedbackSettings {
            recompute_every: 3,
            ..Default::default()
        });
        for _ in 0..2 {
            f.metrics
                .record_usage(None, NewUsageRecord::success(&f.model_a, 100.0))
                .unwrap();
        }
        assert_eq!(f.metrics.feedback().pending(), 0);
        f.metrics
            .record_usage(None, NewUsageRecord::success(&f.model_a, 100.0))
            .unwrap();
        assert_eq!(f.metrics.feedback().pending(), 1);
    }

    #[test]
    fn stats_group_and_filter() {
        let f = fixture(FeedbackSettings::default());
        let m = &f.metrics;
        m.record_usage(Some("u1"), NewUsageRecord::success(&f.model_a, 100.0).with_cost(0.5))
            .unwrap();
        m.record_usage(
            Some("u1"),
            NewUsageRecord::success(&f.model_a, 300.0).with_status(UsageStatus::Error),
        )
        .unwrap();
        m.record_usage(Some("u2"), NewUsageRecord::success(&f.model_b, 200.0))
            .unwrap();
        m.feedback().recompute_now(&f.model_a).unwrap();

        let total = m
            .total_usage_stats(UsagePeriod::Day, &UsageFilter::default())
            .unwrap();
        assert_eq!(total.requests, 3);
        assert_eq!(total.successes, 2);
        assert_eq!(total.errors, 1);
        assert!((total.avg_latency_ms - 200.0).abs() < 1e-9);

        let by_model = m
            .model_usage_stats(UsagePeriod::All, &UsageFilter::default())
            .unwrap();
        assert_eq!(by_model.len(), 2);
        assert_eq!(by_model[0].model_id, f.model_a);
        assert!(by_model[0].latest_snapshot.is_some());
        assert!(by_model[1].latest_snapshot.is_none());

        let only_u2 = UsageFilter {
            user_id: Some("u2".into()),
            ..Default::default()
        };
        let by_provider = m.provider_usage_stats(UsagePeriod::Hour, &only_u2).unwrap();
        assert_eq!(by_provider.len(), 1);
        assert_eq!(by_provider[0].stats.requests, 1);
    }
}
