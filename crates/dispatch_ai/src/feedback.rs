//! Performance feedback loop.
//!
//! [`SnapshotBuilder`] turns recent successful usage into a
//! [`PerformanceSnapshot`] and folds the latest snapshots into
//! `Model.performance`. [`FeedbackWorker`] runs those recomputations in the
//! background, one in flight per model, with failures counted, logged and
//! broadcast instead of reaching the request path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use dispatch_core::{DispatchError, FeedbackSettings, Result};

use crate::registry::Registry;
use crate::store::Store;
use crate::types::{PerformanceSnapshot, UsageRecord, UsageStatus};

const FAILURE_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Snapshot computation
// ---------------------------------------------------------------------------

/// Aggregates over a model's recent successful calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotMetrics {
    pub requests: u64,
    pub avg_latency_ms: f64,
    /// Mean of total tokens per millisecond of latency.
    pub token_efficiency: f64,
    /// `clamp(1 - avg_latency / ceiling, 0, 1)`
    pub quality_score: f64,
}

/// Summarizes usage records. `None` when there are none.
pub fn summarize(records: &[UsageRecord], latency_ceiling_ms: f64) -> Option<SnapshotMetrics> {
    if records.is_empty() {
        return None;
    }
    let n = records.len() as f64;
    let avg_latency_ms = records.iter().map(|r| r.latency_ms).sum::<f64>() / n;
    let token_efficiency = records
        .iter()
        .map(|r| r.total_tokens() as f64 / r.latency_ms.max(1.0))
        .sum::<f64>()
        / n;
    let quality_score = (1.0 - avg_latency_ms / latency_ceiling_ms).clamp(0.0, 1.0);
    Some(SnapshotMetrics {
        requests: records.len() as u64,
        avg_latency_ms,
        token_efficiency,
        quality_score,
    })
}

/// Recomputes snapshots and writes the result back through the registry.
pub struct SnapshotBuilder {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    settings: FeedbackSettings,
}

impl SnapshotBuilder {
    pub fn new(store: Arc<dyn Store>, registry: Arc<Registry>, settings: FeedbackSettings) -> Self {
        Self {
            store,
            registry,
            settings,
        }
    }

    pub fn lookback_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::hours(self.settings.lookback_hours)
    }

    /// Appends a snapshot for `model_id` and updates its performance.
    /// Returns `Ok(None)` without writing anything when the model had no
    /// successful calls in the lookback window.
    pub fn recompute(&self, model_id: &str) -> Result<Option<PerformanceSnapshot>> {
        self.try_recompute(model_id)
            .map_err(|e| DispatchError::Feedback(format!("model {model_id}: {e}")))
    }

    fn try_recompute(&self, model_id: &str) -> Result<Option<PerformanceSnapshot>> {
        let now = Utc::now();
        let records =
            self.store
                .usage_since(model_id, Some(UsageStatus::Success), self.lookback_start(now))?;
        let Some(metrics) = summarize(&records, self.settings.latency_ceiling_ms) else {
            debug!(model_id, "No successful usage in lookback window; skipping snapshot");
            return Ok(None);
        };

        let snapshot = PerformanceSnapshot {
            id: Uuid::new_v4().to_string(),
            model_id: model_id.to_string(),
            requests: metrics.requests,
            avg_latency_ms: metrics.avg_latency_ms,
            token_efficiency: metrics.token_efficiency,
            quality_score: metrics.quality_score,
            created_at: now,
        };
        self.store.append_snapshot(&snapshot)?;

        let recent = self
            .store
            .recent_snapshots(model_id, self.settings.snapshot_window)?;
        let mean_quality = if recent.is_empty() {
            snapshot.quality_score
        } else {
            recent.iter().map(|s| s.quality_score).sum::<f64>() / recent.len() as f64
        };
        let performance = mean_quality * 100.0;
        self.registry
            .apply_feedback(model_id, performance, metrics.avg_latency_ms)?;

        debug!(
            model_id,
            requests = metrics.requests,
            avg_latency_ms = metrics.avg_latency_ms,
            performance,
            "Recomputed performance snapshot"
        );
        Ok(Some(snapshot))
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// A recomputation that failed in the background.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackFailure {
    pub model_id: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackStats {
    /// Recomputations that appended a snapshot.
    pub completed: u64,
    /// Recomputations skipped for lack of successful usage.
    pub skipped: u64,
    pub failed: u64,
    /// Triggers folded into an already queued or running recomputation.
    pub coalesced: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flight {
    Queued,
    Running,
    /// New triggers arrived mid-run; run once more afterwards.
    RunningDirty,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    coalesced: AtomicU64,
}

struct Shared {
    flights: Mutex<HashMap<String, Flight>>,
    counters: Counters,
    failures: broadcast::Sender<FeedbackFailure>,
}

impl Shared {
    fn record(&self, model_id: &str, outcome: Result<Option<PerformanceSnapshot>>) {
        match outcome {
            Ok(Some(_)) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(model_id, "Feedback recomputation failed: {e}");
                // No subscribers is fine.
                let _ = self.failures.send(FeedbackFailure {
                    model_id: model_id.to_string(),
                    error: e.to_string(),
                    at: Utc::now(),
                });
            }
        }
    }
}

/// Background queue of snapshot recomputations keyed by model id.
pub struct FeedbackWorker {
    builder: Arc<SnapshotBuilder>,
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    shared: Arc<Shared>,
}

impl FeedbackWorker {
    pub fn new(builder: Arc<SnapshotBuilder>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            builder,
            tx,
            rx: Mutex::new(Some(rx)),
            shared: Arc::new(Shared {
                flights: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                failures,
            }),
        }
    }

    /// Queues a recomputation for `model_id`. Never blocks and never fails;
    /// a trigger for a model already queued or running is coalesced.
    pub fn enqueue(&self, model_id: &str) {
        let mut flights = self.shared.flights.lock();
        match flights.get_mut(model_id) {
            None => {
                if self.tx.send(model_id.to_string()).is_ok() {
                    flights.insert(model_id.to_string(), Flight::Queued);
                } else {
                    warn!(model_id, "Feedback queue closed; dropping trigger");
                }
            }
            Some(state) => {
                if *state == Flight::Running {
                    *state = Flight::RunningDirty;
                }
                self.shared.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Spawns the dispatch loop on the current tokio runtime. Returns `None`
    /// if the worker was already started.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let mut rx = self.rx.lock().take()?;
        let builder = self.builder.clone();
        let shared = self.shared.clone();
        info!("Feedback worker started");
        Some(tokio::spawn(async move {
            while let Some(model_id) = rx.recv().await {
                tokio::spawn(run_flight(builder.clone(), shared.clone(), model_id));
            }
            debug!("Feedback queue closed");
        }))
    }

    /// Synchronous recomputation outside the queue.
    pub fn recompute_now(&self, model_id: &str) -> Result<Option<PerformanceSnapshot>> {
        let outcome = self.builder.recompute(model_id);
        self.shared.record(model_id, outcome.clone());
        outcome
    }

    /// Queues every model with usage in the lookback window. Returns the
    /// number of models queued.
    pub fn refresh_all(&self) -> Result<usize> {
        let models = self
            .builder
            .store
            .models_with_usage(self.builder.lookback_start(Utc::now()))?;
        for model_id in &models {
            self.enqueue(model_id);
        }
        info!(models = models.len(), "Queued feedback refresh");
        Ok(models.len())
    }

    pub fn stats(&self) -> FeedbackStats {
        let c = &self.shared.counters;
        FeedbackStats {
            completed: c.completed.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
        }
    }

    /// Number of models queued or being recomputed.
    pub fn pending(&self) -> usize {
        self.shared.flights.lock().len()
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<FeedbackFailure> {
        self.shared.failures.subscribe()
    }
}

async fn run_flight(builder: Arc<SnapshotBuilder>, shared: Arc<Shared>, model_id: String) {
    loop {
        if let Some(state) = shared.flights.lock().get_mut(&model_id) {
            *state = Flight::Running;
        }

        let job = builder.clone();
        let id = model_id.clone();
        let outcome = tokio::task::spawn_blocking(move || job.recompute(&id))
            .await
            .unwrap_or_else(|e| {
                Err(DispatchError::Feedback(format!(
                    "recompute task aborted: {e}"
                )))
            });
        shared.record(&model_id, outcome);

        let mut flights = shared.flights.lock();
        if flights.get(&model_id) != Some(&Flight::RunningDirty) {
            flights.remove(&model_id);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::{NewModel, NewProvider};

    struct Fixture {
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        builder: Arc<SnapshotBuilder>,
        model_id: String,
        provider_id: String,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = Arc::new(Registry::new(store.clone()));
        let p = registry.create_provider(NewProvider::new("p")).unwrap();
        let m = registry.register_model(NewModel::new(&p.id, "m")).unwrap();
        let builder = Arc::new(SnapshotBuilder::new(
            store.clone(),
            registry.clone(),
            FeedbackSettings::default(),
        ));
        Fixture {
            store,
            registry,
            builder,
            model_id: m.id,
            provider_id: p.id,
        }
    }

    fn record(f: &Fixture, latency_ms: f64, status: UsageStatus, age: Duration) -> UsageRecord {
        let r = UsageRecord {
            id: Uuid::new_v4().to_string(),
            model_id: f.model_id.clone(),
            provider_id: f.provider_id.clone(),
            user_id: None,
            request_tokens: 400,
            response_tokens: 600,
            cost: 0.0,
            latency_ms,
            status,
            created_at: Utc::now() - age,
        };
        f.store.append_usage(&r).unwrap();
        r
    }

    #[test]
    fn summarize_computes_quality_and_efficiency() {
        let f = fixture();
        let records = vec![
            record(&f, 1_000.0, UsageStatus::Success, Duration::zero()),
            record(&f, 3_000.0, UsageStatus::Success, Duration::zero()),
        ];
        let m = summarize(&records, 10_000.0).unwrap();
        assert_eq!(m.requests, 2);
        assert_eq!(m.avg_latency_ms, 2_000.0);
        assert!((m.quality_score - 0.8).abs() < 1e-9);
        // (1000/1000 + 1000/3000) / 2
        assert!((m.token_efficiency - (1.0 + 1.0 / 3.0) / 2.0).abs() < 1e-9);
        assert!(summarize(&[], 10_000.0).is_none());
    }

    #[test]
    fn quality_clamps_to_zero_for_slow_models() {
        let f = fixture();
        let records = vec![record(&f, 25_000.0, UsageStatus::Success, Duration::zero())];
        assert_eq!(summarize(&records, 10_000.0).unwrap().quality_score, 0.0);
    }

    #[test]
    fn recompute_uses_recent_successes_only() {
        let f = fixture();
        record(&f, 1_000.0, UsageStatus::Success, Duration::zero());
        record(&f, 9_000.0, UsageStatus::Error, Duration::zero());
        record(&f, 9_000.0, UsageStatus::Success, Duration::hours(30));

        let snap = f.builder.recompute(&f.model_id).unwrap().unwrap();
        assert_eq!(snap.requests, 1);
        assert_eq!(snap.avg_latency_ms, 1_000.0);

        let model = f.registry.get_model(&f.model_id).unwrap();
        assert!((model.performance - 90.0).abs() < 1e-9);
        assert_eq!(model.latency_ms, 1_000.0);
    }

    #[test]
    fn no_successes_writes_nothing() {
        let f = fixture();
        record(&f, 500.0, UsageStatus::Timeout, Duration::zero());
        assert!(f.builder.recompute(&f.model_id).unwrap().is_none());
        assert!(f.store.recent_snapshots(&f.model_id, 10).unwrap().is_empty());
        assert_eq!(f.registry.get_model(&f.model_id).unwrap().performance, 50.0);
    }

    #[test]
    fn performance_converges_to_quality() {
        let f = fixture();
        for _ in 0..15 {
            record(&f, 2_500.0, UsageStatus::Success, Duration::zero());
            f.builder.recompute(&f.model_id).unwrap();
        }
        let model = f.registry.get_model(&f.model_id).unwrap();
        assert!((model.performance / 100.0 - 0.75).abs() < 1e-9);
    }

    #[test]
    fn failure_for_deleted_model_is_reported() {
        let f = fixture();
        record(&f, 100.0, UsageStatus::Success, Duration::zero());
        f.registry.delete_model(&f.model_id).unwrap();

        let worker = FeedbackWorker::new(f.builder.clone());
        let mut failures = worker.subscribe_failures();
        let err = worker.recompute_now(&f.model_id).unwrap_err();
        assert!(matches!(err, DispatchError::Feedback(_)));
        assert_eq!(worker.stats().failed, 1);
        assert_eq!(failures.try_recv().unwrap().model_id, f.model_id);
    }

    #[test]
    fn triggers_coalesce_while_queued() {
        let f = fixture();
        let worker = FeedbackWorker::new(f.builder.clone());
        worker.enqueue(&f.model_id);
        worker.enqueue(&f.model_id);
        worker.enqueue(&f.model_id);
        assert_eq!(worker.pending(), 1);
        assert_eq!(worker.stats().coalesced, 2);
    }

    #[tokio::test]
    async fn worker_processes_queue() {
        let f = fixture();
        record(&f, 1_000.0, UsageStatus::Success, Duration::zero());
        let worker = FeedbackWorker::new(f.builder.clone());
        let handle = worker.start();
        assert!(handle.is_some());
        assert!(worker.start().is_none());

        worker.enqueue(&f.model_id);
        for _ in 0..200 {
            if worker.pending() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(worker.pending(), 0);
        assert_eq!(worker.stats().completed, 1);
        let model = f.registry.get_model(&f.model_id).unwrap();
        assert!((model.performance - 90.0).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[allow(clippy::await_holding_lock)]
    async fn trigger_during_run_causes_one_rerun() {
        let sqlite = Arc::new(SqliteStore::open_in_memory().unwrap());
        let store: Arc<dyn Store> = sqlite.clone();
        let registry = Arc::new(Registry::new(store.clone()));
        let p = registry.create_provider(NewProvider::new("p")).unwrap();
        let m = registry.register_model(NewModel::new(&p.id, "m")).unwrap();
        let f = Fixture {
            store: store.clone(),
            registry: registry.clone(),
            builder: Arc::new(SnapshotBuilder::new(
                store,
                registry,
                FeedbackSettings::default(),
            )),
            model_id: m.id,
            provider_id: p.id,
        };
        record(&f, 1_000.0, UsageStatus::Success, Duration::zero());

        let worker = FeedbackWorker::new(f.builder.clone());
        worker.start();

        let held = sqlite.lock_connection();
        worker.enqueue(&f.model_id);
        let mut running = false;
        for _ in 0..200 {
            running = worker.shared.flights.lock().get(&f.model_id) == Some(&Flight::Running);
            if running {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(running);

        worker.enqueue(&f.model_id);
        worker.enqueue(&f.model_id);
        assert_eq!(
            worker.shared.flights.lock().get(&f.model_id),
            Some(&Flight::RunningDirty)
        );
        drop(held);

        for _ in 0..200 {
            if worker.pending() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let stats = worker.stats();
        assert_eq!(worker.pending(), 0);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.coalesced, 2);
        assert_eq!(f.store.recent_snapshots(&f.model_id, 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn refresh_all_queues_models_with_usage() {
        let f = fixture();
        record(&f, 1_000.0, UsageStatus::Success, Duration::zero());
        let worker = FeedbackWorker::new(f.builder.clone());
        assert_eq!(worker.refresh_all().unwrap(), 1);
        assert_eq!(worker.pending(), 1);
    }
}
