//! Persistence seam for the routing engine.
//!
//! [`Store`] is the only way the registry, rule book, health monitor and
//! metrics collector touch durable state. [`SqliteStore`] is the production
//! implementation; tests use [`SqliteStore::open_in_memory`].

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use dispatch_core::{DispatchError, Result};

use crate::types::{
    Model, ModelFilter, ModelPricing, Page, PerformanceSnapshot, Provider, ProviderMetricWindow,
    ProviderStatus, RoutingRule, RoutingTarget, UsageFilter, UsageRecord, UsageStats,
    UsageStatus,
};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Result of a delete that may be blocked by dependent records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// Names of the records still referencing the target.
    Blocked(Vec<String>),
}

/// Request/error totals for a provider over a time range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounts {
    pub requests: u64,
    pub errors: u64,
}

/// How usage statistics are grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsGrouping {
    Total,
    Model,
    Provider,
}

/// Aggregated usage for one group key (`None` for [`StatsGrouping::Total`]).
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedUsage {
    pub key: Option<String>,
    pub stats: UsageStats,
}

/// Durable storage for providers, models, rules and the append-only logs.
///
/// Implementations must make each method atomic; delete checks and the
/// delete itself happen in one transaction.
pub trait Store: Send + Sync {
    // Providers
    fn insert_provider(&self, provider: &Provider) -> Result<()>;
    fn update_provider(&self, provider: &Provider) -> Result<()>;
    fn delete_provider(&self, id: &str) -> Result<DeleteOutcome>;
    fn get_provider(&self, id: &str) -> Result<Option<Provider>>;
    fn find_provider_by_name(&self, name: &str) -> Result<Option<Provider>>;
    fn list_providers(&self, status: Option<ProviderStatus>, page: Page) -> Result<Vec<Provider>>;

    // Models
    fn insert_model(&self, model: &Model) -> Result<()>;
    fn update_model(&self, model: &Model) -> Result<()>;
    /// Writes the feedback-owned columns. Returns `false` for an unknown id.
    fn set_model_performance(&self, id: &str, performance: f64, latency_ms: f64) -> Result<bool>;
    fn delete_model(&self, id: &str) -> Result<DeleteOutcome>;
    fn get_model(&self, id: &str) -> Result<Option<Model>>;
    fn find_model_by_name(&self, provider_id: &str, name: &str) -> Result<Option<Model>>;
    /// Models in insertion order.
    fn list_models(&self, filter: &ModelFilter, page: Page) -> Result<Vec<Model>>;

    // Rules
    fn insert_rule(&self, rule: &RoutingRule) -> Result<()>;
    fn update_rule(&self, rule: &RoutingRule) -> Result<()>;
    fn delete_rule(&self, id: &str) -> Result<DeleteOutcome>;
    fn get_rule(&self, id: &str) -> Result<Option<RoutingRule>>;
    fn find_rule_by_name(&self, name: &str) -> Result<Option<RoutingRule>>;
    /// Rules in insertion order.
    fn list_rules(&self, active_only: bool) -> Result<Vec<RoutingRule>>;

    // Usage log
    fn append_usage(&self, record: &UsageRecord) -> Result<()>;
    /// Records for a model created at or after `since`, oldest first.
    fn usage_since(
        &self,
        model_id: &str,
        status: Option<UsageStatus>,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>>;
    /// Counts for records with `since < created_at <= until`.
    fn provider_usage_counts(
        &self,
        provider_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<UsageCounts>;
    fn models_with_usage(&self, since: DateTime<Utc>) -> Result<Vec<String>>;
    fn aggregate_usage(
        &self,
        grouping: StatsGrouping,
        since: Option<DateTime<Utc>>,
        filter: &UsageFilter,
    ) -> Result<Vec<GroupedUsage>>;

    // Performance snapshots
    fn append_snapshot(&self, snapshot: &PerformanceSnapshot) -> Result<()>;
    /// Newest first.
    fn recent_snapshots(&self, model_id: &str, limit: usize) -> Result<Vec<PerformanceSnapshot>>;

    // Provider metric windows
    fn append_provider_window(&self, window: &ProviderMetricWindow) -> Result<()>;
    /// Newest first.
    fn recent_provider_windows(
        &self,
        provider_id: &str,
        limit: usize,
    ) -> Result<Vec<ProviderMetricWindow>>;
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

/// Statuses counted as failures in error rates.
const FAILURE_STATUSES: &str = "('error', 'timeout', 'rate_limited')";

fn conversion_error(idx: usize, ty: Type, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, msg.into())
}

fn ts_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| {
            conversion_error(idx, Type::Integer, format!("timestamp out of range: {ms}"))
        })
}

fn json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, Type::Text, e.to_string()))
}

fn enum_column<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = DispatchError>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: DispatchError| conversion_error(idx, Type::Text, e.to_string()))
}

fn count_column(row: &Row, idx: usize) -> rusqlite::Result<u64> {
    let n: Option<i64> = row.get(idx)?;
    Ok(n.unwrap_or(0).max(0) as u64)
}

fn limit_param(page: Page) -> i64 {
    page.limit.map_or(-1, i64::from)
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

const PROVIDER_COLUMNS: &str = "id, name, status, priority, endpoints, created_at, updated_at";

fn provider_from_row(row: &Row) -> rusqlite::Result<Provider> {
    Ok(Provider {
        id: row.get(0)?,
        name: row.get(1)?,
        status: enum_column(row, 2)?,
        priority: row.get(3)?,
        endpoints: json_column(row, 4)?,
        created_at: ts_column(row, 5)?,
        updated_at: ts_column(row, 6)?,
    })
}

const MODEL_COLUMNS: &str = "id, provider_id, name, status, capabilities, input_price, \
     output_price, performance, latency_ms, created_at, updated_at";

fn model_from_row(row: &Row) -> rusqlite::Result<Model> {
    Ok(Model {
        id: row.get(0)?,
        provider_id: row.get(1)?,
        name: row.get(2)?,
        status: enum_column(row, 3)?,
        capabilities: json_column(row, 4)?,
        pricing: ModelPricing {
            input: row.get(5)?,
            output: row.get(6)?,
        },
        performance: row.get(7)?,
        latency_ms: row.get(8)?,
        created_at: ts_column(row, 9)?,
        updated_at: ts_column(row, 10)?,
    })
}

const RULE_COLUMNS: &str =
    "id, name, strategy, is_active, conditions, fallback_model_id, created_at, updated_at";

/// Rule row without its targets; those live in `rule_targets`.
fn rule_from_row(row: &Row) -> rusqlite::Result<RoutingRule> {
    Ok(RoutingRule {
        id: row.get(0)?,
        name: row.get(1)?,
        strategy: enum_column(row, 2)?,
        is_active: row.get(3)?,
        conditions: json_column(row, 4)?,
        targets: Vec::new(),
        fallback_model: row.get(5)?,
        created_at: ts_column(row, 6)?,
        updated_at: ts_column(row, 7)?,
    })
}

const USAGE_COLUMNS: &str = "id, model_id, provider_id, user_id, request_tokens, \
     response_tokens, cost, latency_ms, status, created_at";

fn usage_from_row(row: &Row) -> rusqlite::Result<UsageRecord> {
    Ok(UsageRecord {
        id: row.get(0)?,
        model_id: row.get(1)?,
        provider_id: row.get(2)?,
        user_id: row.get(3)?,
        request_tokens: row.get(4)?,
        response_tokens: row.get(5)?,
        cost: row.get(6)?,
        latency_ms: row.get(7)?,
        status: enum_column(row, 8)?,
        created_at: ts_column(row, 9)?,
    })
}

fn snapshot_from_row(row: &Row) -> rusqlite::Result<PerformanceSnapshot> {
    Ok(PerformanceSnapshot {
        id: row.get(0)?,
        model_id: row.get(1)?,
        requests: count_column(row, 2)?,
        avg_latency_ms: row.get(3)?,
        token_efficiency: row.get(4)?,
        quality_score: row.get(5)?,
        created_at: ts_column(row, 6)?,
    })
}

fn window_from_row(row: &Row) -> rusqlite::Result<ProviderMetricWindow> {
    Ok(ProviderMetricWindow {
        provider_id: row.get(0)?,
        request_count: count_column(row, 1)?,
        error_count: count_column(row, 2)?,
        uptime_pct: row.get(3)?,
        avg_latency_ms: row.get(4)?,
        recorded_at: ts_column(row, 5)?,
    })
}

fn stats_from_row(row: &Row, offset: usize) -> rusqlite::Result<UsageStats> {
    let requests = count_column(row, offset)?;
    let successes = count_column(row, offset + 1)?;
    let errors = count_column(row, offset + 2)?;
    let avg_latency: Option<f64> = row.get(offset + 6)?;
    Ok(UsageStats {
        requests,
        successes,
        errors,
        success_rate: if requests == 0 {
            0.0
        } else {
            successes as f64 / requests as f64
        },
        request_tokens: count_column(row, offset + 3)?,
        response_tokens: count_column(row, offset + 4)?,
        total_cost: row.get::<_, Option<f64>>(offset + 5)?.unwrap_or(0.0),
        avg_latency_ms: avg_latency.unwrap_or(0.0),
    })
}

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

/// SQLite-backed [`Store`]. Timestamps are stored as unix milliseconds.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path`.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DispatchError::Storage(format!(
                    "failed to create directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            DispatchError::Storage(format!("failed to open {}: {e}", path.display()))
        })?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("Database opened at {}", path.display());
        Ok(store)
    }

    /// Opens an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Holds the connection so every store call blocks until the guard drops.
    #[cfg(test)]
    pub(crate) fn lock_connection(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS providers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                endpoints TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS models (
                id TEXT PRIMARY KEY,
                provider_id TEXT NOT NULL REFERENCES providers(id),
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                capabilities TEXT NOT NULL DEFAULT '[]',
                input_price REAL,
                output_price REAL,
                performance REAL NOT NULL,
                latency_ms REAL NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (provider_id, name)
            );

            CREATE TABLE IF NOT EXISTS rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                strategy TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                conditions TEXT NOT NULL DEFAULT '[]',
                fallback_model_id TEXT REFERENCES models(id),
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rule_targets (
                rule_id TEXT NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                model_id TEXT NOT NULL REFERENCES models(id),
                weight REAL NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (rule_id, position)
            );

            CREATE TABLE IF NOT EXISTS usage_records (
                id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                user_id TEXT,
                request_tokens INTEGER NOT NULL,
                response_tokens INTEGER NOT NULL,
                cost REAL NOT NULL,
                latency_ms REAL NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS performance_snapshots (
                id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                requests INTEGER NOT NULL,
                avg_latency_ms REAL NOT NULL,
                token_efficiency REAL NOT NULL,
                quality_score REAL NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS provider_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider_id TEXT NOT NULL REFERENCES providers(id) ON DELETE CASCADE,
                request_count INTEGER NOT NULL,
                error_count INTEGER NOT NULL,
                uptime_pct REAL NOT NULL,
                avg_latency_ms REAL NOT NULL,
                recorded_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_models_provider
                ON models(provider_id);
            CREATE INDEX IF NOT EXISTS idx_rule_targets_model
                ON rule_targets(model_id);
            CREATE INDEX IF NOT EXISTS idx_usage_model_created
                ON usage_records(model_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_usage_provider_created
                ON usage_records(provider_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_snapshots_model_created
                ON performance_snapshots(model_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_provider_metrics_provider
                ON provider_metrics(provider_id, recorded_at);
            ",
        )?;
        Ok(())
    }

    fn load_targets(conn: &Connection, rule: &mut RoutingRule) -> Result<()> {
        let mut stmt = conn.prepare(
            "SELECT model_id, weight, priority FROM rule_targets
             WHERE rule_id = ?1 ORDER BY position",
        )?;
        rule.targets = stmt
            .query_map(params![rule.id], |row| {
                Ok(RoutingTarget {
                    model_id: row.get(0)?,
                    weight: row.get(1)?,
                    priority: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(())
    }

    fn write_targets(tx: &Transaction, rule: &RoutingRule) -> Result<()> {
        tx.execute("DELETE FROM rule_targets WHERE rule_id = ?1", params![rule.id])?;
        for (position, target) in rule.targets.iter().enumerate() {
            tx.execute(
                "INSERT INTO rule_targets (rule_id, position, model_id, weight, priority)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    rule.id,
                    position as i64,
                    target.model_id,
                    target.weight,
                    target.priority
                ],
            )?;
        }
        Ok(())
    }

    fn query_rules(&self, sql: &str, param: Option<&str>) -> Result<Vec<RoutingRule>> {
        let conn = self.conn.lock();
        let mut rules = {
            let mut stmt = conn.prepare(sql)?;
            let rows = match param {
                Some(p) => stmt.query_map(params![p], rule_from_row)?,
                None => stmt.query_map([], rule_from_row)?,
            };
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for rule in &mut rules {
            Self::load_targets(&conn, rule)?;
        }
        Ok(rules)
    }
}

impl Store for SqliteStore {
    // -----------------------------------------------------------------------
    // Providers
    // -----------------------------------------------------------------------

    fn insert_provider(&self, provider: &Provider) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO providers (id, name, status, priority, endpoints, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                provider.id,
                provider.name,
                provider.status.as_str(),
                provider.priority,
                serde_json::to_string(&provider.endpoints)?,
                provider.created_at.timestamp_millis(),
                provider.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn update_provider(&self, provider: &Provider) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE providers SET name = ?2, status = ?3, priority = ?4, endpoints = ?5,
                 updated_at = ?6
             WHERE id = ?1",
            params![
                provider.id,
                provider.name,
                provider.status.as_str(),
                provider.priority,
                serde_json::to_string(&provider.endpoints)?,
                provider.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn delete_provider(&self, id: &str) -> Result<DeleteOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let dependents = {
            let mut stmt =
                tx.prepare("SELECT name FROM models WHERE provider_id = ?1 ORDER BY rowid")?;
            stmt.query_map(params![id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        if !dependents.is_empty() {
            return Ok(DeleteOutcome::Blocked(dependents));
        }
        let removed = tx.execute("DELETE FROM providers WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(if removed == 0 {
            DeleteOutcome::NotFound
        } else {
            DeleteOutcome::Deleted
        })
    }

    fn get_provider(&self, id: &str) -> Result<Option<Provider>> {
        let sql = format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE id = ?1");
        Ok(self
            .conn
            .lock()
            .query_row(&sql, params![id], provider_from_row)
            .optional()?)
    }

    fn find_provider_by_name(&self, name: &str) -> Result<Option<Provider>> {
        let sql = format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE name = ?1");
        Ok(self
            .conn
            .lock()
            .query_row(&sql, params![name], provider_from_row)
            .optional()?)
    }

    fn list_providers(&self, status: Option<ProviderStatus>, page: Page) -> Result<Vec<Provider>> {
        let sql = format!(
            "SELECT {PROVIDER_COLUMNS} FROM providers
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY rowid LIMIT ?2 OFFSET ?3"
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                status.map(|s| s.as_str()),
                limit_param(page),
                i64::from(page.offset)
            ],
            provider_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -----------------------------------------------------------------------
    // Models
    // -----------------------------------------------------------------------

    fn insert_model(&self, model: &Model) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO models (id, provider_id, name, status, capabilities, input_price,
                 output_price, performance, latency_ms, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                model.id,
                model.provider_id,
                model.name,
                model.status.as_str(),
                serde_json::to_string(&model.capabilities)?,
                model.pricing.input,
                model.pricing.output,
                model.performance,
                model.latency_ms,
                model.created_at.timestamp_millis(),
                model.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn update_model(&self, model: &Model) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE models SET name = ?2, status = ?3, capabilities = ?4, input_price = ?5,
                 output_price = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                model.id,
                model.name,
                model.status.as_str(),
                serde_json::to_string(&model.capabilities)?,
                model.pricing.input,
                model.pricing.output,
                model.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn set_model_performance(&self, id: &str, performance: f64, latency_ms: f64) -> Result<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE models SET performance = ?2, latency_ms = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, performance, latency_ms, Utc::now().timestamp_millis()],
        )?;
        Ok(changed > 0)
    }

    fn delete_model(&self, id: &str) -> Result<DeleteOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let dependents = {
            let mut stmt = tx.prepare(
                "SELECT name FROM rules
                 WHERE fallback_model_id = ?1
                    OR id IN (SELECT rule_id FROM rule_targets WHERE model_id = ?1)
                 ORDER BY rowid",
            )?;
            stmt.query_map(params![id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        if !dependents.is_empty() {
            return Ok(DeleteOutcome::Blocked(dependents));
        }
        let removed = tx.execute("DELETE FROM models WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(if removed == 0 {
            DeleteOutcome::NotFound
        } else {
            DeleteOutcome::Deleted
        })
    }

    fn get_model(&self, id: &str) -> Result<Option<Model>> {
        let sql = format!("SELECT {MODEL_COLUMNS} FROM models WHERE id = ?1");
        Ok(self
            .conn
            .lock()
            .query_row(&sql, params![id], model_from_row)
            .optional()?)
    }

    fn find_model_by_name(&self, provider_id: &str, name: &str) -> Result<Option<Model>> {
        let sql =
            format!("SELECT {MODEL_COLUMNS} FROM models WHERE provider_id = ?1 AND name = ?2");
        Ok(self
            .conn
            .lock()
            .query_row(&sql, params![provider_id, name], model_from_row)
            .optional()?)
    }

    fn list_models(&self, filter: &ModelFilter, page: Page) -> Result<Vec<Model>> {
        let sql = format!(
            "SELECT {MODEL_COLUMNS} FROM models
             WHERE (?1 IS NULL OR provider_id = ?1)
               AND (?2 IS NULL OR status = ?2)
             ORDER BY rowid LIMIT ?3 OFFSET ?4"
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                filter.provider_id,
                filter.status.map(|s| s.as_str()),
                limit_param(page),
                i64::from(page.offset)
            ],
            model_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -----------------------------------------------------------------------
    // Rules
    // -----------------------------------------------------------------------

    fn insert_rule(&self, rule: &RoutingRule) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO rules (id, name, strategy, is_active, conditions, fallback_model_id,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rule.id,
                rule.name,
                rule.strategy.as_str(),
                rule.is_active,
                serde_json::to_string(&rule.conditions)?,
                rule.fallback_model,
                rule.created_at.timestamp_millis(),
                rule.updated_at.timestamp_millis(),
            ],
        )?;
        Self::write_targets(&tx, rule)?;
        tx.commit()?;
        Ok(())
    }

    fn update_rule(&self, rule: &RoutingRule) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE rules SET name = ?2, strategy = ?3, is_active = ?4, conditions = ?5,
                 fallback_model_id = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                rule.id,
                rule.name,
                rule.strategy.as_str(),
                rule.is_active,
                serde_json::to_string(&rule.conditions)?,
                rule.fallback_model,
                rule.updated_at.timestamp_millis(),
            ],
        )?;
        Self::write_targets(&tx, rule)?;
        tx.commit()?;
        Ok(())
    }

    fn delete_rule(&self, id: &str) -> Result<DeleteOutcome> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM rules WHERE id = ?1", params![id])?;
        Ok(if removed == 0 {
            DeleteOutcome::NotFound
        } else {
            DeleteOutcome::Deleted
        })
    }

    fn get_rule(&self, id: &str) -> Result<Option<RoutingRule>> {
        let sql = format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1");
        Ok(self.query_rules(&sql, Some(id))?.into_iter().next())
    }

    fn find_rule_by_name(&self, name: &str) -> Result<Option<RoutingRule>> {
        let sql = format!("SELECT {RULE_COLUMNS} FROM rules WHERE name = ?1");
        Ok(self.query_rules(&sql, Some(name))?.into_iter().next())
    }

    fn list_rules(&self, active_only: bool) -> Result<Vec<RoutingRule>> {
        let sql = if active_only {
            format!("SELECT {RULE_COLUMNS} FROM rules WHERE is_active = 1 ORDER BY rowid")
        } else {
            format!("SELECT {RULE_COLUMNS} FROM rules ORDER BY rowid")
        };
        self.query_rules(&sql, None)
    }

    // -----------------------------------------------------------------------
    // Usage log
    // -----------------------------------------------------------------------

    fn append_usage(&self, record: &UsageRecord) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO usage_records (id, model_id, provider_id, user_id, request_tokens,
                 response_tokens, cost, latency_ms, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.model_id,
                record.provider_id,
                record.user_id,
                record.request_tokens,
                record.response_tokens,
                record.cost,
                record.latency_ms,
                record.status.as_str(),
                record.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn usage_since(
        &self,
        model_id: &str,
        status: Option<UsageStatus>,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>> {
        let sql = format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records
             WHERE model_id = ?1 AND created_at >= ?2 AND (?3 IS NULL OR status = ?3)
             ORDER BY created_at, rowid"
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                model_id,
                since.timestamp_millis(),
                status.map(|s| s.as_str())
            ],
            usage_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn provider_usage_counts(
        &self,
        provider_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<UsageCounts> {
        let sql = format!(
            "SELECT COUNT(*), SUM(CASE WHEN status IN {FAILURE_STATUSES} THEN 1 ELSE 0 END)
             FROM usage_records
             WHERE provider_id = ?1 AND created_at > ?2 AND created_at <= ?3"
        );
        let counts = self.conn.lock().query_row(
            &sql,
            params![
                provider_id,
                since.timestamp_millis(),
                until.timestamp_millis()
            ],
            |row| {
                Ok(UsageCounts {
                    requests: count_column(row, 0)?,
                    errors: count_column(row, 1)?,
                })
            },
        )?;
        Ok(counts)
    }

    fn models_with_usage(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT model_id FROM usage_records WHERE created_at >= ?1 ORDER BY model_id",
        )?;
        let rows = stmt.query_map(params![since.timestamp_millis()], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    fn aggregate_usage(
        &self,
        grouping: StatsGrouping,
        since: Option<DateTime<Utc>>,
        filter: &UsageFilter,
    ) -> Result<Vec<GroupedUsage>> {
        let (key, tail) = match grouping {
            StatsGrouping::Total => ("NULL", ""),
            StatsGrouping::Model => (
                "model_id",
                "GROUP BY model_id ORDER BY COUNT(*) DESC, model_id",
            ),
            StatsGrouping::Provider => (
                "provider_id",
                "GROUP BY provider_id ORDER BY COUNT(*) DESC, provider_id",
            ),
        };
        let sql = format!(
            "SELECT {key},
                    COUNT(*),
                    SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status IN {FAILURE_STATUSES} THEN 1 ELSE 0 END),
                    SUM(request_tokens),
                    SUM(response_tokens),
                    SUM(cost),
                    AVG(latency_ms)
             FROM usage_records
             WHERE created_at >= ?1
               AND (?2 IS NULL OR user_id = ?2)
               AND (?3 IS NULL OR model_id = ?3)
               AND (?4 IS NULL OR provider_id = ?4)
             {tail}"
        );
        let since_ms = since.map_or(i64::MIN, |s| s.timestamp_millis());
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![since_ms, filter.user_id, filter.model_id, filter.provider_id],
            |row| {
                Ok(GroupedUsage {
                    key: row.get(0)?,
                    stats: stats_from_row(row, 1)?,
                })
            },
        )?;
        let grouped = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        debug!(?grouping, groups = grouped.len(), "aggregated usage");
        Ok(grouped)
    }

    // -----------------------------------------------------------------------
    // Snapshots and provider windows
    // -----------------------------------------------------------------------

    fn append_snapshot(&self, snapshot: &PerformanceSnapshot) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO performance_snapshots (id, model_id, requests, avg_latency_ms,
                 token_efficiency, quality_score, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.id,
                snapshot.model_id,
                to_i64(snapshot.requests),
                snapshot.avg_latency_ms,
                snapshot.token_efficiency,
                snapshot.quality_score,
                snapshot.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn recent_snapshots(&self, model_id: &str, limit: usize) -> Result<Vec<PerformanceSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, model_id, requests, avg_latency_ms, token_efficiency, quality_score,
                    created_at
             FROM performance_snapshots
             WHERE model_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![model_id, to_i64(limit as u64)], snapshot_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn append_provider_window(&self, window: &ProviderMetricWindow) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO provider_metrics (provider_id, request_count, error_count, uptime_pct,
                 avg_latency_ms, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                window.provider_id,
                to_i64(window.request_count),
                to_i64(window.error_count),
                window.uptime_pct,
                window.avg_latency_ms,
                window.recorded_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn recent_provider_windows(
        &self,
        provider_id: &str,
        limit: usize,
    ) -> Result<Vec<ProviderMetricWindow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT provider_id, request_count, error_count, uptime_pct, avg_latency_ms,
                    recorded_at
             FROM provider_metrics
             WHERE provider_id = ?1
             ORDER BY recorded_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![provider_id, to_i64(limit as u64)], window_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
