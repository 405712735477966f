use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::DispatchError;

/// Environment variable that overrides the base directory (`~/.dispatch`).
pub const HOME_ENV: &str = "DISPATCH_HOME";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Health probing and classification thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Per-probe timeout. A probe that does not answer in time is `unhealthy`.
    /// Must exceed `degraded_latency_ms` so slow but live providers are
    /// reported `degraded`.
    pub probe_timeout_ms: u64,
    /// Upper bound on probes in flight during a batch check.
    pub max_concurrent_probes: usize,
    /// Number of most recent metric windows used for classification.
    pub window_count: usize,
    /// Mean error rate (percent) strictly above which a provider is `unhealthy`.
    pub unhealthy_error_rate_pct: f64,
    /// Mean uptime (percent) strictly below which a provider is `degraded`.
    pub degraded_uptime_pct: f64,
    /// Probe latency strictly above which a provider is `degraded`.
    pub degraded_latency_ms: u64,
    /// Interval of the background batch check run by the binary.
    pub check_interval_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 10_000,
            max_concurrent_probes: 8,
            window_count: 10,
            unhealthy_error_rate_pct: 10.0,
            degraded_uptime_pct: 95.0,
            degraded_latency_ms: 5_000,
            check_interval_secs: 60,
        }
    }
}

/// Performance feedback loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackSettings {
    /// How far back successful usage records are pulled for a snapshot.
    pub lookback_hours: i64,
    /// Number of recent snapshots folded into `Model.performance`.
    pub snapshot_window: usize,
    /// Latency at which the quality score reaches zero.
    pub latency_ceiling_ms: f64,
    /// Queue a recomputation after every N recorded usages of a model.
    pub recompute_every: u32,
    /// Interval of the periodic recompute of every model with usage.
    pub refresh_interval_secs: u64,
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            lookback_hours: 24,
            snapshot_window: 10,
            latency_ceiling_ms: 10_000.0,
            recompute_every: 1,
            refresh_interval_secs: 300,
        }
    }
}

/// Router behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    /// Confidence reported for default (rule-less) routing.
    pub default_confidence: f64,
    /// Maximum number of alternatives returned with a result.
    pub max_alternatives: usize,
    /// Deadline applied to `route_request` when the caller gives none.
    pub request_timeout_ms: Option<u64>,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            default_confidence: 0.7,
            max_alternatives: 3,
            request_timeout_ms: None,
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchConfig
// ---------------------------------------------------------------------------

/// Engine configuration stored at `~/.dispatch/config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Overrides the default database location (`~/.dispatch/dispatch.db`).
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    pub health: HealthSettings,
    pub feedback: FeedbackSettings,
    pub routing: RoutingSettings,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_level: "info".into(),
            health: HealthSettings::default(),
            feedback: FeedbackSettings::default(),
            routing: RoutingSettings::default(),
        }
    }
}

impl DispatchConfig {
    /// Returns the base directory: `$DISPATCH_HOME` or `~/.dispatch/`
    pub fn base_dir() -> Result<PathBuf> {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(home));
        }
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".dispatch"))
    }

    /// Returns the config file path: `~/.dispatch/config.json`
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.json"))
    }

    /// Returns the logs directory: `~/.dispatch/logs/`
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Returns the database path, honouring `database_path` when set.
    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::base_dir()?.join("dispatch.db")),
        }
    }

    /// Ensures all required directories exist.
    pub fn ensure_dirs() -> Result<()> {
        for dir in [Self::base_dir()?, Self::logs_dir()?] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            }
        }
        Ok(())
    }

    /// Loads config from disk, or creates the default file if missing.
    pub fn load() -> Result<Self> {
        Self::ensure_dirs()?;
        let path = Self::config_path()?;
        Self::load_from_path(&path)
    }

    /// Load config from a specific file path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: Self = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            info!("Loaded config from {}", path.display());
            config
        } else {
            let config = Self::default();
            config.save_to_path(path)?;
            info!("Created default config at {}", path.display());
            config
        };
        config.validate()?;
        Ok(config)
    }

    /// Save config to a specific file path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        let invalid =
            |msg: &str| -> crate::Result<()> { Err(DispatchError::Validation(msg.to_string())) };

        if self.health.max_concurrent_probes == 0 {
            return invalid("health.max_concurrent_probes must be at least 1");
        }
        if self.health.window_count == 0 {
            return invalid("health.window_count must be at least 1");
        }
        if self.health.probe_timeout_ms == 0 {
            return invalid("health.probe_timeout_ms must be positive");
        }
        if self.health.probe_timeout_ms <= self.health.degraded_latency_ms {
            return invalid("health.probe_timeout_ms must exceed health.degraded_latency_ms");
        }
        if !(0.0..=100.0).contains(&self.health.unhealthy_error_rate_pct)
            || !(0.0..=100.0).contains(&self.health.degraded_uptime_pct)
        {
            return invalid("health percentages must be within 0..=100");
        }
        if self.feedback.snapshot_window == 0 {
            return invalid("feedback.snapshot_window must be at least 1");
        }
        if self.feedback.recompute_every == 0 {
            return invalid("feedback.recompute_every must be at least 1");
        }
        if self.feedback.lookback_hours <= 0 {
            return invalid("feedback.lookback_hours must be positive");
        }
        if !(self.feedback.latency_ceiling_ms.is_finite() && self.feedback.latency_ceiling_ms > 0.0)
        {
            return invalid("feedback.latency_ceiling_ms must be positive");
        }
        if !(0.0..=1.0).contains(&self.routing.default_confidence) {
            return invalid("routing.default_confidence must be within 0..=1");
        }
        Ok(())
    }
}
