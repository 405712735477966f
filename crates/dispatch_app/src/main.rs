use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use dispatch_ai::DispatchService;
use dispatch_core::DispatchConfig;
use dispatch_core::logging;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `dispatch [CONFIG]`: the optional argument overrides `~/.dispatch/config.json`.
fn load_config() -> Result<DispatchConfig> {
    match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => DispatchConfig::load_from_path(&path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => DispatchConfig::load(),
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

async fn health_loop(service: Arc<DispatchService>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        match service.batch_health_check().await {
            Ok(reports) => info!(providers = reports.len(), "Health sweep finished"),
            Err(e) => error!("Health sweep failed: {e}"),
        }
    }
}

async fn refresh_loop(service: Arc<DispatchService>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // The first tick fires immediately; skip it so startup is not a full recompute.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = service.refresh_performance() {
            warn!("Performance refresh failed: {e}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let _log_guard = logging::init_logging(&config)?;
    info!("Starting dispatch v{VERSION}");

    let health_every = Duration::from_secs(config.health.check_interval_secs.max(1));
    let refresh_every = Duration::from_secs(config.feedback.refresh_interval_secs.max(1));

    let service = Arc::new(DispatchService::open(config)?);
    let feedback = service.start_background();

    let health = tokio::spawn(health_loop(service.clone(), health_every));
    let refresh = tokio::spawn(refresh_loop(service.clone(), refresh_every));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    health.abort();
    refresh.abort();
    if let Some(handle) = feedback {
        handle.abort();
    }
    let stats = service.feedback_stats();
    info!(
        completed = stats.completed,
        failed = stats.failed,
        "Feedback worker stopped"
    );
    Ok(())
}
