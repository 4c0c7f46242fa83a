//! judge-relay daemon.
//!
//! Brings up the dispatch core standalone: connection registry, reconnect
//! sweep, and problem-list refresh, running until a shutdown signal. The
//! HTTP-facing layer lives elsewhere and links against this crate's
//! library for the actual operations.

use std::sync::Arc;

use judge_relay::config::Settings;
use judge_relay::ops::problems::{self, ProblemCache, REFRESH_INTERVAL};
use judge_relay::registry::{Registry, SWEEP_INTERVAL};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        middle = %settings.middle.host,
        judges = settings.judge_servers.len(),
        version = %settings.protocol.version,
        "Starting judge-relay"
    );

    let registry = Registry::new(settings);
    registry.connect_all().await;

    let sweep = Registry::spawn_sweep(Arc::clone(&registry), SWEEP_INTERVAL);

    let cache = Arc::new(ProblemCache::new());
    let refresh = problems::spawn_refresh(
        Arc::clone(&registry),
        Arc::clone(&cache),
        REFRESH_INTERVAL,
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    sweep.abort();
    refresh.abort();
    registry.shutdown().await;
    Ok(())
}
