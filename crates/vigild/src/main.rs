//! Vigil Daemon - system monitoring and maintenance
//!
//! Streams telemetry, forecasts disk exhaustion and reports the usage context.
//! Cleanup only ever runs on request; the daemon itself deletes nothing.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use vigil_common::config::{Config, CONFIG_PATH};
use vigil_common::{state_manager, Severity, VigilError};
use vigild::{LocalSource, VigilService};

fn config_path() -> PathBuf {
    std::env::var_os("VIGIL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_PATH))
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_service(config: Config, source: Arc<LocalSource>) -> Result<VigilService> {
    match VigilService::new(config.clone(), source.clone()) {
        Err(VigilError::StateCorrupted { path, source: cause }) => {
            error!(
                "Disk history {} is corrupted ({}), starting a fresh one",
                path.display(),
                cause
            );
            state_manager::safe_delete(&path)?;
            Ok(VigilService::new(config, source)?)
        }
        other => Ok(other?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path();
    let loaded = Config::load_or_default(&path);
    init_logging(
        loaded
            .as_ref()
            .map(|c| c.log.level.as_str())
            .unwrap_or("info"),
    );
    let config = loaded.with_context(|| format!("refusing to start with {}", path.display()))?;

    info!("Vigil Daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let source = Arc::new(LocalSource::new());
    let mut service = build_service(config, source).context("failed to initialize service")?;
    service.start();

    // Forecast is on demand; one snapshot per daemon start
    match service.record_disk_snapshot() {
        Ok(snapshot) => debug!("Disk snapshot: {} bytes free", snapshot.free_bytes),
        Err(e) => warn!("Could not record disk snapshot: {}", e),
    }
    let prediction = service.predict();
    match prediction.severity {
        Severity::Critical | Severity::Warning => warn!(
            "Disk forecast {}: {}",
            prediction.severity,
            prediction.recommendations.join(" ")
        ),
        _ => info!(
            "Disk forecast {}: {}",
            prediction.severity,
            prediction.recommendations.join(" ")
        ),
    }

    match service.classify() {
        Ok(context) => {
            let policy = service.resolve_policy(context);
            info!(
                "Usage context: {} (power profile {:?}, maintenance {})",
                context,
                policy.power_profile,
                if policy.background_maintenance_allowed { "allowed" } else { "deferred" }
            );
        }
        Err(e) => warn!("Could not classify usage context: {}", e),
    }

    if let Some(mut updates) = service.subscribe() {
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) => debug!(
                        "Telemetry #{}: cpu {:.1}%, mem {:.1}%, dropped {}",
                        update.sequence,
                        update.latest.cpu_percent(),
                        update.latest.memory_percent(),
                        update.dropped
                    ),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Telemetry logger skipped {} updates", n)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    info!("Vigil Daemon ready");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down gracefully");

    if let Err(e) = service.stop().await {
        error!("Shutdown incomplete: {}", e);
    }
    Ok(())
}
