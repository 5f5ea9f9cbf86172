//! PolyHook worker entry point
//!
//! Boots the safety controller, the signal/metrics worker lanes and the
//! claim scanner. The webhook HTTP adapter is a separate process; it feeds
//! this worker through the job queue.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use polyhook::claims::ClaimScanner;
use polyhook::config::AppConfig;
use polyhook::metrics::MetricsEngine;
use polyhook::persistence::CsvAudit;
use polyhook::processor::{SignalProcessor, TradeLimits};
use polyhook::queue::{job_channel, BotLocks, WorkerPool};
use polyhook::safety::SafetyController;
use polyhook::store::MemoryStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("loading configuration")?;
    info!(digest = %config.digest(), "starting polyhook worker");
    config.validate_env()?;

    let safety = Arc::new(SafetyController::initialize(&config).await);
    info!(
        configured = %safety.configured_mode(),
        effective = %safety.effective_mode(),
        live_confirmed = safety.is_live_confirmed(),
        "trading mode fixed for process lifetime"
    );
    if safety.configured_mode() != safety.effective_mode() {
        for failure in &safety.diagnostics().failures {
            warn!(reason = %failure, "live mode unavailable");
        }
    }

    let exchange = safety.build_exchange_client()?;
    let markets = safety.build_market_directory();

    let audit = if config.persistence.csv_enabled {
        Some(Arc::new(
            CsvAudit::new(&config.persistence.data_dir).context("initializing CSV audit trail")?,
        ))
    } else {
        None
    };

    let store = Arc::new(MemoryStore::new());
    let locks = Arc::new(BotLocks::new());

    let limits = Arc::new(TradeLimits::new(
        config.trading.max_trade_usdc,
        config.trading.max_daily_notional_usdc,
    ));
    let processor = Arc::new(SignalProcessor::new(
        store.clone(),
        exchange.clone(),
        markets,
        audit.clone(),
        limits,
    ));
    let engine = Arc::new(MetricsEngine::new(
        store.clone(),
        exchange.clone(),
        audit.clone(),
    ));

    let (queue, receivers) = job_channel();
    let pool = WorkerPool::new(
        processor,
        engine,
        locks,
        queue.metrics_sender(),
        config.worker.clone(),
    );
    let (signal_lane, metrics_lane) = pool.start(receivers);

    let scanner = ClaimScanner::new(
        store,
        exchange,
        audit,
        config.worker.claim_scan_interval_secs,
    );
    let scanner_handle = tokio::spawn(scanner.run());

    // The ingress adapter owns a clone of `queue`; this handle keeps the
    // lanes open until shutdown.
    info!("worker ready, waiting for signals");
    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("shutdown requested, draining lanes");

    scanner_handle.abort();
    drop(queue);
    let _ = signal_lane.await;
    let _ = metrics_lane.await;
    info!("worker stopped");
    Ok(())
}
