// =============================================================================
// QuantDesk Engine — Main Entry Point
// =============================================================================
//
// Boots the shared context (database, price feed, kline source, evaluator,
// notifier), resumes every strategy persisted as running, and starts the
// pending-order worker. Strategies are started and stopped at runtime by
// flipping the status column; the supervisor enforces the concurrency cap.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod engine;
mod exchange;
mod indicator;
mod market;
mod notify;
mod runner;
mod store;
mod types;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::engine::EngineContext;
use crate::indicator::builtin::MaCrossEvaluator;
use crate::market::{BinanceKlineSource, BinanceTickerSource, PriceFeed};
use crate::notify::SignalNotifier;
use crate::runner::entry_filter::AnalysisEntryFilter;
use crate::runner::Supervisor;
use crate::store::Store;
use crate::worker::PendingOrderWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env();
    info!(
        tick_sec = config.tick_interval_sec,
        max_runners = config.max_threads,
        order_mode = ?config.order_mode,
        "QuantDesk engine starting"
    );

    // ── 2. Shared context ────────────────────────────────────────────────
    let store = Store::connect(&config.database_url).await?;

    let prices = PriceFeed::new(
        Arc::new(BinanceTickerSource::new()),
        Duration::from_secs(config.price_cache_ttl_sec),
    );

    let ctx = Arc::new(EngineContext {
        config,
        store: store.clone(),
        prices,
        klines: Arc::new(BinanceKlineSource::new()),
        evaluator: Arc::new(MaCrossEvaluator::new()),
        notifier: Arc::new(SignalNotifier::new(store.clone())),
        entry_filter: Arc::new(AnalysisEntryFilter::new()),
    });

    // ── 3. Resume strategies persisted as running ────────────────────────
    let supervisor = Arc::new(Supervisor::new(ctx.clone()));
    match supervisor.resume_running().await {
        Ok(count) => info!(count, "strategy runners launched"),
        Err(e) => warn!(error = %e, "failed to resume strategies"),
    }

    // ── 4. Pending-order worker (dispatch + reconciliation) ──────────────
    let worker = PendingOrderWorker::new(ctx.clone());
    tokio::spawn(worker.run());
    info!("pending-order worker launched");

    // ── 5. Periodic sweep: pick up strategies switched to running ────────
    let sweep_supervisor = supervisor.clone();
    let sweep_store = store.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            match sweep_store.running_strategy_ids().await {
                Ok(ids) => {
                    for id in ids {
                        if !sweep_supervisor.is_running(id) {
                            sweep_supervisor.start_strategy(id);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "strategy sweep failed"),
            }
        }
    });

    info!("all subsystems running; press Ctrl+C to stop");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping");
    info!("QuantDesk engine shut down");
    Ok(())
}
