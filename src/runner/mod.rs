// =============================================================================
// Strategy Runner — supervisor owning one loop task per running strategy
// =============================================================================

pub mod entry_filter;
pub mod exits;
pub mod signals;
pub mod sizing;
pub mod strategy_loop;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::engine::EngineContext;
use crate::runner::strategy_loop::run_strategy;

/// Owns the handles of all running strategy loops. Start refuses
/// duplicates and enforces the configured concurrency cap; stop flips the
/// persisted status so the loop exits within one tick cadence.
pub struct Supervisor {
    ctx: Arc<EngineContext>,
    runners: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            runners: Mutex::new(HashMap::new()),
        }
    }

    /// Launch a runner for `strategy_id`. Returns false when one is
    /// already running or the cap is reached.
    pub fn start_strategy(&self, strategy_id: i64) -> bool {
        let mut runners = self.runners.lock();
        // Sweep finished handles so dead loops do not inflate the count.
        runners.retain(|_, handle| !handle.is_finished());

        if runners.len() >= self.ctx.config.max_threads {
            error!(
                strategy_id,
                limit = self.ctx.config.max_threads,
                "runner limit reached; refusing to start strategy"
            );
            return false;
        }
        if runners.contains_key(&strategy_id) {
            warn!(strategy_id, "strategy is already running");
            return false;
        }

        let ctx = self.ctx.clone();
        let handle = tokio::spawn(run_strategy(ctx, strategy_id));
        runners.insert(strategy_id, handle);
        info!(strategy_id, "strategy started");
        true
    }

    /// Request a stop: persist status='stopped' and drop the handle. The
    /// loop observes the status at the top of its next tick.
    pub async fn stop_strategy(&self, strategy_id: i64) -> Result<bool> {
        let had_handle = {
            let mut runners = self.runners.lock();
            runners.remove(&strategy_id).is_some()
        };
        if !had_handle {
            warn!(strategy_id, "strategy is not running");
            return Ok(false);
        }
        self.ctx
            .store
            .set_strategy_status(strategy_id, "stopped")
            .await?;
        info!(strategy_id, "strategy stop requested");
        Ok(true)
    }

    pub fn running_count(&self) -> usize {
        let mut runners = self.runners.lock();
        runners.retain(|_, handle| !handle.is_finished());
        runners.len()
    }

    pub fn is_running(&self, strategy_id: i64) -> bool {
        let runners = self.runners.lock();
        runners
            .get(&strategy_id)
            .map_or(false, |h| !h.is_finished())
    }

    /// Relaunch every strategy whose persisted status is 'running' (called
    /// once at startup so a restart resumes where it left off).
    pub async fn resume_running(&self) -> Result<usize> {
        let ids = self.ctx.store.running_strategy_ids().await?;
        let mut started = 0;
        for id in ids {
            if self.start_strategy(id) {
                started += 1;
            }
        }
        if started > 0 {
            info!(count = started, "resumed running strategies");
        }
        Ok(started)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support;
    use crate::store::Store;
    use crate::types::ExecutionMode;
    use serde_json::json;

    async fn seed_running(store: &Store, name: &str) -> i64 {
        store
            .insert_strategy(
                1,
                name,
                "running",
                1000.0,
                5.0,
                ExecutionMode::Signal,
                &json!({}),
                &json!({"indicator_code": "fast=2\nslow=4"}),
                &json!({"exchange_id": "binance"}),
                &json!({"symbol": "BTC/USDT", "timeframe": "1m", "leverage": 5}),
                &json!({}),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_start_is_refused() {
        let store = Store::memory().await.unwrap();
        let id = seed_running(&store, "dup").await;
        let candles = test_support::flat_candles(30, 100.0, 60);
        let sup = Supervisor::new(test_support::context(store, candles, 100.0));

        assert!(sup.start_strategy(id));
        assert!(!sup.start_strategy(id));
        assert!(sup.is_running(id));
        assert_eq!(sup.running_count(), 1);
    }

    #[tokio::test]
    async fn cap_refuses_further_starts() {
        let store = Store::memory().await.unwrap();
        let a = seed_running(&store, "a").await;
        let b = seed_running(&store, "b").await;
        let candles = test_support::flat_candles(30, 100.0, 60);
        let ctx = test_support::context(store, candles, 100.0);

        // Rebuild the context with a cap of one runner.
        let mut config = ctx.config.clone();
        config.max_threads = 1;
        let ctx = Arc::new(EngineContext {
            config,
            store: ctx.store.clone(),
            prices: crate::market::PriceFeed::new(
                Arc::new(test_support::StaticPriceSource::new(100.0)),
                std::time::Duration::ZERO,
            ),
            klines: ctx.klines.clone(),
            evaluator: ctx.evaluator.clone(),
            notifier: ctx.notifier.clone(),
            entry_filter: ctx.entry_filter.clone(),
        });
        let sup = Supervisor::new(ctx);

        assert!(sup.start_strategy(a));
        assert!(!sup.start_strategy(b));
    }

    #[tokio::test]
    async fn stop_flips_persisted_status() {
        let store = Store::memory().await.unwrap();
        let id = seed_running(&store, "stoppable").await;
        let candles = test_support::flat_candles(30, 100.0, 60);
        let sup = Supervisor::new(test_support::context(store.clone(), candles, 100.0));

        assert!(sup.start_strategy(id));
        assert!(sup.stop_strategy(id).await.unwrap());
        assert_eq!(
            store.strategy_status(id).await.unwrap().as_deref(),
            Some("stopped")
        );
        // stopping again reports not-running
        assert!(!sup.stop_strategy(id).await.unwrap());
    }

    #[tokio::test]
    async fn resume_starts_all_running_rows() {
        let store = Store::memory().await.unwrap();
        seed_running(&store, "r1").await;
        seed_running(&store, "r2").await;
        store
            .insert_strategy(
                1,
                "parked",
                "stopped",
                1000.0,
                1.0,
                ExecutionMode::Signal,
                &json!({}),
                &json!({"indicator_code": "fast=2\nslow=4"}),
                &json!({}),
                &json!({"symbol": "ETH/USDT", "timeframe": "1m"}),
                &json!({}),
            )
            .await
            .unwrap();

        let candles = test_support::flat_candles(30, 100.0, 60);
        let sup = Supervisor::new(test_support::context(store, candles, 100.0));
        let started = sup.resume_running().await.unwrap();
        assert_eq!(started, 2);
    }
}
