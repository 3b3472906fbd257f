// =============================================================================
// Position reconciliation — align local rows with the venue, best-effort
// =============================================================================
//
// Every sync interval, each live strategy's swap positions are compared
// against the exchange snapshot (converted to base units by the client):
// rows the exchange no longer holds are deleted (ghost cleanup), sizes
// that diverged by more than 1% are corrected. Reconciliation never
// creates rows: an exchange-only position was opened outside this engine
// and is not ours to claim. Any exchange read error skips the strategy
// without touching local state.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::engine::EngineContext;
use crate::exchange::{create_client, ExchangeClient, VenuePosition};
use crate::store::positions::Position;
use crate::types::{normalize_symbol, ExecutionMode, MarketType, Side};

/// Relative divergence beyond which the local size is corrected.
const SIZE_DRIFT_THRESHOLD: f64 = 0.01;

const EPSILON: f64 = 1e-12;

/// Venue snapshot keyed by normalized symbol: (long base qty, short base
/// qty).
pub type VenueSnapshot = HashMap<String, (f64, f64)>;

pub fn build_snapshot(positions: &[VenuePosition]) -> VenueSnapshot {
    let mut snapshot: VenueSnapshot = HashMap::new();
    for p in positions {
        if p.quantity <= 0.0 {
            continue;
        }
        let entry = snapshot.entry(normalize_symbol(&p.symbol)).or_default();
        match p.side {
            Side::Long => entry.0 = p.quantity,
            Side::Short => entry.1 = p.quantity,
        }
    }
    snapshot
}

/// Decide which local rows to delete and which sizes to correct.
pub fn reconcile_plan(
    local: &[Position],
    snapshot: &VenueSnapshot,
) -> (Vec<i64>, Vec<(i64, f64)>) {
    let mut delete_ids = Vec::new();
    let mut size_updates = Vec::new();

    for row in local {
        let key = normalize_symbol(&row.symbol);
        let (long_qty, short_qty) = snapshot.get(&key).copied().unwrap_or((0.0, 0.0));
        let exch_qty = match row.side {
            Side::Long => long_qty,
            Side::Short => short_qty,
        };

        if exch_qty <= EPSILON {
            // Exchange is flat: the local row is a ghost.
            delete_ids.push(row.id);
        } else if row.size <= 0.0
            || (exch_qty - row.size).abs() / row.size.max(1.0) > SIZE_DRIFT_THRESHOLD
        {
            size_updates.push((row.id, exch_qty));
        }
    }

    (delete_ids, size_updates)
}

/// Run one reconciliation pass over every strategy that owns local rows.
pub async fn sync_positions_best_effort(ctx: &Arc<EngineContext>) -> Result<()> {
    let strategy_ids = ctx.store.strategy_ids_with_positions().await?;
    for strategy_id in strategy_ids {
        if let Err(e) = sync_strategy(ctx, strategy_id).await {
            // Read errors must never alter local rows.
            info!(strategy_id, error = %e, "position sync skipped for strategy");
        }
    }
    Ok(())
}

async fn sync_strategy(ctx: &Arc<EngineContext>, strategy_id: i64) -> Result<()> {
    let Some(strategy) = ctx.store.load_strategy(strategy_id).await? else {
        return Ok(());
    };
    if strategy.execution_mode != ExecutionMode::Live {
        return Ok(());
    }
    let mut cfg = strategy.trading.clone();
    cfg.sanitize(strategy.leverage);
    if cfg.market_type != MarketType::Swap {
        // Spot balances are commingled with non-strategy assets; skipping
        // keeps the self-check low-risk.
        debug!(strategy_id, "position sync skips spot strategies");
        return Ok(());
    }

    let client = create_client(&strategy.exchange_config, MarketType::Swap)
        .map_err(|e| anyhow::anyhow!("client unavailable: {e}"))?;
    sync_with_client(ctx, strategy_id, client.as_ref()).await
}

/// Reconcile one strategy against a concrete client.
pub async fn sync_with_client(
    ctx: &Arc<EngineContext>,
    strategy_id: i64,
    client: &dyn ExchangeClient,
) -> Result<()> {
    let venue_positions = client
        .get_positions()
        .await
        .map_err(|e| anyhow::anyhow!("exchange read failed: {e}"))?;
    let snapshot = build_snapshot(&venue_positions);

    let local = ctx.store.positions_for_strategy(strategy_id).await?;
    if local.is_empty() {
        return Ok(());
    }

    let (delete_ids, size_updates) = reconcile_plan(&local, &snapshot);
    if delete_ids.is_empty() && size_updates.is_empty() {
        return Ok(());
    }

    let (deleted, updated) = ctx
        .store
        .apply_reconciliation(&delete_ids, &size_updates)
        .await?;
    if deleted > 0 {
        info!(strategy_id, ghosts = deleted, "position sync removed ghost positions");
    }
    if updated > 0 {
        info!(strategy_id, corrected = updated, "position sync corrected diverged sizes");
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::engine::test_support;
    use crate::exchange::{
        ExchangeError, FillReport, InstrumentMeta, LeveragePolicy, OrderAck, OrderRequest,
    };
    use crate::store::Store;

    fn local(id: i64, symbol: &str, side: Side, size: f64) -> Position {
        Position {
            id,
            user_id: 1,
            strategy_id: 1,
            symbol: symbol.to_string(),
            side,
            size,
            entry_price: 100.0,
            current_price: 100.0,
            highest_price: 0.0,
            lowest_price: 0.0,
            updated_at: 0,
        }
    }

    fn venue(symbol: &str, side: Side, quantity: f64) -> VenuePosition {
        VenuePosition {
            symbol: symbol.to_string(),
            side,
            quantity,
        }
    }

    #[test]
    fn ghost_rows_are_deleted() {
        let locals = [local(1, "BTC/USDT", Side::Long, 1.0)];
        let snapshot = build_snapshot(&[]);
        let (deletes, updates) = reconcile_plan(&locals, &snapshot);
        assert_eq!(deletes, vec![1]);
        assert!(updates.is_empty());
    }

    #[test]
    fn drift_above_one_percent_updates_size() {
        let locals = [
            local(1, "BTC/USDT", Side::Long, 1.0),
            local(2, "ETH/USDT", Side::Short, 10.0),
        ];
        let snapshot = build_snapshot(&[
            venue("BTC/USDT", Side::Long, 1.05),   // 5% drift -> update
            venue("ETH/USDT", Side::Short, 10.05), // 0.5% drift -> keep
        ]);
        let (deletes, updates) = reconcile_plan(&locals, &snapshot);
        assert!(deletes.is_empty());
        assert_eq!(updates, vec![(1, 1.05)]);
    }

    #[test]
    fn drift_denominator_floors_at_one() {
        // local 0.1, exchange 0.105: |diff|/max(1, 0.1) = 0.005 -> keep
        let locals = [local(1, "BTC/USDT", Side::Long, 0.1)];
        let snapshot = build_snapshot(&[venue("BTC/USDT", Side::Long, 0.105)]);
        let (deletes, updates) = reconcile_plan(&locals, &snapshot);
        assert!(deletes.is_empty());
        assert!(updates.is_empty());
    }

    #[test]
    fn exchange_only_positions_are_never_adopted() {
        let locals: [Position; 0] = [];
        let snapshot = build_snapshot(&[venue("SOL/USDT", Side::Long, 3.0)]);
        let (deletes, updates) = reconcile_plan(&locals, &snapshot);
        assert!(deletes.is_empty());
        assert!(updates.is_empty());
    }

    #[test]
    fn sides_reconcile_independently() {
        let locals = [
            local(1, "BTC/USDT", Side::Long, 1.0),
            local(2, "BTC/USDT", Side::Short, 2.0),
        ];
        // exchange holds only the short
        let snapshot = build_snapshot(&[venue("BTC/USDT", Side::Short, 2.0)]);
        let (deletes, updates) = reconcile_plan(&locals, &snapshot);
        assert_eq!(deletes, vec![1]);
        assert!(updates.is_empty());
    }

    struct SnapshotExchange {
        positions: Vec<VenuePosition>,
        fail: bool,
    }

    #[async_trait]
    impl ExchangeClient for SnapshotExchange {
        fn venue(&self) -> &'static str {
            "okx"
        }
        fn market_type(&self) -> MarketType {
            MarketType::Swap
        }
        fn leverage_policy(&self) -> LeveragePolicy {
            LeveragePolicy::BestEffort
        }
        async fn instrument(&self, _symbol: &str) -> Result<InstrumentMeta, ExchangeError> {
            Ok(InstrumentMeta::default())
        }
        async fn set_leverage(
            &self,
            _symbol: &str,
            _leverage: f64,
            _margin_mode: &str,
            _pos_side: Side,
        ) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn place_limit_order(
            &self,
            _req: &OrderRequest,
            _price: f64,
        ) -> Result<OrderAck, ExchangeError> {
            Err(ExchangeError::Unsupported("test client".into()))
        }
        async fn place_market_order(
            &self,
            _req: &OrderRequest,
        ) -> Result<OrderAck, ExchangeError> {
            Err(ExchangeError::Unsupported("test client".into()))
        }
        async fn cancel_order(
            &self,
            _symbol: &str,
            _order_id: &str,
            _client_order_id: &str,
        ) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn wait_for_fill(
            &self,
            _symbol: &str,
            _order_id: &str,
            _client_order_id: &str,
            _max_wait: std::time::Duration,
        ) -> Result<FillReport, ExchangeError> {
            Ok(FillReport::default())
        }
        async fn get_positions(&self) -> Result<Vec<VenuePosition>, ExchangeError> {
            if self.fail {
                Err(ExchangeError::Transport("read timeout".into()))
            } else {
                Ok(self.positions.clone())
            }
        }
    }

    #[tokio::test]
    async fn ghost_cleanup_end_to_end_is_idempotent() {
        let store = Store::memory().await.unwrap();
        let ctx = test_support::context(store.clone(), vec![], 100.0);
        store
            .upsert_position(1, 1, "BTC/USDT", Side::Long, 1.0, 100.0, 100.0, 0.0, 0.0)
            .await
            .unwrap();

        let client = SnapshotExchange {
            positions: vec![],
            fail: false,
        };
        sync_with_client(&ctx, 1, &client).await.unwrap();
        assert!(store.positions_for_strategy(1).await.unwrap().is_empty());

        // Second run with the unchanged snapshot performs zero writes.
        sync_with_client(&ctx, 1, &client).await.unwrap();
        assert!(store.positions_for_strategy(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exchange_read_error_leaves_rows_untouched() {
        let store = Store::memory().await.unwrap();
        let ctx = test_support::context(store.clone(), vec![], 100.0);
        store
            .upsert_position(1, 1, "BTC/USDT", Side::Long, 1.0, 100.0, 100.0, 0.0, 0.0)
            .await
            .unwrap();

        let client = SnapshotExchange {
            positions: vec![],
            fail: true,
        };
        assert!(sync_with_client(&ctx, 1, &client).await.is_err());
        assert_eq!(store.positions_for_strategy(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn size_correction_end_to_end() {
        let store = Store::memory().await.unwrap();
        let ctx = test_support::context(store.clone(), vec![], 100.0);
        store
            .upsert_position(1, 1, "BTC/USDT", Side::Long, 1.0, 100.0, 100.0, 0.0, 0.0)
            .await
            .unwrap();

        let client = SnapshotExchange {
            positions: vec![venue("BTC/USDT", Side::Long, 1.2)],
            fail: false,
        };
        sync_with_client(&ctx, 1, &client).await.unwrap();
        let rows = store.positions_for_strategy(1).await.unwrap();
        assert!((rows[0].size - 1.2).abs() < 1e-9);

        // Idempotent: a second pass with the same snapshot changes nothing.
        sync_with_client(&ctx, 1, &client).await.unwrap();
        let rows = store.positions_for_strategy(1).await.unwrap();
        assert!((rows[0].size - 1.2).abs() < 1e-9);
    }
}
