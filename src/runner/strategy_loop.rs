// =============================================================================
// Strategy loop — one tick cadence per running strategy
// =============================================================================
//
// One tick = fetch the latest price, refresh candles (sliding update every
// tick, full refetch once per timeframe period), recompute the indicator
// with the injected position state, evaluate triggers and server-side
// exits, select at most one signal, enqueue it, and refresh the open
// position's current price. The loop exits within one cadence of the
// persisted status leaving 'running'.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::EngineContext;
use crate::indicator::{extract_signals, InitialState, PendingSignal};
use crate::market::{timeframe_seconds, Frame};
use crate::runner::entry_filter::entry_filter_enabled;
use crate::runner::exits::{
    stop_loss_signal, take_profit_or_trailing_signal, tracked_extremes,
};
use crate::runner::signals::{expire_signals, is_triggered, select_signal, SignalDedup};
use crate::runner::sizing::compute_order;
use crate::store::pending_orders::EnqueueRequest;
use crate::store::positions::{position_state, Position};
use crate::store::strategies::{Strategy, TradingConfig};
use crate::types::{ExecutionMode, Side};
use crate::worker::fills::apply_fill_to_local_position;

/// Entry point spawned by the supervisor.
pub async fn run_strategy(ctx: Arc<EngineContext>, strategy_id: i64) {
    info!(strategy_id, "strategy loop starting");
    if let Err(e) = strategy_loop(&ctx, strategy_id).await {
        error!(strategy_id, error = %e, "strategy loop crashed");
    }
    info!(strategy_id, "strategy loop exited");
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Build the evaluator's injected state from the current position rows.
fn initial_state(positions: &[Position]) -> InitialState {
    match positions.first() {
        Some(pos) => InitialState {
            highest_price: pos.highest_price,
            position: match pos.side {
                Side::Long => 1,
                Side::Short => -1,
            },
            avg_entry_price: pos.entry_price,
            position_count: 1,
            last_add_price: pos.entry_price,
        },
        None => InitialState::default(),
    }
}

async fn fetch_frame(
    ctx: &EngineContext,
    strategy: &Strategy,
    cfg: &TradingConfig,
) -> Result<Frame> {
    let candles = ctx
        .klines
        .fetch(
            strategy.market_category(),
            &cfg.symbol,
            &cfg.timeframe,
            ctx.config.kline_history_limit,
            now_ts(),
        )
        .await
        .context("failed to fetch candle history")?;
    Ok(Frame::new(candles))
}

/// Recompute the indicator over `frame` and return the extracted pending
/// signals plus the script's updated trailing high.
async fn recompute(
    ctx: &EngineContext,
    strategy: &Strategy,
    cfg: &TradingConfig,
    code: &str,
    frame: &Frame,
) -> Result<(Vec<PendingSignal>, f64)> {
    let positions = ctx.store.positions_for(strategy.id, &cfg.symbol).await?;
    let init = initial_state(&positions);
    let mut annotated = ctx
        .evaluator
        .evaluate(code, frame, cfg, &init)
        .context("indicator evaluation failed")?;
    annotated.normalize_directions(cfg.trade_direction);
    let signals = extract_signals(&annotated, cfg.signal_mode, cfg.exit_signal_mode);
    Ok((signals, annotated.highest_price))
}

/// Persist the script-tracked trailing high onto the open position rows.
async fn persist_highest(
    ctx: &EngineContext,
    strategy: &Strategy,
    cfg: &TradingConfig,
    new_highest: f64,
    current_price: f64,
) {
    if new_highest <= 0.0 {
        return;
    }
    let positions = match ctx.store.positions_for(strategy.id, &cfg.symbol).await {
        Ok(p) => p,
        Err(_) => return,
    };
    for p in &positions {
        let _ = ctx
            .store
            .upsert_position(
                strategy.id,
                strategy.user_id,
                &p.symbol,
                p.side,
                p.size,
                p.entry_price,
                current_price,
                new_highest,
                0.0,
            )
            .await;
    }
}

async fn strategy_loop(ctx: &Arc<EngineContext>, strategy_id: i64) -> Result<()> {
    let Some(strategy) = ctx.store.load_strategy(strategy_id).await? else {
        error!(strategy_id, "strategy not found");
        return Ok(());
    };
    if strategy.strategy_type != "IndicatorStrategy" {
        error!(
            strategy_id,
            strategy_type = %strategy.strategy_type,
            "unsupported strategy type for realtime execution"
        );
        return Ok(());
    }

    let mut cfg = strategy.trading.clone();
    cfg.sanitize(strategy.leverage);
    if cfg.symbol.trim().is_empty() {
        error!(strategy_id, "trading config has no symbol");
        return Ok(());
    }
    let code = strategy.indicator_code();
    if code.trim().is_empty() {
        error!(strategy_id, "indicator code is empty");
        return Ok(());
    }

    let tf_seconds = timeframe_seconds(&cfg.timeframe);
    info!(
        strategy_id,
        symbol = %cfg.symbol,
        timeframe = %cfg.timeframe,
        market_type = %cfg.market_type,
        leverage = cfg.leverage,
        execution_mode = %strategy.execution_mode,
        "strategy configured"
    );

    // Initialization: candle history + first indicator pass.
    let mut frame = fetch_frame(ctx, &strategy, &cfg).await?;
    if frame.len() < 2 {
        error!(strategy_id, bars = frame.len(), "not enough candle history");
        return Ok(());
    }
    info!(strategy_id, bars = frame.len(), "candle history loaded");

    let (mut pending_signals, new_hp) = recompute(ctx, &strategy, &cfg, &code, &frame).await?;
    let initial_close = frame.last().map(|c| c.close).unwrap_or(0.0);
    persist_highest(ctx, &strategy, &cfg, new_hp, initial_close).await;
    info!(
        strategy_id,
        pending = pending_signals.len(),
        "strategy initialized"
    );

    let mut dedup = SignalDedup::new();
    let mut last_kline_refresh = std::time::Instant::now();
    let kline_refresh = Duration::from_secs(tf_seconds.max(1) as u64);
    let mut ticker =
        tokio::time::interval(Duration::from_secs(ctx.config.tick_interval_sec.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        // Cancellation travels through the status column.
        if !ctx.store.is_strategy_running(strategy_id).await {
            info!(strategy_id, "strategy stopped");
            break;
        }

        // 1. Latest price through the shared cache.
        let current_price = match ctx.prices.latest(&cfg.symbol).await {
            Ok(p) if p > 0.0 => p,
            Ok(_) | Err(_) => {
                warn!(strategy_id, symbol = %cfg.symbol, "failed to fetch current price");
                continue;
            }
        };
        let now = now_ts();

        // 2/3. Candle refresh: full refetch once per timeframe period,
        // sliding update of the forming bar otherwise.
        if last_kline_refresh.elapsed() >= kline_refresh {
            match fetch_frame(ctx, &strategy, &cfg).await {
                Ok(fresh) if fresh.len() >= 2 => {
                    frame = fresh;
                    last_kline_refresh = std::time::Instant::now();
                }
                Ok(_) => warn!(strategy_id, "refetched history too short, keeping old frame"),
                Err(e) => warn!(strategy_id, error = %e, "candle refetch failed"),
            }
        } else {
            frame.update_with_price(current_price, now, tf_seconds);
        }

        match recompute(ctx, &strategy, &cfg, &code, &frame).await {
            Ok((signals, new_hp)) => {
                pending_signals = signals;
                persist_highest(ctx, &strategy, &cfg, new_hp, current_price).await;
            }
            Err(e) => {
                warn!(strategy_id, error = %e, "indicator recompute failed");
            }
        }

        // 4. Expiration, trigger checks, server-side exits.
        expire_signals(&mut pending_signals, now, tf_seconds);
        if !pending_signals.is_empty() {
            debug!(
                strategy_id,
                price = current_price,
                pending = pending_signals.len(),
                "monitoring"
            );
        }

        let mut triggered: Vec<PendingSignal> = Vec::new();
        pending_signals.retain(|s| {
            if is_triggered(s, current_price, &cfg) {
                triggered.push(s.clone());
                false
            } else {
                true
            }
        });

        let positions = match ctx.store.positions_for(strategy_id, &cfg.symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!(strategy_id, error = %e, "position load failed");
                continue;
            }
        };

        if let Some(pos) = positions.first() {
            // Keep the extreme-price tracking fresh so trailing survives
            // restarts, then evaluate the config-driven exits.
            let (hp, lp) = tracked_extremes(pos, current_price);
            let _ = ctx
                .store
                .upsert_position(
                    strategy_id,
                    strategy.user_id,
                    &pos.symbol,
                    pos.side,
                    pos.size,
                    pos.entry_price,
                    current_price,
                    hp,
                    lp,
                )
                .await;

            if let Some(sig) = take_profit_or_trailing_signal(
                pos,
                hp,
                lp,
                current_price,
                cfg.leverage,
                &cfg,
                tf_seconds,
                now,
            ) {
                triggered.push(sig);
            }
            if let Some(sig) =
                stop_loss_signal(pos, current_price, cfg.leverage, &cfg, tf_seconds, now)
            {
                triggered.push(sig);
            }
        }

        // 5. Strict state machine, priority ordering, de-dup: at most one
        // signal per tick reaches the queue.
        if !triggered.is_empty() {
            let state = position_state(&positions);
            if let Some(selected) = select_signal(
                triggered,
                state,
                cfg.trade_direction,
                &mut dedup,
                strategy_id,
                &cfg.symbol,
                tf_seconds,
                now,
            ) {
                match execute_signal(ctx, &strategy, &cfg, &selected, current_price, &positions)
                    .await
                {
                    Ok(true) => {
                        info!(
                            strategy_id,
                            signal = %selected.signal_type,
                            price = current_price,
                            reason = selected.reason.as_deref().unwrap_or(""),
                            "signal executed"
                        );
                    }
                    Ok(false) => {
                        debug!(strategy_id, signal = %selected.signal_type, "signal rejected");
                    }
                    Err(e) => {
                        warn!(strategy_id, signal = %selected.signal_type, error = %e, "signal execution failed");
                    }
                }
            }
        }

        // 6. Refresh current price on open rows once per tick.
        let _ = ctx
            .store
            .update_position_prices(strategy_id, &cfg.symbol, current_price)
            .await;
    }

    Ok(())
}

/// Turn one selected signal into a queued order intent.
///
/// Applies the hard state-machine guard, the optional AI entry filter, and
/// position sizing, then enqueues. In signal mode the fill is synthesized
/// locally so the state machine advances without the worker.
async fn execute_signal(
    ctx: &EngineContext,
    strategy: &Strategy,
    cfg: &TradingConfig,
    selected: &PendingSignal,
    current_price: f64,
    positions: &[Position],
) -> Result<bool> {
    let state = position_state(positions);
    if !selected.signal_type.allowed_in(state) {
        return Ok(false);
    }

    // AI entry filter gates open signals only.
    if selected.signal_type.is_open() && entry_filter_enabled(&strategy.ai_model_config) {
        let verdict = ctx
            .entry_filter
            .allow(
                strategy.id,
                &cfg.symbol,
                selected.signal_type,
                &strategy.ai_model_config,
            )
            .await;
        if !verdict.allowed {
            let reason = verdict
                .reason
                .map(|r| r.as_str().to_string())
                .unwrap_or_else(|| "ai_filter_rejected".to_string());
            let title = format!("Entry held by AI filter | {}", cfg.symbol);
            let message = format!(
                "signal={} ai_decision={} reason={}; holding (no order)",
                selected.signal_type,
                if verdict.decision.is_empty() { "UNKNOWN" } else { &verdict.decision },
                reason
            );
            let _ = ctx
                .store
                .insert_notification(
                    strategy.id,
                    &cfg.symbol,
                    "ai_filter_hold",
                    "browser",
                    &title,
                    &message,
                    &json!({
                        "strategy_id": strategy.id,
                        "strategy_name": strategy.strategy_name,
                        "symbol": cfg.symbol,
                        "signal_type": selected.signal_type.as_str(),
                        "ai_decision": verdict.decision,
                        "reason": reason,
                        "signal_ts": selected.timestamp,
                    }),
                )
                .await;
            info!(
                strategy_id = strategy.id,
                symbol = %cfg.symbol,
                signal = %selected.signal_type,
                reason = %reason,
                "entry rejected by AI filter"
            );
            return Ok(false);
        }
    }

    let execute_price = if selected.trigger_price > 0.0 {
        selected.trigger_price
    } else {
        current_price
    };

    let Some(sized) = compute_order(
        selected,
        cfg,
        cfg.leverage,
        strategy.initial_capital,
        execute_price,
        positions,
    ) else {
        return Ok(false);
    };

    let enqueue = EnqueueRequest {
        strategy_id: strategy.id,
        symbol: cfg.symbol.clone(),
        signal_type: sized.signal_type,
        signal_ts: selected.timestamp,
        market_type: cfg.market_type,
        amount: sized.amount,
        price: execute_price,
        leverage: cfg.leverage,
        execution_mode: strategy.execution_mode,
        notification_config: strategy.notification_config.clone(),
        margin_mode: "cross".to_string(),
    };
    let queued = ctx.store.enqueue_pending_order(&enqueue).await?;
    if queued.is_none() {
        debug!(strategy_id = strategy.id, signal = %sized.signal_type, "queue-side de-dup refused enqueue");
    }

    // Live fills belong to the worker; in signal mode the runner advances
    // the local state machine itself.
    if strategy.execution_mode == ExecutionMode::Live {
        return Ok(true);
    }

    let sim_order_id = Uuid::new_v4().to_string();
    let _profit = apply_fill_to_local_position(
        &ctx.store,
        strategy.id,
        strategy.user_id,
        &cfg.symbol,
        sized.signal_type,
        sized.amount,
        execute_price,
    )
    .await?;
    ctx.store
        .record_trade(
            strategy.id,
            &cfg.symbol,
            sized.signal_type,
            execute_price,
            sized.amount,
            0.0,
            "",
            None,
        )
        .await?;
    info!(
        strategy_id = strategy.id,
        symbol = %cfg.symbol,
        signal = %sized.signal_type,
        price = execute_price,
        amount = sized.amount,
        sim_order_id = %sim_order_id,
        "simulated fill recorded"
    );
    Ok(true)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support;
    use crate::store::Store;
    use crate::types::{PositionState, SignalType};
    use serde_json::json;

    async fn seeded_strategy(store: &Store, mode: ExecutionMode) -> Strategy {
        let id = store
            .insert_strategy(
                1,
                "loop-test",
                "running",
                1000.0,
                5.0,
                mode,
                &json!({}),
                &json!({"indicator_code": "fast=2\nslow=4"}),
                &json!({"exchange_id": "binance"}),
                &json!({"symbol": "BTC/USDT", "timeframe": "1m", "leverage": 5, "trade_direction": "both"}),
                &json!({}),
            )
            .await
            .unwrap();
        store.load_strategy(id).await.unwrap().unwrap()
    }

    fn open_long(ts: i64) -> PendingSignal {
        PendingSignal {
            signal_type: SignalType::OpenLong,
            trigger_price: 100.0,
            position_size: 0.1,
            timestamp: ts,
            reason: None,
        }
    }

    #[tokio::test]
    async fn signal_mode_open_synthesizes_local_fill() {
        let store = Store::memory().await.unwrap();
        let ctx = test_support::context(store.clone(), vec![], 100.0);
        let strategy = seeded_strategy(&store, ExecutionMode::Signal).await;
        let mut cfg = strategy.trading.clone();
        cfg.sanitize(strategy.leverage);

        let ok = execute_signal(&ctx, &strategy, &cfg, &open_long(1_700_000_000), 100.0, &[])
            .await
            .unwrap();
        assert!(ok);

        // queued once
        let batch = store.fetch_pending_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        // 1000 * 0.1 * 5 / 100 = 5 base units
        assert!((batch[0].amount - 5.0).abs() < 1e-9);

        // local simulation opened the position and journaled the trade
        let positions = store.positions_for(strategy.id, "BTC/USDT").await.unwrap();
        assert_eq!(position_state(&positions), PositionState::Long);
        assert!((positions[0].size - 5.0).abs() < 1e-9);
        let trades = store.trades_for_strategy(strategy.id, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
    }

    #[tokio::test]
    async fn live_mode_leaves_fills_to_the_worker() {
        let store = Store::memory().await.unwrap();
        let ctx = test_support::context(store.clone(), vec![], 100.0);
        let strategy = seeded_strategy(&store, ExecutionMode::Live).await;
        let mut cfg = strategy.trading.clone();
        cfg.sanitize(strategy.leverage);

        let ok = execute_signal(&ctx, &strategy, &cfg, &open_long(1_700_000_000), 100.0, &[])
            .await
            .unwrap();
        assert!(ok);

        assert_eq!(store.fetch_pending_batch(10).await.unwrap().len(), 1);
        // no local mutation in live mode
        assert!(store
            .positions_for(strategy.id, "BTC/USDT")
            .await
            .unwrap()
            .is_empty());
        assert!(store.trades_for_strategy(strategy.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn state_machine_guard_blocks_mismatched_signal() {
        let store = Store::memory().await.unwrap();
        let ctx = test_support::context(store.clone(), vec![], 100.0);
        let strategy = seeded_strategy(&store, ExecutionMode::Signal).await;
        let mut cfg = strategy.trading.clone();
        cfg.sanitize(strategy.leverage);

        // already long: open_long must be silently rejected
        store
            .upsert_position(strategy.id, 1, "BTC/USDT", Side::Long, 5.0, 100.0, 100.0, 0.0, 0.0)
            .await
            .unwrap();
        let positions = store.positions_for(strategy.id, "BTC/USDT").await.unwrap();

        let ok = execute_signal(
            &ctx,
            &strategy,
            &cfg,
            &open_long(1_700_000_000),
            100.0,
            &positions,
        )
        .await
        .unwrap();
        assert!(!ok);
        assert!(store.fetch_pending_batch(10).await.unwrap().is_empty());
        // position unchanged
        let after = store.positions_for(strategy.id, "BTC/USDT").await.unwrap();
        assert!((after[0].size - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn ai_filter_rejection_persists_notification() {
        let store = Store::memory().await.unwrap();
        let ctx = test_support::context(store.clone(), vec![], 100.0);
        let id = store
            .insert_strategy(
                1,
                "filtered",
                "running",
                1000.0,
                5.0,
                ExecutionMode::Signal,
                &json!({}),
                &json!({"indicator_code": "fast=2\nslow=4"}),
                &json!({"exchange_id": "binance"}),
                &json!({"symbol": "BTC/USDT", "timeframe": "1m", "leverage": 5}),
                // enabled filter with no endpoint -> analysis_error rejection
                &json!({"entry_ai_filter_enabled": true}),
            )
            .await
            .unwrap();
        let strategy = store.load_strategy(id).await.unwrap().unwrap();
        let mut cfg = strategy.trading.clone();
        cfg.sanitize(strategy.leverage);

        let ok = execute_signal(&ctx, &strategy, &cfg, &open_long(1_700_000_000), 100.0, &[])
            .await
            .unwrap();
        assert!(!ok);
        assert!(store.fetch_pending_batch(10).await.unwrap().is_empty());
        assert_eq!(store.notification_count(id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn signal_mode_close_deletes_position_and_journals_trade() {
        let store = Store::memory().await.unwrap();
        let ctx = test_support::context(store.clone(), vec![], 110.0);
        let strategy = seeded_strategy(&store, ExecutionMode::Signal).await;
        let mut cfg = strategy.trading.clone();
        cfg.sanitize(strategy.leverage);

        store
            .upsert_position(strategy.id, 1, "BTC/USDT", Side::Long, 5.0, 100.0, 100.0, 0.0, 0.0)
            .await
            .unwrap();
        let positions = store.positions_for(strategy.id, "BTC/USDT").await.unwrap();

        let close = PendingSignal {
            signal_type: SignalType::CloseLong,
            trigger_price: 0.0,
            position_size: 0.0,
            timestamp: 1_700_000_060,
            reason: Some("server_stop_loss".to_string()),
        };
        let ok = execute_signal(&ctx, &strategy, &cfg, &close, 110.0, &positions)
            .await
            .unwrap();
        assert!(ok);

        assert!(store
            .positions_for(strategy.id, "BTC/USDT")
            .await
            .unwrap()
            .is_empty());
        let trades = store.trades_for_strategy(strategy.id, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].trade_type, "close_long");
        assert!((trades[0].amount - 5.0).abs() < 1e-9);
    }
}
