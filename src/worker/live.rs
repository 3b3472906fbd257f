// =============================================================================
// Live dispatch — two-phase maker-then-market execution
// =============================================================================
//
// Unless the order mode is pure market, execution hangs a skewed limit
// order first, polls it for `maker_wait_sec`, then chases any remainder
// with a market order (reduce-only for exits). Partial-fill accounting
// spans both phases.
//
// The partial-success rule: a venue-level market-phase error after any
// maker fill records the order as `sent` with what filled; with zero
// prior fills the order is `failed`. Transport-level errors always fail
// the order. This asymmetry is load-bearing: an operator retry after a
// partial fill must not duplicate the filled portion.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::OrderMode;
use crate::exchange::{
    create_client, make_client_order_id, ExchangeClient, LeveragePolicy, OrderRequest, OrderSide,
    CRYPTO_VENUES,
};
use crate::store::pending_orders::{PendingOrder, SentUpdate};
use crate::types::{MarketCategory, MarketType, SignalType};
use crate::worker::fills::apply_fill_to_local_position;
use crate::worker::PendingOrderWorker;

/// Stable-valued fee currencies that may be netted against profit.
const STABLE_FEE_CCYS: &[&str] = &["USDT", "USDC", "USD"];

fn payload_f64(payload: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(v) = payload.get(*key) {
            let parsed = match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            };
            if let Some(x) = parsed {
                return Some(x);
            }
        }
    }
    None
}

fn payload_str<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    for key in keys {
        if let Some(s) = payload.get(*key).and_then(|v| v.as_str()) {
            if !s.trim().is_empty() {
                return Some(s);
            }
        }
    }
    None
}

/// Map a signal onto venue order parameters:
/// (side, reduce_only). Entries trade in the signal's direction; exits
/// trade against it with reduce-only set.
fn signal_to_order_side(sig: SignalType) -> (OrderSide, bool) {
    match sig {
        SignalType::OpenLong | SignalType::AddLong => (OrderSide::Buy, false),
        SignalType::OpenShort | SignalType::AddShort => (OrderSide::Sell, false),
        SignalType::CloseLong | SignalType::ReduceLong => (OrderSide::Sell, true),
        SignalType::CloseShort | SignalType::ReduceShort => (OrderSide::Buy, true),
    }
}

impl PendingOrderWorker {
    /// Validate the order against its strategy's venue configuration and
    /// hand it to the execution protocol.
    pub(crate) async fn execute_live_order(
        &self,
        order: &PendingOrder,
        payload: &Value,
    ) -> anyhow::Result<()> {
        if order.strategy_id <= 0 {
            return self.fail(order, payload, "missing_strategy_id").await;
        }
        if order.symbol.trim().is_empty() || order.signal_type.trim().is_empty() {
            return self.fail(order, payload, "missing_symbol_or_signal_type").await;
        }

        let Some(strategy) = self.ctx.store.load_strategy(order.strategy_id).await? else {
            return self.fail(order, payload, "missing_strategy").await;
        };
        let exchange_id = strategy.exchange_id();
        let category = strategy.market_category();

        // Market-category guardrails: never execute what the venue cannot
        // legally trade.
        if matches!(category, MarketCategory::AShare | MarketCategory::Futures) {
            let err = format!(
                "live_trading_not_supported_for_{}",
                category.as_str().to_lowercase()
            );
            return self.fail(order, payload, &err).await;
        }
        if exchange_id == "ibkr"
            && !matches!(category, MarketCategory::USStock | MarketCategory::HShare)
        {
            let err = format!(
                "ibkr_only_supports_usstock_hshare_got_{}",
                category.as_str().to_lowercase()
            );
            return self.fail(order, payload, &err).await;
        }
        if exchange_id == "mt5" && category != MarketCategory::Forex {
            let err = format!(
                "mt5_only_supports_forex_got_{}",
                category.as_str().to_lowercase()
            );
            return self.fail(order, payload, &err).await;
        }
        if CRYPTO_VENUES.contains(&exchange_id.as_str()) && category != MarketCategory::Crypto {
            let err = format!(
                "crypto_exchange_only_supports_crypto_got_{}",
                category.as_str().to_lowercase()
            );
            return self.fail(order, payload, &err).await;
        }

        let market_type = MarketType::parse(
            payload_str(payload, &["market_type"]).unwrap_or(&order.market_type),
        );

        let client = match create_client(&strategy.exchange_config, market_type) {
            Ok(c) => c,
            Err(e) => {
                let err = format!("create_client_failed:{e}");
                return self.fail(order, payload, &err).await;
            }
        };

        let leverage = payload_f64(payload, &["leverage"])
            .filter(|v| *v > 0.0)
            .unwrap_or_else(|| strategy.leverage.max(1.0));

        self.execute_with_client(client, order, payload, leverage).await
    }

    async fn fail(&self, order: &PendingOrder, payload: &Value, error: &str) -> anyhow::Result<()> {
        self.ctx.store.mark_order_failed(order.id, error).await?;
        warn!(
            pending_id = order.id,
            strategy_id = order.strategy_id,
            error,
            "order rejected"
        );
        self.notify_live_best_effort(order, payload, "failed", error, "", "", 0.0, 0.0)
            .await;
        Ok(())
    }

    /// The two-phase protocol against a concrete client.
    pub(crate) async fn execute_with_client(
        &self,
        client: Arc<dyn ExchangeClient>,
        order: &PendingOrder,
        payload: &Value,
        leverage: f64,
    ) -> anyhow::Result<()> {
        let Some(sig) = SignalType::parse(&order.signal_type) else {
            let err = format!("unsupported_signal_type:{}", order.signal_type);
            return self.fail(order, payload, &err).await;
        };
        let market_type = client.market_type();

        // Spot never shorts in this system.
        if market_type == MarketType::Spot && sig.side() == crate::types::Side::Short {
            return self
                .fail(order, payload, "spot_market_does_not_support_short_signals")
                .await;
        }

        let (side, reduce_only) = signal_to_order_side(sig);
        let pos_side = sig.side();
        let margin_mode = payload_str(payload, &["margin_mode", "td_mode"])
            .unwrap_or("cross")
            .to_string();

        let ref_price = payload_f64(payload, &["ref_price", "price"])
            .filter(|v| *v > 0.0)
            .unwrap_or(order.price);
        let amount = payload_f64(payload, &["amount"])
            .filter(|v| *v > 0.0)
            .unwrap_or(order.amount);
        if amount <= 0.0 {
            return self.fail(order, payload, "invalid_amount").await;
        }

        // Execution knobs: payload overrides beat the environment defaults.
        let order_mode = payload_str(payload, &["order_mode", "orderMode"])
            .map(OrderMode::parse)
            .unwrap_or(self.ctx.config.order_mode);
        let maker_wait_sec = payload_f64(payload, &["maker_wait_sec", "makerWaitSec"])
            .filter(|v| *v > 0.0)
            .unwrap_or(self.ctx.config.maker_wait_sec);
        let maker_offset = payload_f64(payload, &["maker_offset_bps", "makerOffsetBps"])
            .map(|bps| bps.max(0.0) / 10_000.0)
            .unwrap_or_else(|| self.ctx.config.maker_offset());

        let venue = client.venue();
        let mut phases: Map<String, Value> = Map::new();

        // Leverage handling. Mandatory policy aborts on failure: placing a
        // futures order at an unintended leverage corrupts the margin math
        // the sizing already committed to.
        if market_type == MarketType::Swap {
            match client.leverage_policy() {
                LeveragePolicy::Mandatory => {
                    if let Err(e) = client
                        .set_leverage(&order.symbol, leverage, &margin_mode, pos_side)
                        .await
                    {
                        let err = format!("{venue}_set_leverage_failed:{e}");
                        return self.fail(order, payload, &err).await;
                    }
                    phases.insert(
                        "set_leverage".to_string(),
                        json!({"exchange": venue, "symbol": order.symbol, "leverage": leverage}),
                    );
                }
                LeveragePolicy::BestEffort | LeveragePolicy::Unsupported => {}
            }
        }

        // Accumulated fills across phases.
        let mut total_base = 0.0_f64;
        let mut total_quote = 0.0_f64;
        let mut total_fee = 0.0_f64;
        let mut fee_ccy = String::new();
        let apply_fill = |filled: f64, avg: f64, base: &mut f64, quote: &mut f64| {
            if filled > 0.0 && avg > 0.0 {
                *base += filled;
                *quote += filled * avg;
            }
        };

        let mut remaining = amount;
        let mut limit_order_id = String::new();

        // Phase 1: resting limit order.
        if order_mode.use_limit_first() {
            if ref_price <= 0.0 {
                phases.insert(
                    "limit_error".to_string(),
                    json!("missing_ref_price_for_limit_order"),
                );
            } else {
                let limit_price = match side {
                    OrderSide::Buy => ref_price * (1.0 - maker_offset),
                    OrderSide::Sell => ref_price * (1.0 + maker_offset),
                };
                let limit_oid =
                    make_client_order_id(venue, order.strategy_id, order.id, "lmt");

                if market_type == MarketType::Swap
                    && client.leverage_policy() == LeveragePolicy::BestEffort
                {
                    if let Err(e) = client
                        .set_leverage(&order.symbol, leverage, &margin_mode, pos_side)
                        .await
                    {
                        debug!(venue, error = %e, "best-effort leverage set failed");
                    }
                }

                let req = OrderRequest {
                    symbol: order.symbol.clone(),
                    side,
                    quantity: remaining,
                    ref_price,
                    reduce_only,
                    pos_side,
                    post_only: order_mode.post_only(),
                    margin_mode: margin_mode.clone(),
                    client_order_id: limit_oid.clone(),
                };

                match client.place_limit_order(&req, limit_price).await {
                    Ok(ack) => {
                        limit_order_id = ack.exchange_order_id.clone();
                        phases.insert("limit_place".to_string(), ack.raw);

                        match client
                            .wait_for_fill(
                                &order.symbol,
                                &limit_order_id,
                                &limit_oid,
                                Duration::from_secs_f64(maker_wait_sec),
                            )
                            .await
                        {
                            Ok(fill) => {
                                apply_fill(
                                    fill.filled,
                                    fill.avg_price,
                                    &mut total_base,
                                    &mut total_quote,
                                );
                                if fill.fee > 0.0 {
                                    total_fee += fill.fee;
                                    if fee_ccy.is_empty() && !fill.fee_ccy.is_empty() {
                                        fee_ccy = fill.fee_ccy.clone();
                                    }
                                }
                                phases.insert(
                                    "limit_query".to_string(),
                                    json!({"filled": fill.filled, "avg_price": fill.avg_price}),
                                );
                            }
                            Err(e) => {
                                phases.insert("limit_query_error".to_string(), json!(e.to_string()));
                            }
                        }

                        remaining = (amount - total_base).max(0.0);

                        // Tail guard: a remainder below the venue's minimum
                        // tradable amount must not be chased with a market
                        // order. The exchange already holds the filled part;
                        // chasing would fail and mislabel the whole order.
                        if remaining > 0.0 && market_type == MarketType::Swap {
                            if let Ok(meta) = client.instrument(&order.symbol).await {
                                let min_base = meta.min_base();
                                if min_base > 0.0 && remaining < min_base * 0.999999 {
                                    phases.insert(
                                        "tail_guard".to_string(),
                                        json!({
                                            "exchange": venue,
                                            "remaining": remaining,
                                            "min_base": min_base,
                                        }),
                                    );
                                    remaining = 0.0;
                                }
                            }
                        }

                        // Cancel the resting remainder best-effort.
                        if remaining > amount * 0.001 {
                            match client
                                .cancel_order(&order.symbol, &limit_order_id, &limit_oid)
                                .await
                            {
                                Ok(()) => {
                                    phases.insert("limit_cancel".to_string(), json!("ok"));
                                }
                                Err(e) => {
                                    debug!(venue, error = %e, "limit cancel failed");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        // Any maker-phase failure falls back to market for
                        // the full amount.
                        warn!(
                            pending_id = order.id,
                            venue,
                            error = %e,
                            "limit phase failed, falling back to market"
                        );
                        phases.insert("limit_error".to_string(), json!(e.to_string()));
                        remaining = amount;
                    }
                }
            }
        }

        // Phase 2: market order for the remainder.
        let mut market_order_id = String::new();
        if remaining > 0.0 {
            if market_type == MarketType::Swap
                && client.leverage_policy() == LeveragePolicy::BestEffort
            {
                let _ = client
                    .set_leverage(&order.symbol, leverage, &margin_mode, pos_side)
                    .await;
            }

            let market_oid = make_client_order_id(venue, order.strategy_id, order.id, "mkt");
            let req = OrderRequest {
                symbol: order.symbol.clone(),
                side,
                quantity: remaining,
                ref_price,
                reduce_only,
                pos_side,
                post_only: false,
                margin_mode: margin_mode.clone(),
                client_order_id: market_oid.clone(),
            };

            match client.place_market_order(&req).await {
                Ok(ack) => {
                    market_order_id = ack.exchange_order_id.clone();
                    phases.insert("market_place".to_string(), ack.raw);

                    match client
                        .wait_for_fill(
                            &order.symbol,
                            &market_order_id,
                            &market_oid,
                            client.market_fill_wait(),
                        )
                        .await
                    {
                        Ok(fill) => {
                            apply_fill(
                                fill.filled,
                                fill.avg_price,
                                &mut total_base,
                                &mut total_quote,
                            );
                            if fill.fee > 0.0 {
                                total_fee += fill.fee;
                                if fee_ccy.is_empty() && !fill.fee_ccy.is_empty() {
                                    fee_ccy = fill.fee_ccy.clone();
                                }
                            }
                            phases.insert(
                                "market_query".to_string(),
                                json!({"filled": fill.filled, "avg_price": fill.avg_price}),
                            );
                        }
                        Err(e) => {
                            phases.insert("market_query_error".to_string(), json!(e.to_string()));
                        }
                    }
                }
                Err(e) => {
                    phases.insert("market_error".to_string(), json!(e.to_string()));
                    if e.is_venue_level() && total_base > 0.0 {
                        // Partial-success rule: keep the maker fill, never
                        // flip the whole order to failed.
                        info!(
                            pending_id = order.id,
                            strategy_id = order.strategy_id,
                            filled = total_base,
                            error = %e,
                            "market tail failed with partial fill, recording as sent"
                        );
                    } else {
                        self.ctx
                            .store
                            .mark_order_failed(order.id, &e.to_string())
                            .await?;
                        warn!(pending_id = order.id, error = %e, "order failed");
                        self.notify_live_best_effort(
                            order,
                            payload,
                            "failed",
                            &e.to_string(),
                            venue,
                            "",
                            ref_price,
                            amount,
                        )
                        .await;
                        return Ok(());
                    }
                }
            }
        }

        // Best-effort final accounting: when nothing was observed filled
        // but no error surfaced either, assume the requested amount at the
        // reference price.
        let mut filled = total_base;
        let mut avg_price = if total_base > 0.0 {
            total_quote / total_base
        } else {
            0.0
        };
        if filled <= 0.0 && ref_price > 0.0 {
            filled = amount;
            avg_price = ref_price;
        }

        let exchange_order_id = if !market_order_id.is_empty() {
            market_order_id
        } else {
            limit_order_id
        };

        // Persist the queue outcome first, then settle locally.
        self.ctx
            .store
            .mark_order_sent(
                order.id,
                &SentUpdate {
                    note: "live_order_sent".to_string(),
                    exchange_id: venue.to_string(),
                    exchange_order_id: exchange_order_id.clone(),
                    exchange_response_json: json!({"phases": Value::Object(phases)}).to_string(),
                    filled,
                    avg_price,
                    executed_at: Some(chrono::Utc::now().timestamp()),
                },
            )
            .await?;
        info!(
            pending_id = order.id,
            strategy_id = order.strategy_id,
            venue,
            exchange_order_id = %exchange_order_id,
            filled,
            avg_price,
            "order sent"
        );

        if filled > 0.0 && avg_price > 0.0 {
            match apply_fill_to_local_position(
                &self.ctx.store,
                order.strategy_id,
                order.user_id,
                &order.symbol,
                sig,
                filled,
                avg_price,
            )
            .await
            {
                Ok(mut profit) => {
                    // Net the fee against profit only when it is charged in
                    // a stable currency; otherwise store it as-is.
                    if let Some(p) = profit {
                        if total_fee > 0.0
                            && STABLE_FEE_CCYS.contains(&fee_ccy.to_uppercase().as_str())
                        {
                            profit = Some(p - total_fee);
                        }
                    }
                    if let Err(e) = self
                        .ctx
                        .store
                        .record_trade(
                            order.strategy_id,
                            &order.symbol,
                            sig,
                            avg_price,
                            filled,
                            total_fee,
                            &fee_ccy,
                            profit,
                        )
                        .await
                    {
                        warn!(pending_id = order.id, error = %e, "trade record failed");
                    }
                }
                Err(e) => {
                    warn!(pending_id = order.id, error = %e, "position update failed");
                }
            }
        }

        self.notify_live_best_effort(
            order,
            payload,
            "sent",
            "",
            venue,
            &exchange_order_id,
            if avg_price > 0.0 { avg_price } else { ref_price },
            if filled > 0.0 { filled } else { amount },
        )
        .await;
        Ok(())
    }
}
