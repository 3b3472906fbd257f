// =============================================================================
// Position sizing — capital ratios to concrete base amounts
// =============================================================================
//
// Open/add signals size from the capital budget: spot notional is
// capital * ratio, futures notional is capital * ratio * leverage (capital
// is the margin budget). Reduce signals are a fraction of the current
// position and promote to a full close when nearly everything would go.
// Close signals take the whole position.
// =============================================================================

use crate::indicator::PendingSignal;
use crate::runner::exits::to_ratio;
use crate::store::positions::Position;
use crate::store::strategies::TradingConfig;
use crate::types::{MarketType, SignalType};

/// Reduce orders at or above this fraction of the position become closes.
const REDUCE_PROMOTES_TO_CLOSE: f64 = 0.999;

/// Fallback capital ratio when an entry signal carries no usable size.
const FALLBACK_ENTRY_RATIO: f64 = 0.05;

/// A sized order ready to enqueue. The signal type may differ from the
/// input when a reduce was promoted to a close.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedOrder {
    pub signal_type: SignalType,
    pub amount: f64,
}

/// Convert a selected signal into a base-asset amount.
///
/// Returns `None` when the signal cannot be sized: no position to
/// close/reduce, zero amounts, or a short signal on a spot market.
pub fn compute_order(
    signal: &PendingSignal,
    cfg: &TradingConfig,
    leverage: f64,
    capital: f64,
    price: f64,
    positions: &[Position],
) -> Option<SizedOrder> {
    let sig = signal.signal_type;

    // Spot never shorts.
    if cfg.market_type == MarketType::Spot && sig.side() == crate::types::Side::Short {
        return None;
    }
    if price <= 0.0 {
        return None;
    }

    if sig.is_open() || sig.is_add() {
        let mut size = signal.position_size;
        // entry_pct from the trading config overrides the script's size
        // for open signals.
        if sig.is_open() {
            if let Some(ep) = cfg.entry_pct {
                size = ep;
            }
        }
        if size <= 0.0 {
            size = FALLBACK_ENTRY_RATIO;
        }
        let ratio = to_ratio(size);
        let amount = match cfg.market_type {
            MarketType::Spot => capital * ratio / price,
            MarketType::Swap => capital * ratio * leverage.max(1.0) / price,
        };
        if amount <= 0.0 {
            return None;
        }
        return Some(SizedOrder {
            signal_type: sig,
            amount,
        });
    }

    if sig.is_reduce() {
        let side = sig.side();
        let pos = positions.iter().find(|p| p.side == side)?;
        if pos.size <= 0.0 {
            return None;
        }
        let ratio = {
            let r = to_ratio(signal.position_size);
            if r > 0.0 {
                r
            } else {
                0.1
            }
        };
        let reduce_amount = pos.size * ratio;
        if reduce_amount >= pos.size * REDUCE_PROMOTES_TO_CLOSE {
            let promoted = match sig {
                SignalType::ReduceLong => SignalType::CloseLong,
                _ => SignalType::CloseShort,
            };
            return Some(SizedOrder {
                signal_type: promoted,
                amount: pos.size,
            });
        }
        return Some(SizedOrder {
            signal_type: sig,
            amount: reduce_amount,
        });
    }

    // close_*: the full current position.
    let side = sig.side();
    let pos = positions.iter().find(|p| p.side == side)?;
    if pos.size <= 0.0 {
        return None;
    }
    Some(SizedOrder {
        signal_type: sig,
        amount: pos.size,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn signal(signal_type: SignalType, position_size: f64) -> PendingSignal {
        PendingSignal {
            signal_type,
            trigger_price: 100.0,
            position_size,
            timestamp: 0,
            reason: None,
        }
    }

    fn pos(side: Side, size: f64) -> Position {
        Position {
            id: 1,
            user_id: 1,
            strategy_id: 1,
            symbol: "BTC/USDT".to_string(),
            side,
            size,
            entry_price: 100.0,
            current_price: 100.0,
            highest_price: 0.0,
            lowest_price: 0.0,
            updated_at: 0,
        }
    }

    fn swap_cfg(leverage: f64) -> TradingConfig {
        let mut cfg = TradingConfig::default();
        cfg.market_type = MarketType::Swap;
        cfg.leverage = leverage;
        cfg
    }

    #[test]
    fn futures_open_scales_with_leverage() {
        // capital 1000, ratio 0.1, 5x, price 100 -> 5 base units
        let order = compute_order(
            &signal(SignalType::OpenLong, 0.1),
            &swap_cfg(5.0),
            5.0,
            1000.0,
            100.0,
            &[],
        )
        .unwrap();
        assert!((order.amount - 5.0).abs() < 1e-9);
        assert_eq!(order.signal_type, SignalType::OpenLong);
    }

    #[test]
    fn spot_open_ignores_leverage() {
        let mut cfg = TradingConfig::default();
        cfg.market_type = MarketType::Spot;
        let order = compute_order(
            &signal(SignalType::OpenLong, 0.1),
            &cfg,
            1.0,
            1000.0,
            100.0,
            &[],
        )
        .unwrap();
        assert!((order.amount - 1.0).abs() < 1e-9);
    }

    #[test]
    fn percent_scale_ratios_accepted() {
        // 10 (percent) behaves as 0.1
        let order = compute_order(
            &signal(SignalType::OpenLong, 10.0),
            &swap_cfg(1.0),
            1.0,
            1000.0,
            100.0,
            &[],
        )
        .unwrap();
        assert!((order.amount - 1.0).abs() < 1e-9);
    }

    #[test]
    fn entry_pct_overrides_script_size_for_opens_only() {
        let mut cfg = swap_cfg(1.0);
        cfg.entry_pct = Some(0.2);
        let open = compute_order(&signal(SignalType::OpenLong, 0.05), &cfg, 1.0, 1000.0, 100.0, &[])
            .unwrap();
        assert!((open.amount - 2.0).abs() < 1e-9);
        // adds keep the script size
        let add = compute_order(&signal(SignalType::AddLong, 0.05), &cfg, 1.0, 1000.0, 100.0, &[])
            .unwrap();
        assert!((add.amount - 0.5).abs() < 1e-9);
    }

    #[test]
    fn zero_size_entry_falls_back() {
        let order = compute_order(
            &signal(SignalType::OpenLong, 0.0),
            &swap_cfg(1.0),
            1.0,
            1000.0,
            100.0,
            &[],
        )
        .unwrap();
        // fallback ratio 0.05 -> 0.5 base
        assert!((order.amount - 0.5).abs() < 1e-9);
    }

    #[test]
    fn reduce_takes_fraction_of_position() {
        let positions = [pos(Side::Long, 10.0)];
        let order = compute_order(
            &signal(SignalType::ReduceLong, 0.3),
            &swap_cfg(5.0),
            5.0,
            1000.0,
            100.0,
            &positions,
        )
        .unwrap();
        assert_eq!(order.signal_type, SignalType::ReduceLong);
        assert!((order.amount - 3.0).abs() < 1e-9);
    }

    #[test]
    fn near_full_reduce_promotes_to_close() {
        let positions = [pos(Side::Short, 10.0)];
        let order = compute_order(
            &signal(SignalType::ReduceShort, 0.9995),
            &swap_cfg(5.0),
            5.0,
            1000.0,
            100.0,
            &positions,
        )
        .unwrap();
        assert_eq!(order.signal_type, SignalType::CloseShort);
        assert!((order.amount - 10.0).abs() < 1e-9);
    }

    #[test]
    fn close_takes_full_position_and_needs_one() {
        let positions = [pos(Side::Long, 7.5)];
        let order = compute_order(
            &signal(SignalType::CloseLong, 0.0),
            &swap_cfg(5.0),
            5.0,
            1000.0,
            100.0,
            &positions,
        )
        .unwrap();
        assert!((order.amount - 7.5).abs() < 1e-9);

        // no position: nothing to close
        assert!(compute_order(
            &signal(SignalType::CloseLong, 0.0),
            &swap_cfg(5.0),
            5.0,
            1000.0,
            100.0,
            &[],
        )
        .is_none());
    }

    #[test]
    fn spot_rejects_short_side_signals() {
        let mut cfg = TradingConfig::default();
        cfg.market_type = MarketType::Spot;
        assert!(compute_order(
            &signal(SignalType::OpenShort, 0.1),
            &cfg,
            1.0,
            1000.0,
            100.0,
            &[],
        )
        .is_none());
    }
}
