// =============================================================================
// Server-side risk exits — stop-loss, fixed take-profit, trailing stop
// =============================================================================
//
// These run against the latest position and price on every tick, fully
// independent of the indicator, so a script that stops emitting close
// signals cannot strand a losing position. Percentages are defined on
// margin PnL: the price-move threshold is the configured percentage
// divided by leverage. Exit signals carry the current candle's open time
// so they share the per-candle de-dup with indicator signals.
// =============================================================================

use crate::indicator::PendingSignal;
use crate::store::positions::Position;
use crate::store::strategies::TradingConfig;
use crate::types::{Side, SignalType};

/// Open time of the candle covering `now`.
pub fn candle_open(now: i64, timeframe_seconds: i64) -> i64 {
    let tf = if timeframe_seconds > 0 { timeframe_seconds } else { 60 };
    (now / tf) * tf
}

/// Convert a percent-like value into a ratio in [0, 1]. Accepts both 0..1
/// and 0..100 inputs.
pub fn to_ratio(v: f64) -> f64 {
    let mut x = v;
    if x > 1.0 {
        x /= 100.0;
    }
    x.clamp(0.0, 1.0)
}

/// Updated extreme-price tracking for a position: the highest and lowest
/// prices seen since entry, seeded from the entry price when unset.
pub fn tracked_extremes(pos: &Position, current_price: f64) -> (f64, f64) {
    let mut hp = pos.highest_price;
    if hp <= 0.0 {
        hp = pos.entry_price;
    }
    hp = hp.max(current_price);

    let mut lp = pos.lowest_price;
    if lp <= 0.0 {
        lp = pos.entry_price;
    }
    lp = lp.min(current_price);

    (hp, lp)
}

fn close_signal(side: Side, timestamp: i64, reason: &str) -> PendingSignal {
    PendingSignal {
        signal_type: match side {
            Side::Long => SignalType::CloseLong,
            Side::Short => SignalType::CloseShort,
        },
        // Zero trigger price: fires under the exit trigger mode.
        trigger_price: 0.0,
        position_size: 0.0,
        timestamp,
        reason: Some(reason.to_string()),
    }
}

/// Config-driven backstop stop-loss. Only active when `stop_loss_pct > 0`
/// and `enable_server_side_stop_loss` is not switched off.
pub fn stop_loss_signal(
    pos: &Position,
    current_price: f64,
    leverage: f64,
    cfg: &TradingConfig,
    timeframe_seconds: i64,
    now: i64,
) -> Option<PendingSignal> {
    if !cfg.enable_server_side_stop_loss {
        return None;
    }
    if pos.entry_price <= 0.0 || current_price <= 0.0 {
        return None;
    }
    let sl = to_ratio(cfg.stop_loss_pct);
    if sl <= 0.0 {
        return None;
    }

    let lev = leverage.max(1.0);
    let sl_eff = sl / lev;
    let ts = candle_open(now, timeframe_seconds);

    match pos.side {
        Side::Long => {
            let stop_line = pos.entry_price * (1.0 - sl_eff);
            (current_price <= stop_line).then(|| close_signal(Side::Long, ts, "server_stop_loss"))
        }
        Side::Short => {
            let stop_line = pos.entry_price * (1.0 + sl_eff);
            (current_price >= stop_line).then(|| close_signal(Side::Short, ts, "server_stop_loss"))
        }
    }
}

/// Fixed take-profit and trailing stop.
///
/// When trailing is enabled with a positive distance, the fixed
/// take-profit is disabled; if no activation threshold is configured, the
/// take-profit percentage doubles as the activation threshold. `hp`/`lp`
/// are the already-updated extremes from [`tracked_extremes`].
#[allow(clippy::too_many_arguments)]
pub fn take_profit_or_trailing_signal(
    pos: &Position,
    hp: f64,
    lp: f64,
    current_price: f64,
    leverage: f64,
    cfg: &TradingConfig,
    timeframe_seconds: i64,
    now: i64,
) -> Option<PendingSignal> {
    if pos.entry_price <= 0.0 || current_price <= 0.0 {
        return None;
    }

    let lev = leverage.max(1.0);
    let tp = to_ratio(cfg.take_profit_pct);
    let trailing_pct = to_ratio(cfg.trailing_stop_pct);
    let trailing_act = to_ratio(cfg.trailing_activation_pct);

    let mut tp_eff = if tp > 0.0 { tp / lev } else { 0.0 };
    let trailing_pct_eff = if trailing_pct > 0.0 { trailing_pct / lev } else { 0.0 };
    let mut trailing_act_eff = if trailing_act > 0.0 { trailing_act / lev } else { 0.0 };

    // Conflict rule: trailing wins over fixed TP, and inherits the TP
    // percentage as activation when none is set.
    if cfg.trailing_enabled && trailing_pct_eff > 0.0 {
        tp_eff = 0.0;
        if trailing_act_eff <= 0.0 && tp > 0.0 {
            trailing_act_eff = tp / lev;
        }
    }

    let ts = candle_open(now, timeframe_seconds);

    // 1) Trailing stop
    if cfg.trailing_enabled && trailing_pct_eff > 0.0 {
        match pos.side {
            Side::Long => {
                let armed = trailing_act_eff <= 0.0
                    || hp >= pos.entry_price * (1.0 + trailing_act_eff);
                if armed {
                    let stop_line = hp * (1.0 - trailing_pct_eff);
                    if current_price <= stop_line {
                        return Some(close_signal(Side::Long, ts, "server_trailing_stop"));
                    }
                }
            }
            Side::Short => {
                let armed = trailing_act_eff <= 0.0
                    || lp <= pos.entry_price * (1.0 - trailing_act_eff);
                if armed {
                    let stop_line = lp * (1.0 + trailing_pct_eff);
                    if current_price >= stop_line {
                        return Some(close_signal(Side::Short, ts, "server_trailing_stop"));
                    }
                }
            }
        }
    }

    // 2) Fixed take-profit (only when trailing is out of the picture)
    if tp_eff > 0.0 {
        match pos.side {
            Side::Long => {
                if current_price >= pos.entry_price * (1.0 + tp_eff) {
                    return Some(close_signal(Side::Long, ts, "server_take_profit"));
                }
            }
            Side::Short => {
                if current_price <= pos.entry_price * (1.0 - tp_eff) {
                    return Some(close_signal(Side::Short, ts, "server_take_profit"));
                }
            }
        }
    }

    None
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn position(side: Side, entry: f64) -> Position {
        Position {
            id: 1,
            user_id: 1,
            strategy_id: 1,
            symbol: "BTC/USDT".to_string(),
            side,
            size: 5.0,
            entry_price: entry,
            current_price: entry,
            highest_price: 0.0,
            lowest_price: 0.0,
            updated_at: 0,
        }
    }

    #[test]
    fn ratio_accepts_both_scales() {
        assert!((to_ratio(0.02) - 0.02).abs() < 1e-12);
        assert!((to_ratio(2.0) - 0.02).abs() < 1e-12);
        assert!((to_ratio(-1.0)).abs() < 1e-12);
        assert!((to_ratio(150.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn stop_loss_threshold_divides_by_leverage() {
        // entry 100, sl 2% margin PnL, 2x leverage -> stop line 99.0
        let pos = position(Side::Long, 100.0);
        let mut cfg = TradingConfig::default();
        cfg.stop_loss_pct = 0.02;

        assert!(stop_loss_signal(&pos, 99.1, 2.0, &cfg, 60, 1_000).is_none());
        let sig = stop_loss_signal(&pos, 98.9, 2.0, &cfg, 60, 1_000).unwrap();
        assert_eq!(sig.signal_type, SignalType::CloseLong);
        assert_eq!(sig.reason.as_deref(), Some("server_stop_loss"));
        // timestamp is the open of the current candle
        assert_eq!(sig.timestamp, candle_open(1_000, 60));
    }

    #[test]
    fn stop_loss_symmetric_for_short() {
        let pos = position(Side::Short, 100.0);
        let mut cfg = TradingConfig::default();
        cfg.stop_loss_pct = 0.02;
        assert!(stop_loss_signal(&pos, 100.9, 2.0, &cfg, 60, 0).is_none());
        let sig = stop_loss_signal(&pos, 101.1, 2.0, &cfg, 60, 0).unwrap();
        assert_eq!(sig.signal_type, SignalType::CloseShort);
    }

    #[test]
    fn stop_loss_disabled_when_zero_or_switched_off() {
        let pos = position(Side::Long, 100.0);
        let cfg = TradingConfig::default(); // stop_loss_pct 0
        assert!(stop_loss_signal(&pos, 1.0, 1.0, &cfg, 60, 0).is_none());

        let mut cfg = TradingConfig::default();
        cfg.stop_loss_pct = 0.02;
        cfg.enable_server_side_stop_loss = false;
        assert!(stop_loss_signal(&pos, 1.0, 1.0, &cfg, 60, 0).is_none());
    }

    #[test]
    fn fixed_take_profit_fires_at_threshold() {
        let pos = position(Side::Long, 100.0);
        let mut cfg = TradingConfig::default();
        cfg.take_profit_pct = 0.1; // 10% margin / 5x -> 2% price move
        let (hp, lp) = tracked_extremes(&pos, 101.9);
        assert!(take_profit_or_trailing_signal(&pos, hp, lp, 101.9, 5.0, &cfg, 60, 0).is_none());
        let (hp, lp) = tracked_extremes(&pos, 102.0);
        let sig =
            take_profit_or_trailing_signal(&pos, hp, lp, 102.0, 5.0, &cfg, 60, 0).unwrap();
        assert_eq!(sig.reason.as_deref(), Some("server_take_profit"));
    }

    #[test]
    fn trailing_disables_fixed_take_profit() {
        let pos = position(Side::Long, 100.0);
        let mut cfg = TradingConfig::default();
        cfg.take_profit_pct = 0.01;
        cfg.trailing_enabled = true;
        cfg.trailing_stop_pct = 0.02;
        // Price above the fixed TP line but the trailing stop is not
        // armed/retraced: no exit fires.
        let hp = 101.5;
        let sig = take_profit_or_trailing_signal(&pos, hp, 100.0, 101.5, 1.0, &cfg, 60, 0);
        assert!(sig.is_none());
    }

    #[test]
    fn trailing_arms_then_fires_on_retracement() {
        let pos = position(Side::Long, 100.0);
        let mut cfg = TradingConfig::default();
        cfg.trailing_enabled = true;
        cfg.trailing_stop_pct = 0.02; // 2% retracement at 1x
        cfg.trailing_activation_pct = 0.05; // arm at +5%

        // Not armed: high watermark below activation.
        assert!(
            take_profit_or_trailing_signal(&pos, 104.0, 100.0, 102.0, 1.0, &cfg, 60, 0).is_none()
        );
        // Armed (hp 106), retracement beyond 2% of the high -> close.
        let sig =
            take_profit_or_trailing_signal(&pos, 106.0, 100.0, 103.8, 1.0, &cfg, 60, 0).unwrap();
        assert_eq!(sig.signal_type, SignalType::CloseLong);
        assert_eq!(sig.reason.as_deref(), Some("server_trailing_stop"));
        // Armed but inside the trailing band: no exit.
        assert!(
            take_profit_or_trailing_signal(&pos, 106.0, 100.0, 104.5, 1.0, &cfg, 60, 0).is_none()
        );
    }

    #[test]
    fn trailing_activation_falls_back_to_take_profit_pct() {
        let pos = position(Side::Long, 100.0);
        let mut cfg = TradingConfig::default();
        cfg.trailing_enabled = true;
        cfg.trailing_stop_pct = 0.02;
        cfg.take_profit_pct = 0.05; // doubles as activation

        // hp below the reused activation threshold: not armed.
        assert!(
            take_profit_or_trailing_signal(&pos, 104.0, 100.0, 101.0, 1.0, &cfg, 60, 0).is_none()
        );
        // hp beyond it: armed and retraced.
        assert!(
            take_profit_or_trailing_signal(&pos, 105.5, 100.0, 103.0, 1.0, &cfg, 60, 0).is_some()
        );
    }

    #[test]
    fn trailing_short_tracks_lowest_price() {
        let pos = position(Side::Short, 100.0);
        let mut cfg = TradingConfig::default();
        cfg.trailing_enabled = true;
        cfg.trailing_stop_pct = 0.02;
        cfg.trailing_activation_pct = 0.05;

        // lp 94 arms the stop; bounce above 94 * 1.02 = 95.88 closes.
        let sig =
            take_profit_or_trailing_signal(&pos, 100.0, 94.0, 96.0, 1.0, &cfg, 60, 0).unwrap();
        assert_eq!(sig.signal_type, SignalType::CloseShort);
    }

    #[test]
    fn extremes_seed_from_entry() {
        let pos = position(Side::Long, 100.0);
        let (hp, lp) = tracked_extremes(&pos, 99.0);
        assert!((hp - 100.0).abs() < f64::EPSILON);
        assert!((lp - 99.0).abs() < f64::EPSILON);

        let mut pos = position(Side::Long, 100.0);
        pos.highest_price = 110.0;
        pos.lowest_price = 95.0;
        let (hp, lp) = tracked_extremes(&pos, 111.0);
        assert!((hp - 111.0).abs() < f64::EPSILON);
        assert!((lp - 95.0).abs() < f64::EPSILON);
    }
}
