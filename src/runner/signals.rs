// =============================================================================
// Signal engine — expiration, trigger filter, de-dup, and selection
// =============================================================================
//
// Each tick the runner turns candidate signals into at most one order
// intent: expired signals are dropped, price triggers are checked, the
// strict state machine filters out anything that does not match the
// current position, and the per-candle de-dup map suppresses repeats.
// =============================================================================

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::indicator::PendingSignal;
use crate::store::strategies::{TradingConfig, TriggerMode};
use crate::types::{normalize_symbol, PositionState, TradeDirection};

/// Per-runner signal de-dup map. Keys are
/// `(strategy_id, normalized symbol, signal type, candle timestamp)`; the
/// TTL covers at least the following candle so a confirmed signal cannot
/// re-enqueue on every tick of the next bar.
#[derive(Debug, Default)]
pub struct SignalDedup {
    entries: HashMap<String, i64>,
}

impl SignalDedup {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(strategy_id: i64, symbol: &str, signal_type: &str, signal_ts: i64) -> String {
        format!(
            "{strategy_id}|{}|{}|{signal_ts}",
            normalize_symbol(symbol),
            signal_type.trim().to_lowercase()
        )
    }

    /// Returns true when this signal already fired within its TTL window.
    /// A false return reserves the key: the caller is expected to proceed
    /// with the enqueue attempt.
    pub fn should_skip(
        &mut self,
        strategy_id: i64,
        symbol: &str,
        signal_type: &str,
        signal_ts: i64,
        timeframe_seconds: i64,
        now: i64,
    ) -> bool {
        let tf = if timeframe_seconds > 0 { timeframe_seconds } else { 60 };
        let ttl = (tf * 2).max(120);
        let key = Self::key(strategy_id, symbol, signal_type, signal_ts);

        // Opportunistic cleanup keeps the map bounded.
        self.entries.retain(|_, expiry| *expiry > now);

        if let Some(expiry) = self.entries.get(&key) {
            if *expiry > now {
                return true;
            }
        }
        self.entries.insert(key, now + ttl);
        false
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Drop signals older than two full candle periods. Signals with a zero
/// timestamp (server-side exits use the current candle) never expire here.
pub fn expire_signals(
    signals: &mut Vec<PendingSignal>,
    now: i64,
    timeframe_seconds: i64,
) {
    let threshold = timeframe_seconds * 2;
    signals.retain(|s| {
        let keep = s.timestamp == 0 || now - s.timestamp < threshold;
        if !keep {
            warn!(signal = %s.signal_type, timestamp = s.timestamp, "signal expired and removed");
        }
        keep
    });
}

/// Whether a pending signal's trigger condition is met at the current
/// price.
///
/// Exits fire unconditionally in immediate exit mode; entries fire
/// unconditionally in immediate entry mode. In price mode, buy-like
/// signals need the price at or above the trigger and sell-like signals
/// at or below. A non-positive trigger price always fires.
pub fn is_triggered(signal: &PendingSignal, current_price: f64, cfg: &TradingConfig) -> bool {
    let sig = signal.signal_type;
    if sig.is_exit() && cfg.exit_trigger_mode == TriggerMode::Immediate {
        return true;
    }
    if sig.is_entry() && cfg.entry_trigger_mode == TriggerMode::Immediate {
        return true;
    }
    if signal.trigger_price <= 0.0 {
        return true;
    }
    if sig.is_buy_like() {
        current_price >= signal.trigger_price
    } else {
        current_price <= signal.trigger_price
    }
}

/// Pick at most one signal to execute this tick.
///
/// Filters candidates through the state machine, breaks a flat-state
/// two-direction tie with `trade_direction`, sorts by (priority,
/// timestamp, type), and returns the first candidate the de-dup map
/// accepts.
#[allow(clippy::too_many_arguments)]
pub fn select_signal(
    candidates: Vec<PendingSignal>,
    state: PositionState,
    trade_direction: TradeDirection,
    dedup: &mut SignalDedup,
    strategy_id: i64,
    symbol: &str,
    timeframe_seconds: i64,
    now: i64,
) -> Option<PendingSignal> {
    let mut allowed: Vec<PendingSignal> = candidates
        .into_iter()
        .filter(|s| s.signal_type.allowed_in(state))
        .collect();

    // From flat with both open directions as candidates, the configured
    // direction decides deterministically.
    if state == PositionState::Flat {
        match trade_direction {
            TradeDirection::Long => {
                allowed.retain(|s| s.signal_type == crate::types::SignalType::OpenLong)
            }
            TradeDirection::Short => {
                allowed.retain(|s| s.signal_type == crate::types::SignalType::OpenShort)
            }
            TradeDirection::Both => {}
        }
    }

    allowed.sort_by(|a, b| {
        a.signal_type
            .priority()
            .cmp(&b.signal_type.priority())
            .then(a.timestamp.cmp(&b.timestamp))
            .then(a.signal_type.as_str().cmp(b.signal_type.as_str()))
    });

    for candidate in allowed {
        if dedup.should_skip(
            strategy_id,
            symbol,
            candidate.signal_type.as_str(),
            candidate.timestamp,
            timeframe_seconds,
            now,
        ) {
            debug!(
                strategy_id,
                signal = %candidate.signal_type,
                timestamp = candidate.timestamp,
                "signal suppressed by de-dup"
            );
            continue;
        }
        return Some(candidate);
    }
    None
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalType;

    fn sig(signal_type: SignalType, trigger_price: f64, timestamp: i64) -> PendingSignal {
        PendingSignal {
            signal_type,
            trigger_price,
            position_size: 0.1,
            timestamp,
            reason: None,
        }
    }

    fn cfg() -> TradingConfig {
        TradingConfig::default()
    }

    #[test]
    fn dedup_suppresses_repeat_within_ttl() {
        let mut dedup = SignalDedup::new();
        assert!(!dedup.should_skip(1, "BTC/USDT", "open_long", 1000, 60, 2000));
        assert!(dedup.should_skip(1, "BTC/USDT", "open_long", 1000, 60, 2001));
        // Same signal on a different candle is a different key.
        assert!(!dedup.should_skip(1, "BTC/USDT", "open_long", 1060, 60, 2002));
        // TTL is at least 120s even on tiny timeframes.
        assert!(dedup.should_skip(1, "BTC/USDT", "open_long", 1000, 60, 2119));
    }

    #[test]
    fn dedup_normalizes_contract_suffix() {
        let mut dedup = SignalDedup::new();
        assert!(!dedup.should_skip(1, "BNB/USDT:USDT", "close_long", 500, 60, 1000));
        assert!(dedup.should_skip(1, "bnb/usdt", "close_long", 500, 60, 1001));
    }

    #[test]
    fn dedup_cleanup_bounds_the_map() {
        let mut dedup = SignalDedup::new();
        assert!(!dedup.should_skip(1, "A", "open_long", 1, 60, 0));
        assert!(!dedup.should_skip(1, "B", "open_long", 2, 60, 0));
        // Both expired at t=10_000; only the fresh key remains after.
        assert!(!dedup.should_skip(1, "C", "open_long", 3, 60, 10_000));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn expiration_drops_stale_signals_only() {
        let tf = 3600;
        let now = 100_000;
        let mut signals = vec![
            sig(SignalType::OpenLong, 100.0, now - tf),       // fresh
            sig(SignalType::CloseLong, 100.0, now - 3 * tf),  // stale
            sig(SignalType::CloseShort, 0.0, 0),              // ts 0: kept
        ];
        expire_signals(&mut signals, now, tf);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].signal_type, SignalType::OpenLong);
        assert_eq!(signals[1].signal_type, SignalType::CloseShort);
    }

    #[test]
    fn exit_immediate_fires_without_price_confirmation() {
        let cfg = cfg();
        // close below its trigger still fires in immediate exit mode
        assert!(is_triggered(&sig(SignalType::CloseLong, 200.0, 0), 100.0, &cfg));
        assert!(is_triggered(&sig(SignalType::ReduceLong, 200.0, 0), 100.0, &cfg));
    }

    #[test]
    fn entry_price_mode_requires_cross() {
        let cfg = cfg();
        let open = sig(SignalType::OpenLong, 100.0, 0);
        assert!(!is_triggered(&open, 99.9, &cfg));
        assert!(is_triggered(&open, 100.0, &cfg));
        let short = sig(SignalType::OpenShort, 100.0, 0);
        assert!(!is_triggered(&short, 100.1, &cfg));
        assert!(is_triggered(&short, 99.9, &cfg));
    }

    #[test]
    fn trigger_modes_invert_for_testability() {
        let mut cfg = cfg();
        cfg.entry_trigger_mode = TriggerMode::Immediate;
        cfg.exit_trigger_mode = TriggerMode::Price;
        // entries now fire unconditionally
        assert!(is_triggered(&sig(SignalType::OpenLong, 100.0, 0), 1.0, &cfg));
        // exits now need the price cross (close_long is sell-like)
        assert!(!is_triggered(&sig(SignalType::CloseLong, 100.0, 0), 100.1, &cfg));
        assert!(is_triggered(&sig(SignalType::CloseLong, 100.0, 0), 99.9, &cfg));
    }

    #[test]
    fn selection_prefers_close_over_open() {
        let mut dedup = SignalDedup::new();
        let picked = select_signal(
            vec![
                sig(SignalType::AddLong, 0.0, 10),
                sig(SignalType::CloseLong, 0.0, 20),
                sig(SignalType::ReduceLong, 0.0, 5),
            ],
            PositionState::Long,
            TradeDirection::Both,
            &mut dedup,
            1,
            "BTC/USDT",
            60,
            1000,
        )
        .unwrap();
        assert_eq!(picked.signal_type, SignalType::CloseLong);
    }

    #[test]
    fn selection_rejects_state_mismatches() {
        let mut dedup = SignalDedup::new();
        // open_long while already long: nothing survives
        let picked = select_signal(
            vec![sig(SignalType::OpenLong, 0.0, 10)],
            PositionState::Long,
            TradeDirection::Both,
            &mut dedup,
            1,
            "BTC/USDT",
            60,
            1000,
        );
        assert!(picked.is_none());
    }

    #[test]
    fn flat_two_direction_tie_broken_by_trade_direction() {
        let mut dedup = SignalDedup::new();
        let candidates = vec![
            sig(SignalType::OpenLong, 0.0, 10),
            sig(SignalType::OpenShort, 0.0, 10),
        ];
        let picked = select_signal(
            candidates.clone(),
            PositionState::Flat,
            TradeDirection::Short,
            &mut dedup,
            1,
            "ETH/USDT",
            60,
            1000,
        )
        .unwrap();
        assert_eq!(picked.signal_type, SignalType::OpenShort);

        // In both mode the earlier timestamp then lexicographic type wins.
        let mut dedup = SignalDedup::new();
        let picked = select_signal(
            candidates,
            PositionState::Flat,
            TradeDirection::Both,
            &mut dedup,
            2,
            "ETH/USDT",
            60,
            1000,
        )
        .unwrap();
        assert_eq!(picked.signal_type, SignalType::OpenLong);
    }

    #[test]
    fn dedup_falls_through_to_next_candidate() {
        let mut dedup = SignalDedup::new();
        // Burn the close_long key first.
        assert!(!dedup.should_skip(1, "BTC/USDT", "close_long", 20, 60, 1000));
        let picked = select_signal(
            vec![
                sig(SignalType::CloseLong, 0.0, 20),
                sig(SignalType::ReduceLong, 0.0, 20),
            ],
            PositionState::Long,
            TradeDirection::Both,
            &mut dedup,
            1,
            "BTC/USDT",
            60,
            1000,
        )
        .unwrap();
        assert_eq!(picked.signal_type, SignalType::ReduceLong);
    }
}
