// =============================================================================
// Indicator boundary — annotated frames, normalization, signal extraction
// =============================================================================
//
// The evaluator is a capability: it takes the candle frame plus the
// strategy's current position state and returns the frame annotated with
// boolean signal columns. Scripts may emit either the simple {buy, sell}
// pair or the full 4-way set; normalization maps the simple pair onto the
// 4-way engine before the extraction sweep runs.
// =============================================================================

pub mod builtin;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::market::{Candle, Frame};
use crate::store::strategies::{SignalMode, TradingConfig};
use crate::types::{SignalType, TradeDirection};

/// Default capital ratio for open signals without an explicit size.
const DEFAULT_OPEN_SIZE: f64 = 0.08;
/// Default capital ratio for scale-in signals without an explicit size.
const DEFAULT_ADD_SIZE: f64 = 0.06;
/// Default reduce ratio when neither reduce_size nor position_size is set.
const DEFAULT_REDUCE_SIZE: f64 = 0.1;

/// Position state injected into the evaluator so stateful scripts resume
/// correctly across recomputes and restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitialState {
    pub highest_price: f64,
    /// -1 short, 0 flat, 1 long.
    pub position: i8,
    pub avg_entry_price: f64,
    pub position_count: i64,
    pub last_add_price: f64,
}

/// The evaluator's output: the input candles plus per-bar signal columns.
/// A column that is `None` was not produced by the script.
#[derive(Debug, Clone, Default)]
pub struct AnnotatedFrame {
    pub candles: Vec<Candle>,
    pub buy: Option<Vec<bool>>,
    pub sell: Option<Vec<bool>>,
    pub open_long: Option<Vec<bool>>,
    pub close_long: Option<Vec<bool>>,
    pub open_short: Option<Vec<bool>>,
    pub close_short: Option<Vec<bool>>,
    pub add_long: Option<Vec<bool>>,
    pub add_short: Option<Vec<bool>>,
    pub reduce_long: Option<Vec<bool>>,
    pub reduce_short: Option<Vec<bool>>,
    pub position_size: Option<Vec<f64>>,
    pub reduce_size: Option<Vec<f64>>,
    /// Updated trailing high maintained by the script (0 when untracked).
    pub highest_price: f64,
}

/// A discrete intent waiting for its trigger condition.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSignal {
    pub signal_type: SignalType,
    /// Reference price for trigger checks; 0 means fire unconditionally.
    pub trigger_price: f64,
    /// Capital ratio for entries, reduce ratio for reduce signals.
    pub position_size: f64,
    /// Open time of the candle that produced the signal.
    pub timestamp: i64,
    /// Set for server-side risk exits (e.g. "server_stop_loss").
    pub reason: Option<String>,
}

/// Capability trait for indicator execution. Implementations may wrap a
/// scripting VM, precompiled plugins, or the bundled evaluator.
pub trait IndicatorEvaluator: Send + Sync {
    fn evaluate(
        &self,
        code: &str,
        frame: &Frame,
        cfg: &TradingConfig,
        init: &InitialState,
    ) -> Result<AnnotatedFrame>;
}

impl AnnotatedFrame {
    pub fn from_candles(candles: Vec<Candle>) -> Self {
        Self {
            candles,
            ..Default::default()
        }
    }

    fn flag(col: &Option<Vec<bool>>, idx: usize) -> bool {
        col.as_ref().map_or(false, |v| v.get(idx).copied().unwrap_or(false))
    }

    fn value(col: &Option<Vec<f64>>, idx: usize) -> f64 {
        col.as_ref().map_or(0.0, |v| v.get(idx).copied().unwrap_or(0.0))
    }

    pub fn has_four_way(&self) -> bool {
        self.open_long.is_some()
            && self.close_long.is_some()
            && self.open_short.is_some()
            && self.close_short.is_some()
    }

    pub fn has_buy_sell(&self) -> bool {
        self.buy.is_some() && self.sell.is_some()
    }

    /// Map a simple {buy, sell} script output onto the 4-way columns
    /// according to the strategy's trade direction. Applied only when the
    /// script did not provide the 4-way set itself.
    pub fn normalize_directions(&mut self, direction: TradeDirection) {
        if self.has_four_way() || !self.has_buy_sell() {
            return;
        }
        let buy = self.buy.clone().unwrap_or_default();
        let sell = self.sell.clone().unwrap_or_default();
        let none = vec![false; self.candles.len()];

        match direction {
            TradeDirection::Long => {
                self.open_long = Some(buy);
                self.close_long = Some(sell);
                self.open_short = Some(none.clone());
                self.close_short = Some(none);
            }
            TradeDirection::Short => {
                self.open_short = Some(sell);
                self.close_short = Some(buy);
                self.open_long = Some(none.clone());
                self.close_long = Some(none);
            }
            TradeDirection::Both => {
                self.open_long = Some(buy.clone());
                self.close_short = Some(buy);
                self.open_short = Some(sell.clone());
                self.close_long = Some(sell);
            }
        }
    }
}

/// Sweep the annotated frame for pending signals.
///
/// The last closed candle (index n-2) is always inspected; the forming
/// candle (n-1) joins the entry sweep in aggressive signal mode and the
/// exit sweep in aggressive exit mode. Duplicate (type, timestamp) pairs
/// within one sweep are dropped.
pub fn extract_signals(
    frame: &AnnotatedFrame,
    signal_mode: SignalMode,
    exit_signal_mode: SignalMode,
) -> Vec<PendingSignal> {
    let n = frame.candles.len();
    if n == 0 || !frame.has_four_way() {
        return Vec::new();
    }

    let mut entry_set = Vec::new();
    let mut exit_set = Vec::new();
    if n > 1 {
        entry_set.push(n - 2);
        exit_set.push(n - 2);
    }
    if signal_mode == SignalMode::Aggressive {
        entry_set.push(n - 1);
    }
    if exit_signal_mode == SignalMode::Aggressive {
        exit_set.push(n - 1);
    }

    let mut indices: Vec<usize> = entry_set.iter().chain(exit_set.iter()).copied().collect();
    indices.sort_unstable();
    indices.dedup();
    indices.reverse();

    let mut signals: Vec<PendingSignal> = Vec::new();
    let push_unique = |signals: &mut Vec<PendingSignal>, sig: PendingSignal| {
        let dup = signals
            .iter()
            .any(|s| s.signal_type == sig.signal_type && s.timestamp == sig.timestamp);
        if !dup {
            signals.push(sig);
        }
    };

    for idx in indices {
        let close = frame.candles[idx].close;
        let ts = frame.candles[idx].open_time;
        let in_entry = entry_set.contains(&idx);
        let in_exit = exit_set.contains(&idx);

        let sized = |default: f64, idx: usize| {
            let v = AnnotatedFrame::value(&frame.position_size, idx);
            if v > 0.0 {
                v
            } else {
                default
            }
        };
        // reduce_size falls back to position_size, then the fixed default.
        let reduce_sized = |idx: usize| {
            let mut v = AnnotatedFrame::value(&frame.reduce_size, idx);
            if v <= 0.0 {
                v = AnnotatedFrame::value(&frame.position_size, idx);
            }
            if v <= 0.0 {
                v = DEFAULT_REDUCE_SIZE;
            }
            v
        };

        if in_entry && AnnotatedFrame::flag(&frame.open_long, idx) {
            push_unique(
                &mut signals,
                PendingSignal {
                    signal_type: SignalType::OpenLong,
                    trigger_price: close,
                    position_size: sized(DEFAULT_OPEN_SIZE, idx),
                    timestamp: ts,
                    reason: None,
                },
            );
        }
        if in_exit && AnnotatedFrame::flag(&frame.close_long, idx) {
            push_unique(
                &mut signals,
                PendingSignal {
                    signal_type: SignalType::CloseLong,
                    trigger_price: close,
                    position_size: 0.0,
                    timestamp: ts,
                    reason: None,
                },
            );
        }
        if in_entry && AnnotatedFrame::flag(&frame.open_short, idx) {
            push_unique(
                &mut signals,
                PendingSignal {
                    signal_type: SignalType::OpenShort,
                    trigger_price: close,
                    position_size: sized(DEFAULT_OPEN_SIZE, idx),
                    timestamp: ts,
                    reason: None,
                },
            );
        }
        if in_exit && AnnotatedFrame::flag(&frame.close_short, idx) {
            push_unique(
                &mut signals,
                PendingSignal {
                    signal_type: SignalType::CloseShort,
                    trigger_price: close,
                    position_size: 0.0,
                    timestamp: ts,
                    reason: None,
                },
            );
        }
        if in_entry && AnnotatedFrame::flag(&frame.add_long, idx) {
            push_unique(
                &mut signals,
                PendingSignal {
                    signal_type: SignalType::AddLong,
                    trigger_price: close,
                    position_size: sized(DEFAULT_ADD_SIZE, idx),
                    timestamp: ts,
                    reason: None,
                },
            );
        }
        if in_entry && AnnotatedFrame::flag(&frame.add_short, idx) {
            push_unique(
                &mut signals,
                PendingSignal {
                    signal_type: SignalType::AddShort,
                    trigger_price: close,
                    position_size: sized(DEFAULT_ADD_SIZE, idx),
                    timestamp: ts,
                    reason: None,
                },
            );
        }
        if in_exit && AnnotatedFrame::flag(&frame.reduce_long, idx) {
            push_unique(
                &mut signals,
                PendingSignal {
                    signal_type: SignalType::ReduceLong,
                    trigger_price: close,
                    position_size: reduce_sized(idx),
                    timestamp: ts,
                    reason: None,
                },
            );
        }
        if in_exit && AnnotatedFrame::flag(&frame.reduce_short, idx) {
            push_unique(
                &mut signals,
                PendingSignal {
                    signal_type: SignalType::ReduceShort,
                    trigger_price: close,
                    position_size: reduce_sized(idx),
                    timestamp: ts,
                    reason: None,
                },
            );
        }
    }

    signals
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let p = 100.0 + i as f64;
                Candle::new(i as i64 * 60, p, p + 1.0, p - 1.0, p, 10.0)
            })
            .collect()
    }

    fn col(n: usize, set: &[usize]) -> Option<Vec<bool>> {
        let mut v = vec![false; n];
        for &i in set {
            v[i] = true;
        }
        Some(v)
    }

    #[test]
    fn buy_sell_normalization_long_only() {
        let mut frame = AnnotatedFrame::from_candles(candles(4));
        frame.buy = col(4, &[2]);
        frame.sell = col(4, &[3]);
        frame.normalize_directions(TradeDirection::Long);
        assert!(frame.has_four_way());
        assert!(AnnotatedFrame::flag(&frame.open_long, 2));
        assert!(AnnotatedFrame::flag(&frame.close_long, 3));
        assert!(!AnnotatedFrame::flag(&frame.open_short, 3));
        assert!(!AnnotatedFrame::flag(&frame.close_short, 2));
    }

    #[test]
    fn buy_sell_normalization_both_directions() {
        let mut frame = AnnotatedFrame::from_candles(candles(4));
        frame.buy = col(4, &[2]);
        frame.sell = col(4, &[3]);
        frame.normalize_directions(TradeDirection::Both);
        // buy maps to open_long + close_short, sell to open_short + close_long
        assert!(AnnotatedFrame::flag(&frame.open_long, 2));
        assert!(AnnotatedFrame::flag(&frame.close_short, 2));
        assert!(AnnotatedFrame::flag(&frame.open_short, 3));
        assert!(AnnotatedFrame::flag(&frame.close_long, 3));
    }

    #[test]
    fn normalization_does_not_override_four_way_scripts() {
        let mut frame = AnnotatedFrame::from_candles(candles(4));
        frame.buy = col(4, &[1]);
        frame.sell = col(4, &[1]);
        frame.open_long = col(4, &[2]);
        frame.close_long = col(4, &[]);
        frame.open_short = col(4, &[]);
        frame.close_short = col(4, &[]);
        frame.normalize_directions(TradeDirection::Both);
        // the explicit 4-way columns stay untouched
        assert!(AnnotatedFrame::flag(&frame.open_long, 2));
        assert!(!AnnotatedFrame::flag(&frame.open_long, 1));
    }

    #[test]
    fn confirmed_mode_only_reads_closed_candle() {
        let n = 5;
        let mut frame = AnnotatedFrame::from_candles(candles(n));
        frame.open_long = col(n, &[n - 1]); // only on the forming candle
        frame.close_long = col(n, &[]);
        frame.open_short = col(n, &[]);
        frame.close_short = col(n, &[]);

        let sigs = extract_signals(&frame, SignalMode::Confirmed, SignalMode::Confirmed);
        assert!(sigs.is_empty());

        let sigs = extract_signals(&frame, SignalMode::Aggressive, SignalMode::Confirmed);
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].signal_type, SignalType::OpenLong);
        assert_eq!(sigs[0].timestamp, (n as i64 - 1) * 60);
    }

    #[test]
    fn aggressive_exit_reads_forming_candle() {
        let n = 5;
        let mut frame = AnnotatedFrame::from_candles(candles(n));
        frame.open_long = col(n, &[]);
        frame.close_long = col(n, &[n - 1]);
        frame.open_short = col(n, &[]);
        frame.close_short = col(n, &[]);

        let sigs = extract_signals(&frame, SignalMode::Confirmed, SignalMode::Aggressive);
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].signal_type, SignalType::CloseLong);
        // exits carry no size
        assert!((sigs[0].position_size).abs() < f64::EPSILON);
    }

    #[test]
    fn open_signal_uses_default_size_when_column_missing() {
        let n = 4;
        let mut frame = AnnotatedFrame::from_candles(candles(n));
        frame.open_long = col(n, &[n - 2]);
        frame.close_long = col(n, &[]);
        frame.open_short = col(n, &[]);
        frame.close_short = col(n, &[]);

        let sigs = extract_signals(&frame, SignalMode::Confirmed, SignalMode::Confirmed);
        assert_eq!(sigs.len(), 1);
        assert!((sigs[0].position_size - 0.08).abs() < f64::EPSILON);
        // trigger price is the close of the signal bar
        assert!((sigs[0].trigger_price - frame.candles[n - 2].close).abs() < f64::EPSILON);
    }

    #[test]
    fn reduce_size_fallback_order() {
        let n = 4;
        let mk = |reduce_size: Option<Vec<f64>>, position_size: Option<Vec<f64>>| {
            let mut frame = AnnotatedFrame::from_candles(candles(n));
            frame.open_long = col(n, &[]);
            frame.close_long = col(n, &[]);
            frame.open_short = col(n, &[]);
            frame.close_short = col(n, &[]);
            frame.reduce_long = col(n, &[n - 2]);
            frame.reduce_size = reduce_size;
            frame.position_size = position_size;
            extract_signals(&frame, SignalMode::Confirmed, SignalMode::Confirmed)
        };

        // reduce_size wins when present
        let sigs = mk(Some(vec![0.25; n]), Some(vec![0.5; n]));
        assert!((sigs[0].position_size - 0.25).abs() < f64::EPSILON);
        // falls back to position_size
        let sigs = mk(None, Some(vec![0.5; n]));
        assert!((sigs[0].position_size - 0.5).abs() < f64::EPSILON);
        // then to the fixed default
        let sigs = mk(None, None);
        assert!((sigs[0].position_size - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn duplicate_type_timestamp_collapsed() {
        let n = 3;
        let mut frame = AnnotatedFrame::from_candles(candles(n));
        // same signal visible from both sweeps of the same bar
        frame.open_long = col(n, &[n - 2]);
        frame.close_long = col(n, &[]);
        frame.open_short = col(n, &[]);
        frame.close_short = col(n, &[]);
        let sigs = extract_signals(&frame, SignalMode::Aggressive, SignalMode::Aggressive);
        assert_eq!(sigs.len(), 1);
    }
}
