// =============================================================================
// Built-in evaluator — moving-average cross reference implementation
// =============================================================================
//
// Parses two parameters out of the script body (`fast=N`, `slow=M`) and
// emits {buy, sell} on SMA crossovers. It exists so the engine runs end to
// end without an external scripting backend and doubles as the fixture for
// runner tests.
// =============================================================================

use anyhow::{bail, Result};

use crate::indicator::{AnnotatedFrame, IndicatorEvaluator, InitialState};
use crate::market::Frame;
use crate::store::strategies::TradingConfig;

pub struct MaCrossEvaluator;

impl MaCrossEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MaCrossEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract `key=<usize>` from the script body.
fn parse_param(code: &str, key: &str, default: usize) -> usize {
    for line in code.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(key) {
            let rest = rest.trim_start();
            if let Some(value) = rest.strip_prefix('=') {
                if let Ok(v) = value.trim().parse::<usize>() {
                    if v > 0 {
                        return v;
                    }
                }
            }
        }
    }
    default
}

fn sma(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period {
        return out;
    }
    let mut sum: f64 = closes[..period].iter().sum();
    out[period - 1] = Some(sum / period as f64);
    for i in period..closes.len() {
        sum += closes[i] - closes[i - period];
        out[i] = Some(sum / period as f64);
    }
    out
}

impl IndicatorEvaluator for MaCrossEvaluator {
    fn evaluate(
        &self,
        code: &str,
        frame: &Frame,
        _cfg: &TradingConfig,
        init: &InitialState,
    ) -> Result<AnnotatedFrame> {
        if frame.is_empty() {
            bail!("empty frame");
        }
        let fast_period = parse_param(code, "fast", 5);
        let slow_period = parse_param(code, "slow", 20);
        if fast_period >= slow_period {
            bail!("fast period must be below slow period (fast={fast_period}, slow={slow_period})");
        }

        let closes = frame.closes();
        let fast = sma(&closes, fast_period);
        let slow = sma(&closes, slow_period);

        let n = closes.len();
        let mut buy = vec![false; n];
        let mut sell = vec![false; n];
        for i in 1..n {
            let (Some(f0), Some(s0), Some(f1), Some(s1)) =
                (fast[i - 1], slow[i - 1], fast[i], slow[i])
            else {
                continue;
            };
            if f0 <= s0 && f1 > s1 {
                buy[i] = true;
            } else if f0 >= s0 && f1 < s1 {
                sell[i] = true;
            }
        }

        let mut annotated = AnnotatedFrame::from_candles(frame.candles.clone());
        annotated.buy = Some(buy);
        annotated.sell = Some(sell);
        // Trailing high only advances while a position is held.
        annotated.highest_price = if init.position != 0 {
            init.highest_price.max(*closes.last().unwrap_or(&0.0))
        } else {
            0.0
        };
        Ok(annotated)
    }
}
