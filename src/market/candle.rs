// =============================================================================
// Candle & Frame — OHLCV bars and the rolling window the indicator sees
// =============================================================================
//
// All candle timestamps are UTC epoch seconds aligned to the timeframe
// boundary. The last bar of a frame may be in-progress; between full
// refetches the runner slides it forward with the latest traded price.
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time, UTC epoch seconds.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Duration of a timeframe in seconds. Unknown strings fall back to 1h,
/// matching the historical behavior of the candle pipeline.
pub fn timeframe_seconds(timeframe: &str) -> i64 {
    match timeframe.trim().to_lowercase().as_str() {
        "1m" => 60,
        "3m" => 180,
        "5m" => 300,
        "15m" => 900,
        "30m" => 1800,
        "1h" => 3600,
        "2h" => 7200,
        "4h" => 14400,
        "6h" => 21600,
        "8h" => 28800,
        "12h" => 43200,
        "1d" => 86400,
        "3d" => 259200,
        "1w" => 604800,
        _ => 3600,
    }
}

/// A rolling window of candles, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub candles: Vec<Candle>,
}

impl Frame {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self { candles }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    /// Fold the latest traded price into the frame without refetching.
    ///
    /// * If the last bar covers the current period, its close becomes the
    ///   price and high/low stretch to include it; volume is untouched.
    /// * If the current period started after the last bar, a fresh bar is
    ///   appended with OHLC = price and zero volume.
    pub fn update_with_price(&mut self, price: f64, now_ts: i64, tf_seconds: i64) {
        if self.candles.is_empty() || price <= 0.0 || tf_seconds <= 0 {
            return;
        }
        let period_start = (now_ts / tf_seconds) * tf_seconds;
        let last = self.candles.last_mut().expect("frame not empty");

        if (last.open_time - period_start).abs() < 2 {
            last.close = price;
            last.high = last.high.max(price);
            last.low = last.low.min(price);
        } else if period_start > last.open_time {
            self.candles
                .push(Candle::new(period_start, price, price, price, price, 0.0));
        }
    }
}
