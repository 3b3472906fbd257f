// =============================================================================
// KlineSource — candle history provider
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::market::candle::Candle;
use crate::types::MarketCategory;

/// Capability for fetching candle history. The bundled implementation talks
/// to the Binance public REST API; other providers plug in behind the same
/// trait.
#[async_trait]
pub trait KlineSource: Send + Sync {
    async fn fetch(
        &self,
        market: MarketCategory,
        symbol: &str,
        timeframe: &str,
        limit: u32,
        before_ts: i64,
    ) -> Result<Vec<Candle>>;
}

/// Binance public klines endpoint (no signature required).
pub struct BinanceKlineSource {
    base_url: String,
    client: reqwest::Client,
}

impl BinanceKlineSource {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: "https://api.binance.com".to_string(),
            client,
        }
    }

}

impl Default for BinanceKlineSource {
    fn default() -> Self {
        Self::new()
    }
}

/// `BTC/USDT` (optionally with a `:USDT` contract suffix) -> `BTCUSDT`.
fn to_binance_symbol(symbol: &str) -> String {
    let head = symbol.split(':').next().unwrap_or(symbol);
    head.replace('/', "").trim().to_uppercase()
}

#[async_trait]
impl KlineSource for BinanceKlineSource {
    async fn fetch(
        &self,
        _market: MarketCategory,
        symbol: &str,
        timeframe: &str,
        limit: u32,
        before_ts: i64,
    ) -> Result<Vec<Candle>> {
        let interval = timeframe.trim().to_lowercase();
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}&endTime={}",
            self.base_url,
            to_binance_symbol(symbol),
            interval,
            limit,
            before_ts * 1000,
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {}: {}", status, body);
        }

        let raw = body.as_array().context("klines response is not an array")?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 6 => a,
                _ => continue,
            };
            let open_time_ms = arr[0].as_i64().unwrap_or(0);
            let open = parse_str_f64(&arr[1])?;
            let high = parse_str_f64(&arr[2])?;
            let low = parse_str_f64(&arr[3])?;
            let close = parse_str_f64(&arr[4])?;
            let volume = parse_str_f64(&arr[5])?;
            candles.push(Candle::new(open_time_ms / 1000, open, high, low, close, volume));
        }

        debug!(symbol, interval = %interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }
}

/// Binance sends numeric values as JSON strings inside kline arrays.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}
