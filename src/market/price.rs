// =============================================================================
// Price feed — latest-price source behind a shared TTL cache
// =============================================================================
//
// Many runners may watch the same symbol. The cache collapses their ticks
// onto one upstream request per TTL window; the critical section only
// covers the map lookup, never the HTTP call.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

/// Capability for fetching the latest traded price of a symbol.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn ticker(&self, symbol: &str) -> Result<f64>;
}

/// Shared per-symbol price cache with a fixed TTL.
pub struct PriceCache {
    entries: Mutex<HashMap<String, (f64, Instant)>>,
    ttl: Duration,
}

impl PriceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        let key = symbol.trim().to_uppercase();
        let mut map = self.entries.lock();
        match map.get(&key) {
            Some((price, expiry)) if *expiry > Instant::now() => Some(*price),
            Some(_) => {
                map.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, symbol: &str, price: f64) {
        if self.ttl.is_zero() {
            return;
        }
        let key = symbol.trim().to_uppercase();
        self.entries
            .lock()
            .insert(key, (price, Instant::now() + self.ttl));
    }
}

/// A price source wrapped with the shared cache.
pub struct PriceFeed {
    cache: PriceCache,
    source: Arc<dyn PriceSource>,
}

impl PriceFeed {
    pub fn new(source: Arc<dyn PriceSource>, ttl: Duration) -> Self {
        Self {
            cache: PriceCache::new(ttl),
            source,
        }
    }

    /// Latest price for a symbol, served from the cache within TTL.
    pub async fn latest(&self, symbol: &str) -> Result<f64> {
        if let Some(price) = self.cache.get(symbol) {
            return Ok(price);
        }
        let price = self.source.ticker(symbol).await?;
        if price > 0.0 {
            self.cache.insert(symbol, price);
        }
        Ok(price)
    }
}

/// Binance public ticker endpoint.
pub struct BinanceTickerSource {
    base_url: String,
    client: reqwest::Client,
}

impl BinanceTickerSource {
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

impl Default for BinanceTickerSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceSource for BinanceTickerSource {
    async fn ticker(&self, symbol: &str) -> Result<f64> {
        let pair = symbol
            .split(':')
            .next()
            .unwrap_or(symbol)
            .replace('/', "")
            .to_uppercase();
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, pair);

        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/ticker/price request failed")?
            .json()
            .await
            .context("failed to parse ticker response")?;

        let price: f64 = body["price"]
            .as_str()
            .context("ticker response missing 'price'")?
            .parse()
            .context("ticker price is not a number")?;

        debug!(symbol, price, "ticker fetched");
        Ok(price)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_within_ttl() {
        let cache = PriceCache::new(Duration::from_secs(60));
        cache.insert("btc/usdt", 50_000.0);
        assert_eq!(cache.get("BTC/USDT"), Some(50_000.0));
    }

    #[test]
    fn cache_miss_after_expiry() {
        let cache = PriceCache::new(Duration::from_millis(1));
        cache.insert("BTC/USDT", 50_000.0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("BTC/USDT"), None);
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let cache = PriceCache::new(Duration::ZERO);
        cache.insert("BTC/USDT", 50_000.0);
        assert_eq!(cache.get("BTC/USDT"), None);
    }

    #[tokio::test]
    async fn feed_serves_from_cache() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct CountingSource(AtomicU32);

        #[async_trait]
        impl PriceSource for CountingSource {
            async fn ticker(&self, _symbol: &str) -> Result<f64> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(123.0)
            }
        }

        let source = Arc::new(CountingSource(AtomicU32::new(0)));
        let feed = PriceFeed::new(source.clone(), Duration::from_secs(60));

        assert!((feed.latest("ETH/USDT").await.unwrap() - 123.0).abs() < f64::EPSILON);
        assert!((feed.latest("ETH/USDT").await.unwrap() - 123.0).abs() < f64::EPSILON);
        // Second call must come from the cache.
        assert_eq!(source.0.load(Ordering::SeqCst), 1);
    }
}
