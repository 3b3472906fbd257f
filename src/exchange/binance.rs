// =============================================================================
// Binance REST client — HMAC-SHA256 signed requests, spot and USDT futures
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5000 ms to tolerate
// minor clock drift.
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::exchange::{
    Credentials, ExchangeClient, ExchangeError, FillReport, InstrumentMeta, LeveragePolicy,
    OrderAck, OrderRequest, VenuePosition,
};
use crate::types::{MarketType, Side};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;
const FILL_POLL_INTERVAL_MS: u64 = 500;

pub struct BinanceClient {
    secret: String,
    base_url: String,
    market_type: MarketType,
    client: reqwest::Client,
}

/// `BTC/USDT` (optionally with contract suffix) -> `BTCUSDT`.
fn compact_symbol(symbol: &str) -> String {
    symbol
        .split(':')
        .next()
        .unwrap_or(symbol)
        .replace('/', "")
        .trim()
        .to_uppercase()
}

/// `BTCUSDT` -> `BTC/USDT` (best-effort; non-USDT quotes pass through).
fn expand_symbol(symbol: &str) -> String {
    let s = symbol.trim().to_uppercase();
    if s.ends_with("USDT") && s.len() > 4 && !s.contains('/') {
        format!("{}/USDT", &s[..s.len() - 4])
    } else {
        s
    }
}

fn num_field(v: &Value, key: &str) -> f64 {
    match &v[key] {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

impl BinanceClient {
    pub fn new(creds: Credentials, market_type: MarketType) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&creds.api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }
        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = match market_type {
            MarketType::Swap => "https://fapi.binance.com".to_string(),
            MarketType::Spot => "https://api.binance.com".to_string(),
        };

        Self {
            secret: creds.api_secret,
            base_url,
            market_type,
            client,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn order_path(&self) -> &'static str {
        match self.market_type {
            MarketType::Swap => "/fapi/v1/order",
            MarketType::Spot => "/api/v3/order",
        }
    }

    async fn send_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Result<Value, ExchangeError> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self.client.request(method, &url).send().await?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transport(format!("malformed response: {e}")))?;
        if !status.is_success() {
            return Err(ExchangeError::Venue(format!(
                "binance {path} returned {status}: {body}"
            )));
        }
        Ok(body)
    }

    async fn place_order(
        &self,
        req: &OrderRequest,
        order_type: &str,
        price: Option<f64>,
    ) -> Result<OrderAck, ExchangeError> {
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            compact_symbol(&req.symbol),
            req.side.as_upper(),
            order_type,
            req.quantity
        );
        if let Some(p) = price {
            params.push_str(&format!("&price={p}&timeInForce=GTC"));
        }
        if self.market_type == MarketType::Swap && req.reduce_only {
            params.push_str("&reduceOnly=true");
        }
        if !req.client_order_id.is_empty() {
            params.push_str(&format!("&newClientOrderId={}", req.client_order_id));
        }

        debug!(symbol = %req.symbol, side = req.side.as_str(), order_type, quantity = req.quantity, "placing binance order");
        let body = self
            .send_signed(reqwest::Method::POST, self.order_path(), &params)
            .await?;
        let order_id = body["orderId"]
            .as_u64()
            .map(|v| v.to_string())
            .unwrap_or_default();
        Ok(OrderAck {
            exchange_order_id: order_id,
            raw: body,
        })
    }

    /// Sum commissions over the account trades of one order.
    async fn fetch_fee(&self, symbol: &str, order_id: &str) -> (f64, String) {
        let path = match self.market_type {
            MarketType::Swap => "/fapi/v1/userTrades",
            MarketType::Spot => "/api/v3/myTrades",
        };
        let params = format!("symbol={}&orderId={}", compact_symbol(symbol), order_id);
        match self.send_signed(reqwest::Method::GET, path, &params).await {
            Ok(Value::Array(trades)) => {
                let mut fee = 0.0;
                let mut ccy = String::new();
                for t in &trades {
                    fee += num_field(t, "commission");
                    if ccy.is_empty() {
                        if let Some(asset) = t["commissionAsset"].as_str() {
                            ccy = asset.to_string();
                        }
                    }
                }
                (fee, ccy)
            }
            _ => (0.0, String::new()),
        }
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    fn venue(&self) -> &'static str {
        "binance"
    }

    fn market_type(&self) -> MarketType {
        self.market_type
    }

    fn leverage_policy(&self) -> LeveragePolicy {
        match self.market_type {
            // An unintended default leverage silently changes margin math,
            // so futures orders require the setting to stick.
            MarketType::Swap => LeveragePolicy::Mandatory,
            MarketType::Spot => LeveragePolicy::Unsupported,
        }
    }

    async fn instrument(&self, _symbol: &str) -> Result<InstrumentMeta, ExchangeError> {
        // Binance sizes orders and positions in base units directly.
        Ok(InstrumentMeta::default())
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        leverage: f64,
        _margin_mode: &str,
        _pos_side: Side,
    ) -> Result<(), ExchangeError> {
        if self.market_type != MarketType::Swap {
            return Err(ExchangeError::Unsupported(
                "leverage is a futures-only setting".to_string(),
            ));
        }
        let params = format!(
            "symbol={}&leverage={}",
            compact_symbol(symbol),
            leverage.max(1.0).round() as i64
        );
        self.send_signed(reqwest::Method::POST, "/fapi/v1/leverage", &params)
            .await?;
        Ok(())
    }

    async fn place_limit_order(
        &self,
        req: &OrderRequest,
        price: f64,
    ) -> Result<OrderAck, ExchangeError> {
        self.place_order(req, "LIMIT", Some(price)).await
    }

    async fn place_market_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        self.place_order(req, "MARKET", None).await
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        client_order_id: &str,
    ) -> Result<(), ExchangeError> {
        let mut params = format!("symbol={}", compact_symbol(symbol));
        if !order_id.is_empty() {
            params.push_str(&format!("&orderId={order_id}"));
        } else if !client_order_id.is_empty() {
            params.push_str(&format!("&origClientOrderId={client_order_id}"));
        }
        self.send_signed(reqwest::Method::DELETE, self.order_path(), &params)
            .await?;
        Ok(())
    }

    async fn wait_for_fill(
        &self,
        symbol: &str,
        order_id: &str,
        client_order_id: &str,
        max_wait: Duration,
    ) -> Result<FillReport, ExchangeError> {
        let mut params = format!("symbol={}", compact_symbol(symbol));
        if !order_id.is_empty() {
            params.push_str(&format!("&orderId={order_id}"));
        } else {
            params.push_str(&format!("&origClientOrderId={client_order_id}"));
        }

        let deadline = std::time::Instant::now() + max_wait;
        let mut report = FillReport::default();
        loop {
            match self
                .send_signed(reqwest::Method::GET, self.order_path(), &params)
                .await
            {
                Ok(body) => {
                    let filled = num_field(&body, "executedQty");
                    let avg = match self.market_type {
                        MarketType::Swap => num_field(&body, "avgPrice"),
                        MarketType::Spot => {
                            let quote = num_field(&body, "cummulativeQuoteQty");
                            if filled > 0.0 {
                                quote / filled
                            } else {
                                0.0
                            }
                        }
                    };
                    report.filled = filled;
                    report.avg_price = avg;
                    let state = body["status"].as_str().unwrap_or("");
                    if state == "FILLED" || state == "CANCELED" || state == "EXPIRED" {
                        break;
                    }
                }
                Err(e) => {
                    warn!(symbol, order_id, error = %e, "binance order query failed");
                }
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(FILL_POLL_INTERVAL_MS)).await;
        }

        if report.filled > 0.0 {
            let (fee, ccy) = self.fetch_fee(symbol, order_id).await;
            report.fee = fee;
            report.fee_ccy = ccy;
        }
        Ok(report)
    }

    async fn get_positions(&self) -> Result<Vec<VenuePosition>, ExchangeError> {
        if self.market_type != MarketType::Swap {
            // Spot holdings are commingled with non-strategy balances and
            // are not reconciled.
            return Ok(Vec::new());
        }
        let body = self
            .send_signed(reqwest::Method::GET, "/fapi/v2/positionRisk", "")
            .await?;
        let mut positions = Vec::new();
        if let Value::Array(items) = body {
            for p in &items {
                let symbol = p["symbol"].as_str().unwrap_or("");
                let amt = num_field(p, "positionAmt");
                if symbol.is_empty() || amt.abs() <= 0.0 {
                    continue;
                }
                positions.push(VenuePosition {
                    symbol: expand_symbol(symbol),
                    side: if amt > 0.0 { Side::Long } else { Side::Short },
                    quantity: amt.abs(),
                });
            }
        }
        Ok(positions)
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("market_type", &self.market_type)
            .finish()
    }
}
