// =============================================================================
// KuCoin REST client — spot and futures, contract-multiplier sizing
// =============================================================================
//
// Quirks honored here: futures symbols use XBT for Bitcoin and size orders
// in contracts (`multiplier` base units each); futures leverage travels as
// a per-order parameter; spot market buys are sized in quote funds.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::exchange::{
    Credentials, ExchangeClient, ExchangeError, FillReport, InstrumentMeta, LeveragePolicy,
    OrderAck, OrderRequest, OrderSide, VenuePosition,
};
use crate::types::{MarketType, Side};

type HmacSha256 = Hmac<Sha256>;

pub struct KucoinClient {
    creds: Credentials,
    base_url: String,
    market_type: MarketType,
    client: reqwest::Client,
    contracts: RwLock<HashMap<String, InstrumentMeta>>,
    /// Futures leverage rides on each order rather than a standalone call.
    leverage_hint: RwLock<f64>,
}

/// Spot: `BTC/USDT` -> `BTC-USDT`. Futures: `BTC/USDT` -> `XBTUSDTM`.
fn venue_symbol(symbol: &str, market_type: MarketType) -> String {
    let head = symbol.split(':').next().unwrap_or(symbol).trim().to_uppercase();
    match market_type {
        MarketType::Spot => head.replace('/', "-"),
        MarketType::Swap => {
            let compact = head.replace('/', "");
            let compact = if let Some(rest) = compact.strip_prefix("BTC") {
                format!("XBT{rest}")
            } else {
                compact
            };
            format!("{compact}M")
        }
    }
}

/// `XBTUSDTM` -> `BTC/USDT`.
fn engine_symbol(venue_sym: &str) -> String {
    let s = venue_sym.trim().to_uppercase();
    let s = s.strip_suffix('M').unwrap_or(&s).to_string();
    let s = if let Some(rest) = s.strip_prefix("XBT") {
        format!("BTC{rest}")
    } else {
        s
    };
    if s.ends_with("USDT") && s.len() > 4 && !s.contains('/') {
        format!("{}/USDT", &s[..s.len() - 4])
    } else {
        s.replace('-', "/")
    }
}

fn num(v: &Value) -> f64 {
    match v {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

impl KucoinClient {
    pub fn new(creds: Credentials, market_type: MarketType) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        let base_url = match market_type {
            MarketType::Swap => "https://api-futures.kucoin.com".to_string(),
            MarketType::Spot => "https://api.kucoin.com".to_string(),
        };
        Self {
            creds,
            base_url,
            market_type,
            client,
            contracts: RwLock::new(HashMap::new()),
            leverage_hint: RwLock::new(1.0),
        }
    }

    fn hmac_b64(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.creds.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        B64.encode(mac.finalize().into_bytes())
    }

    async fn request(
        &self,
        method: reqwest::Method,
        request_path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ExchangeError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis()
            .to_string();
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let sig = self.hmac_b64(&format!("{timestamp}{}{request_path}{body_str}", method.as_str()));
        let passphrase = self.hmac_b64(&self.creds.passphrase);

        let url = format!("{}{}", self.base_url, request_path);
        let mut builder = self
            .client
            .request(method, &url)
            .header("KC-API-KEY", &self.creds.api_key)
            .header("KC-API-SIGN", sig)
            .header("KC-API-TIMESTAMP", timestamp)
            .header("KC-API-PASSPHRASE", passphrase)
            .header("KC-API-KEY-VERSION", "2")
            .header("Content-Type", "application/json");
        if !body_str.is_empty() {
            builder = builder.body(body_str);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transport(format!("malformed response: {e}")))?;
        if !status.is_success() || payload["code"].as_str().unwrap_or("200000") != "200000" {
            return Err(ExchangeError::Venue(format!(
                "kucoin {request_path} returned {status}: {payload}"
            )));
        }
        Ok(payload)
    }

    async fn contract_meta(&self, symbol: &str) -> Result<InstrumentMeta, ExchangeError> {
        let venue_sym = venue_symbol(symbol, MarketType::Swap);
        if let Some(meta) = self.contracts.read().get(&venue_sym) {
            return Ok(meta.clone());
        }
        let path = format!("/api/v1/contracts/{venue_sym}");
        let payload = self.request(reqwest::Method::GET, &path, None).await?;
        let data = &payload["data"];
        let meta = InstrumentMeta {
            contract_size: num(&data["multiplier"]),
            min_size: num(&data["lotSize"]),
            lot_size: num(&data["lotSize"]),
        };
        self.contracts.write().insert(venue_sym, meta.clone());
        Ok(meta)
    }

    async fn base_to_contracts(&self, symbol: &str, base_qty: f64) -> Result<f64, ExchangeError> {
        let meta = self.contract_meta(symbol).await?;
        if meta.contract_size <= 0.0 {
            return Ok(base_qty);
        }
        Ok((base_qty / meta.contract_size).floor().max(0.0))
    }

    async fn place(
        &self,
        req: &OrderRequest,
        order_type: &str,
        price: Option<f64>,
    ) -> Result<OrderAck, ExchangeError> {
        let venue_sym = venue_symbol(&req.symbol, self.market_type);
        let mut body = json!({
            "clientOid": req.client_order_id,
            "symbol": venue_sym,
            "side": req.side.as_str(),
            "type": order_type,
        });
        match self.market_type {
            MarketType::Swap => {
                let contracts = self.base_to_contracts(&req.symbol, req.quantity).await?;
                if contracts < 1.0 {
                    return Err(ExchangeError::Venue(format!(
                        "kucoin order below one contract (base={})",
                        req.quantity
                    )));
                }
                body["size"] = json!(contracts as i64);
                body["leverage"] = json!(self.leverage_hint.read().to_string());
                if req.reduce_only {
                    body["reduceOnly"] = json!(true);
                }
                if req.post_only && order_type == "limit" {
                    body["postOnly"] = json!(true);
                }
            }
            MarketType::Spot => {
                // Spot market buys are sized in quote funds.
                if order_type == "market" && req.side == OrderSide::Buy && req.ref_price > 0.0 {
                    body["funds"] = json!((req.quantity * req.ref_price).to_string());
                } else {
                    body["size"] = json!(req.quantity.to_string());
                }
            }
        }
        if let Some(p) = price {
            body["price"] = json!(p.to_string());
        }

        debug!(symbol = %venue_sym, order_type, "placing kucoin order");
        let payload = self
            .request(reqwest::Method::POST, "/api/v1/orders", Some(&body))
            .await?;
        Ok(OrderAck {
            exchange_order_id: payload["data"]["orderId"].as_str().unwrap_or("").to_string(),
            raw: payload,
        })
    }
}

#[async_trait]
impl ExchangeClient for KucoinClient {
    fn venue(&self) -> &'static str {
        "kucoin"
    }

    fn market_type(&self) -> MarketType {
        self.market_type
    }

    fn leverage_policy(&self) -> LeveragePolicy {
        match self.market_type {
            MarketType::Swap => LeveragePolicy::BestEffort,
            MarketType::Spot => LeveragePolicy::Unsupported,
        }
    }

    async fn instrument(&self, symbol: &str) -> Result<InstrumentMeta, ExchangeError> {
        match self.market_type {
            MarketType::Swap => self.contract_meta(symbol).await,
            MarketType::Spot => Ok(InstrumentMeta::default()),
        }
    }

    async fn set_leverage(
        &self,
        _symbol: &str,
        leverage: f64,
        _margin_mode: &str,
        _pos_side: Side,
    ) -> Result<(), ExchangeError> {
        if self.market_type != MarketType::Swap {
            return Err(ExchangeError::Unsupported(
                "leverage is a futures-only setting".to_string(),
            ));
        }
        *self.leverage_hint.write() = leverage.max(1.0);
        Ok(())
    }

    async fn place_limit_order(
        &self,
        req: &OrderRequest,
        price: f64,
    ) -> Result<OrderAck, ExchangeError> {
        self.place(req, "limit", Some(price)).await
    }

    async fn place_market_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        self.place(req, "market", None).await
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        order_id: &str,
        _client_order_id: &str,
    ) -> Result<(), ExchangeError> {
        let path = format!("/api/v1/orders/{order_id}");
        self.request(reqwest::Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn wait_for_fill(
        &self,
        symbol: &str,
        order_id: &str,
        _client_order_id: &str,
        max_wait: Duration,
    ) -> Result<FillReport, ExchangeError> {
        let path = format!("/api/v1/orders/{order_id}");
        let deadline = std::time::Instant::now() + max_wait;
        let mut report = FillReport::default();
        loop {
            match self.request(reqwest::Method::GET, &path, None).await {
                Ok(payload) => {
                    let data = &payload["data"];
                    match self.market_type {
                        MarketType::Swap => {
                            let contracts = num(&data["filledSize"]);
                            let value = num(&data["filledValue"]);
                            let meta = self.contract_meta(symbol).await.unwrap_or_default();
                            let base = if meta.contract_size > 0.0 {
                                contracts * meta.contract_size
                            } else {
                                contracts
                            };
                            report.filled = base;
                            report.avg_price = if base > 0.0 { value / base } else { 0.0 };
                        }
                        MarketType::Spot => {
                            let deal_size = num(&data["dealSize"]);
                            let deal_funds = num(&data["dealFunds"]);
                            report.filled = deal_size;
                            report.avg_price =
                                if deal_size > 0.0 { deal_funds / deal_size } else { 0.0 };
                            report.fee = num(&data["fee"]);
                            if let Some(ccy) = data["feeCurrency"].as_str() {
                                if !ccy.is_empty() {
                                    report.fee_ccy = ccy.to_string();
                                }
                            }
                        }
                    }
                    let active = data["isActive"].as_bool().unwrap_or(false);
                    if !active {
                        break;
                    }
                }
                Err(e) => warn!(symbol, order_id, error = %e, "kucoin order query failed"),
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(report)
    }

    async fn get_positions(&self) -> Result<Vec<VenuePosition>, ExchangeError> {
        if self.market_type != MarketType::Swap {
            return Ok(Vec::new());
        }
        let payload = self
            .request(reqwest::Method::GET, "/api/v1/positions", None)
            .await?;
        let data = payload["data"].as_array().cloned().unwrap_or_default();
        let mut positions = Vec::new();
        for p in &data {
            let venue_sym = p["symbol"].as_str().unwrap_or("");
            let qty_ct = num(&p["currentQty"]);
            if venue_sym.is_empty() || qty_ct.abs() <= 0.0 {
                continue;
            }
            let symbol = engine_symbol(venue_sym);
            // Positions arrive in contracts; convert through the multiplier.
            let meta = self.contract_meta(&symbol).await.unwrap_or_default();
            let base = if meta.contract_size > 0.0 {
                qty_ct.abs() * meta.contract_size
            } else {
                qty_ct.abs()
            };
            positions.push(VenuePosition {
                symbol,
                side: if qty_ct > 0.0 { Side::Long } else { Side::Short },
                quantity: base,
            });
        }
        Ok(positions)
    }
}

impl std::fmt::Debug for KucoinClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KucoinClient")
            .field("api_key", &"<redacted>")
            .field("market_type", &self.market_type)
            .finish()
    }
}
