// =============================================================================
// Gate REST client — v4 API, quanto-multiplier contract sizing
// =============================================================================
//
// Gate USDT futures size orders in signed contract counts (buy positive,
// sell negative) with `quanto_multiplier` base units per contract. The
// client converts both directions so callers stay in base units.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde_json::{json, Value};
use sha2::{Digest, Sha512};
use tracing::{debug, warn};

use crate::exchange::{
    Credentials, ExchangeClient, ExchangeError, FillReport, InstrumentMeta, LeveragePolicy,
    OrderAck, OrderRequest, OrderSide, VenuePosition,
};
use crate::types::{MarketType, Side};

type HmacSha512 = Hmac<Sha512>;

pub struct GateClient {
    creds: Credentials,
    base_url: String,
    market_type: MarketType,
    client: reqwest::Client,
    contracts: RwLock<HashMap<String, InstrumentMeta>>,
}

/// `BTC/USDT` -> `BTC_USDT`.
fn to_pair(symbol: &str) -> String {
    symbol
        .split(':')
        .next()
        .unwrap_or(symbol)
        .trim()
        .to_uppercase()
        .replace('/', "_")
}

/// `BTC_USDT` -> `BTC/USDT`.
fn from_pair(pair: &str) -> String {
    pair.trim().to_uppercase().replace('_', "/")
}

fn num(v: &Value) -> f64 {
    match v {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

impl GateClient {
    pub fn new(creds: Credentials, market_type: MarketType) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            creds,
            base_url: "https://api.gateio.ws".to_string(),
            market_type,
            client,
            contracts: RwLock::new(HashMap::new()),
        }
    }

    fn sign(&self, method: &str, path: &str, query: &str, body: &str, timestamp: &str) -> String {
        let body_hash = hex::encode(Sha512::digest(body.as_bytes()));
        let payload = format!("{method}\n{path}\n{query}\n{body_hash}\n{timestamp}");
        let mut mac = HmacSha512::new_from_slice(self.creds.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        body: Option<&Value>,
    ) -> Result<Value, ExchangeError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_secs()
            .to_string();
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let sig = self.sign(method.as_str(), path, query, &body_str, &timestamp);

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let mut builder = self
            .client
            .request(method, &url)
            .header("KEY", &self.creds.api_key)
            .header("Timestamp", timestamp)
            .header("SIGN", sig)
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
        if !status.is_success() {
            return Err(ExchangeError::Venue(format!(
                "gate {path} returned {status}: {payload}"
            )));
        }
        Ok(payload)
    }

    async fn contract_meta(&self, symbol: &str) -> Result<InstrumentMeta, ExchangeError> {
        let contract = to_pair(symbol);
        if let Some(meta) = self.contracts.read().get(&contract) {
            return Ok(meta.clone());
        }
        let path = format!("/api/v4/futures/usdt/contracts/{contract}");
        let payload = self.request(reqwest::Method::GET, &path, "", None).await?;
        let qm = num(&payload["quanto_multiplier"]);
        let meta = InstrumentMeta {
            contract_size: if qm > 0.0 { qm } else { 1.0 },
            min_size: num(&payload["order_size_min"]),
            lot_size: 1.0,
        };
        self.contracts.write().insert(contract, meta.clone());
        Ok(meta)
    }

    /// Signed contract count: buy positive, sell negative.
    async fn signed_contracts(
        &self,
        symbol: &str,
        side: OrderSide,
        base_qty: f64,
    ) -> Result<i64, ExchangeError> {
        let meta = self.contract_meta(symbol).await?;
        let contracts = if meta.contract_size > 0.0 {
            (base_qty / meta.contract_size).floor() as i64
        } else {
            base_qty.floor() as i64
        };
        if contracts < 1 {
            return Err(ExchangeError::Venue(format!(
                "gate order below one contract (base={base_qty})"
            )));
        }
        Ok(match side {
            OrderSide::Buy => contracts,
            OrderSide::Sell => -contracts,
        })
    }

    async fn place_futures(
        &self,
        req: &OrderRequest,
        price: Option<f64>,
    ) -> Result<OrderAck, ExchangeError> {
        let contract = to_pair(&req.symbol);
        let size = self
            .signed_contracts(&req.symbol, req.side, req.quantity)
            .await?;
        let tif = match price {
            Some(_) if req.post_only => "poc",
            Some(_) => "gtc",
            None => "ioc",
        };
        let body = json!({
            "contract": contract,
            "size": size,
            // price "0" submits a market order on Gate futures
            "price": price.map(|p| p.to_string()).unwrap_or_else(|| "0".to_string()),
            "tif": tif,
            "reduce_only": req.reduce_only,
            "text": format!("t-{}", req.client_order_id),
        });
        debug!(contract = %contract, size, "placing gate futures order");
        let payload = self
            .request(reqwest::Method::POST, "/api/v4/futures/usdt/orders", "", Some(&body))
            .await?;
        Ok(OrderAck {
            exchange_order_id: payload["id"]
                .as_i64()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            raw: payload,
        })
    }

    async fn place_spot(
        &self,
        req: &OrderRequest,
        price: Option<f64>,
    ) -> Result<OrderAck, ExchangeError> {
        // Spot market buys are sized in quote currency on Gate.
        let amount = if price.is_none() && req.side == OrderSide::Buy && req.ref_price > 0.0 {
            req.quantity * req.ref_price
        } else {
            req.quantity
        };
        let mut body = json!({
            "currency_pair": to_pair(&req.symbol),
            "side": req.side.as_str(),
            "amount": amount.to_string(),
            "type": if price.is_some() { "limit" } else { "market" },
            "text": format!("t-{}", req.client_order_id),
        });
        if let Some(p) = price {
            body["price"] = json!(p.to_string());
            body["time_in_force"] = json!(if req.post_only { "poc" } else { "gtc" });
        } else {
            body["time_in_force"] = json!("ioc");
        }
        let payload = self
            .request(reqwest::Method::POST, "/api/v4/spot/orders", "", Some(&body))
            .await?;
        Ok(OrderAck {
            exchange_order_id: payload["id"].as_str().unwrap_or("").to_string(),
            raw: payload,
        })
    }
}

#[async_trait]
impl ExchangeClient for GateClient {
    fn venue(&self) -> &'static str {
        "gate"
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
        let path = format!("/api/v4/futures/usdt/positions/{}/leverage", to_pair(symbol));
        let query = format!("leverage={}", leverage.max(1.0).round() as i64);
        self.request(reqwest::Method::POST, &path, &query, None)
            .await?;
        Ok(())
    }

    async fn place_limit_order(
        &self,
        req: &OrderRequest,
        price: f64,
    ) -> Result<OrderAck, ExchangeError> {
        match self.market_type {
            MarketType::Swap => self.place_futures(req, Some(price)).await,
            MarketType::Spot => self.place_spot(req, Some(price)).await,
        }
    }

    async fn place_market_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        match self.market_type {
            MarketType::Swap => self.place_futures(req, None).await,
            MarketType::Spot => self.place_spot(req, None).await,
        }
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        _client_order_id: &str,
    ) -> Result<(), ExchangeError> {
        let path = match self.market_type {
            MarketType::Swap => format!("/api/v4/futures/usdt/orders/{order_id}"),
            MarketType::Spot => format!("/api/v4/spot/orders/{order_id}"),
        };
        let query = match self.market_type {
            MarketType::Spot => format!("currency_pair={}", to_pair(symbol)),
            MarketType::Swap => String::new(),
        };
        self.request(reqwest::Method::DELETE, &path, &query, None)
            .await?;
        Ok(())
    }

    async fn wait_for_fill(
        &self,
        symbol: &str,
        order_id: &str,
        _client_order_id: &str,
        max_wait: Duration,
    ) -> Result<FillReport, ExchangeError> {
        let (path, query) = match self.market_type {
            MarketType::Swap => (format!("/api/v4/futures/usdt/orders/{order_id}"), String::new()),
            MarketType::Spot => (
                format!("/api/v4/spot/orders/{order_id}"),
                format!("currency_pair={}", to_pair(symbol)),
            ),
        };

        let deadline = std::time::Instant::now() + max_wait;
        let mut report = FillReport::default();
        loop {
            match self.request(reqwest::Method::GET, &path, &query, None).await {
                Ok(payload) => match self.market_type {
                    MarketType::Swap => {
                        let size = num(&payload["size"]).abs();
                        let left = num(&payload["left"]).abs();
                        let filled_ct = (size - left).max(0.0);
                        let meta = self.contract_meta(symbol).await.unwrap_or_default();
                        report.filled = filled_ct * meta.contract_size.max(1e-12);
                        report.avg_price = num(&payload["fill_price"]);
                        let status = payload["status"].as_str().unwrap_or("");
                        if status == "finished" {
                            break;
                        }
                    }
                    MarketType::Spot => {
                        let filled = num(&payload["filled_amount"]);
                        let total = num(&payload["filled_total"]);
                        report.filled = filled;
                        report.avg_price = if filled > 0.0 { total / filled } else { 0.0 };
                        report.fee = num(&payload["fee"]);
                        if let Some(ccy) = payload["fee_currency"].as_str() {
                            if !ccy.is_empty() {
                                report.fee_ccy = ccy.to_string();
                            }
                        }
                        let status = payload["status"].as_str().unwrap_or("");
                        if status == "closed" || status == "cancelled" {
                            break;
                        }
                    }
                },
                Err(e) => warn!(symbol, order_id, error = %e, "gate order query failed"),
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
            .request(reqwest::Method::GET, "/api/v4/futures/usdt/positions", "", None)
            .await?;
        let items = payload.as_array().cloned().unwrap_or_default();
        let mut positions = Vec::new();
        for p in &items {
            let contract = p["contract"].as_str().unwrap_or("");
            let size_ct = num(&p["size"]);
            if contract.is_empty() || size_ct.abs() <= 0.0 {
                continue;
            }
            let symbol = from_pair(contract);
            // Sizes arrive in contracts; convert through quanto_multiplier.
            let meta = self.contract_meta(&symbol).await.unwrap_or_default();
            positions.push(VenuePosition {
                symbol,
                side: if size_ct > 0.0 { Side::Long } else { Side::Short },
                quantity: size_ct.abs() * meta.contract_size.max(1e-12),
            });
        }
        Ok(positions)
    }
}

impl std::fmt::Debug for GateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateClient")
            .field("api_key", &"<redacted>")
            .field("market_type", &self.market_type)
            .finish()
    }
}
