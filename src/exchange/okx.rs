// =============================================================================
// OKX REST client — v5 API, contract-sized swap orders
// =============================================================================
//
// OKX swap sizes are in contracts: `ctVal` base units per contract. Orders
// convert base -> contracts on the way out and fills convert back, so the
// rest of the engine only ever sees base quantities.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

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
    OrderAck, OrderRequest, VenuePosition,
};
use crate::types::{MarketType, Side};

type HmacSha256 = Hmac<Sha256>;

pub struct OkxClient {
    creds: Credentials,
    base_url: String,
    market_type: MarketType,
    client: reqwest::Client,
    instruments: RwLock<HashMap<String, InstrumentMeta>>,
}

/// `BTC/USDT` -> `BTC-USDT-SWAP` (swap) or `BTC-USDT` (spot).
fn to_inst_id(symbol: &str, market_type: MarketType) -> String {
    let head = symbol.split(':').next().unwrap_or(symbol);
    let dashified = head.trim().to_uppercase().replace('/', "-");
    match market_type {
        MarketType::Swap => format!("{dashified}-SWAP"),
        MarketType::Spot => dashified,
    }
}

/// `BTC-USDT-SWAP` -> `BTC/USDT`.
fn from_inst_id(inst_id: &str) -> String {
    inst_id.trim().replace("-SWAP", "").replace('-', "/")
}

fn num(v: &Value) -> f64 {
    match v {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

impl OkxClient {
    pub fn new(creds: Credentials, market_type: MarketType) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            creds,
            base_url: "https://www.okx.com".to_string(),
            market_type,
            client,
            instruments: RwLock::new(HashMap::new()),
        }
    }

    fn sign(&self, timestamp: &str, method: &str, request_path: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.creds.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(format!("{timestamp}{method}{request_path}{body}").as_bytes());
        B64.encode(mac.finalize().into_bytes())
    }

    async fn request(
        &self,
        method: reqwest::Method,
        request_path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ExchangeError> {
        let timestamp = chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string();
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let sig = self.sign(&timestamp, method.as_str(), request_path, &body_str);

        let url = format!("{}{}", self.base_url, request_path);
        let mut builder = self
            .client
            .request(method, &url)
            .header("OK-ACCESS-KEY", &self.creds.api_key)
            .header("OK-ACCESS-SIGN", sig)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", &self.creds.passphrase)
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
                "okx {request_path} returned {status}: {payload}"
            )));
        }
        if payload["code"].as_str().unwrap_or("0") != "0" {
            return Err(ExchangeError::Venue(format!(
                "okx {request_path} rejected: {payload}"
            )));
        }
        Ok(payload)
    }

    /// Convert a base quantity into a contract count string, rounded down
    /// to the lot step. Spot stays in base units.
    async fn size_for_order(&self, symbol: &str, base_qty: f64) -> Result<f64, ExchangeError> {
        if self.market_type == MarketType::Spot {
            return Ok(base_qty);
        }
        let meta = self.instrument(symbol).await?;
        if meta.contract_size <= 0.0 {
            return Ok(base_qty);
        }
        let mut contracts = base_qty / meta.contract_size;
        if meta.lot_size > 0.0 {
            contracts = (contracts / meta.lot_size).floor() * meta.lot_size;
        }
        Ok(contracts)
    }

    async fn contracts_to_base(&self, symbol: &str, contracts: f64) -> f64 {
        if self.market_type == MarketType::Spot {
            return contracts;
        }
        match self.instrument(symbol).await {
            Ok(meta) if meta.contract_size > 0.0 => contracts * meta.contract_size,
            _ => contracts,
        }
    }

    async fn place(&self, req: &OrderRequest, ord_type: &str, px: Option<f64>) -> Result<OrderAck, ExchangeError> {
        let inst_id = to_inst_id(&req.symbol, self.market_type);
        let sz = self.size_for_order(&req.symbol, req.quantity).await?;
        if sz <= 0.0 {
            return Err(ExchangeError::Venue(format!(
                "okx order size rounds to zero contracts (base={})",
                req.quantity
            )));
        }

        let td_mode = if self.market_type == MarketType::Spot {
            "cash".to_string()
        } else if req.margin_mode.is_empty() {
            "cross".to_string()
        } else {
            req.margin_mode.clone()
        };

        let mut body = json!({
            "instId": inst_id,
            "tdMode": td_mode,
            "side": req.side.as_str(),
            "ordType": ord_type,
            "sz": sz.to_string(),
            "clOrdId": req.client_order_id,
        });
        if let Some(p) = px {
            body["px"] = json!(p.to_string());
        }
        if self.market_type == MarketType::Swap {
            body["posSide"] = json!(req.pos_side.to_string());
            if req.reduce_only {
                body["reduceOnly"] = json!(true);
            }
        }

        debug!(inst_id = %body["instId"], ord_type, sz, "placing okx order");
        let payload = self
            .request(reqwest::Method::POST, "/api/v5/trade/order", Some(&body))
            .await?;
        let data = payload["data"].as_array().cloned().unwrap_or_default();
        let first = data.first().cloned().unwrap_or(Value::Null);
        if first["sCode"].as_str().unwrap_or("0") != "0" {
            return Err(ExchangeError::Venue(format!("okx order rejected: {first}")));
        }
        Ok(OrderAck {
            exchange_order_id: first["ordId"].as_str().unwrap_or("").to_string(),
            raw: payload,
        })
    }
}

#[async_trait]
impl ExchangeClient for OkxClient {
    fn venue(&self) -> &'static str {
        "okx"
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

    /// The fills endpoint lags execution; poll a little longer than the
    /// other venues so fees are captured.
    fn market_fill_wait(&self) -> Duration {
        Duration::from_secs(12)
    }

    async fn instrument(&self, symbol: &str) -> Result<InstrumentMeta, ExchangeError> {
        let inst_id = to_inst_id(symbol, self.market_type);
        if let Some(meta) = self.instruments.read().get(&inst_id) {
            return Ok(meta.clone());
        }
        if self.market_type == MarketType::Spot {
            return Ok(InstrumentMeta::default());
        }

        let path = format!(
            "/api/v5/public/instruments?instType=SWAP&instId={inst_id}"
        );
        let payload = self.request(reqwest::Method::GET, &path, None).await?;
        let data = payload["data"].as_array().cloned().unwrap_or_default();
        let inst = data.first().cloned().unwrap_or(Value::Null);
        let meta = InstrumentMeta {
            contract_size: num(&inst["ctVal"]),
            min_size: num(&inst["minSz"]),
            lot_size: num(&inst["lotSz"]),
        };
        self.instruments.write().insert(inst_id, meta.clone());
        Ok(meta)
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        leverage: f64,
        margin_mode: &str,
        pos_side: Side,
    ) -> Result<(), ExchangeError> {
        if self.market_type != MarketType::Swap {
            return Err(ExchangeError::Unsupported(
                "leverage is a swap-only setting".to_string(),
            ));
        }
        let mgn_mode = if margin_mode.is_empty() { "cross" } else { margin_mode };
        let body = json!({
            "instId": to_inst_id(symbol, self.market_type),
            "lever": leverage.to_string(),
            "mgnMode": mgn_mode,
            "posSide": pos_side.to_string(),
        });
        self.request(reqwest::Method::POST, "/api/v5/account/set-leverage", Some(&body))
            .await?;
        Ok(())
    }

    async fn place_limit_order(
        &self,
        req: &OrderRequest,
        price: f64,
    ) -> Result<OrderAck, ExchangeError> {
        let ord_type = if req.post_only { "post_only" } else { "limit" };
        self.place(req, ord_type, Some(price)).await
    }

    async fn place_market_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        self.place(req, "market", None).await
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        client_order_id: &str,
    ) -> Result<(), ExchangeError> {
        let mut body = json!({ "instId": to_inst_id(symbol, self.market_type) });
        if !order_id.is_empty() {
            body["ordId"] = json!(order_id);
        } else {
            body["clOrdId"] = json!(client_order_id);
        }
        self.request(reqwest::Method::POST, "/api/v5/trade/cancel-order", Some(&body))
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
        let inst_id = to_inst_id(symbol, self.market_type);
        let path = if !order_id.is_empty() {
            format!("/api/v5/trade/order?instId={inst_id}&ordId={order_id}")
        } else {
            format!("/api/v5/trade/order?instId={inst_id}&clOrdId={client_order_id}")
        };

        let deadline = std::time::Instant::now() + max_wait;
        let mut report = FillReport::default();
        loop {
            match self.request(reqwest::Method::GET, &path, None).await {
                Ok(payload) => {
                    let data = payload["data"].as_array().cloned().unwrap_or_default();
                    if let Some(order) = data.first() {
                        let contracts = num(&order["accFillSz"]);
                        report.filled = self.contracts_to_base(symbol, contracts).await;
                        report.avg_price = num(&order["avgPx"]);
                        // OKX reports fees as negative amounts.
                        report.fee = num(&order["fee"]).abs();
                        if let Some(ccy) = order["feeCcy"].as_str() {
                            if !ccy.is_empty() {
                                report.fee_ccy = ccy.to_string();
                            }
                        }
                        let state = order["state"].as_str().unwrap_or("");
                        if state == "filled" || state == "canceled" {
                            break;
                        }
                    }
                }
                Err(e) => warn!(inst_id = %inst_id, error = %e, "okx order query failed"),
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
            .request(reqwest::Method::GET, "/api/v5/account/positions", None)
            .await?;
        let data = payload["data"].as_array().cloned().unwrap_or_default();
        let mut positions = Vec::new();
        for p in &data {
            let inst_id = p["instId"].as_str().unwrap_or("");
            let contracts = num(&p["pos"]);
            if inst_id.is_empty() || contracts.abs() <= 0.0 {
                continue;
            }
            let side = match p["posSide"].as_str().unwrap_or("") {
                "long" => Side::Long,
                "short" => Side::Short,
                _ if contracts > 0.0 => Side::Long,
                _ => Side::Short,
            };
            // Positions are in contracts; convert through ctVal.
            let symbol = from_inst_id(inst_id);
            let quantity = self.contracts_to_base(&symbol, contracts.abs()).await;
            positions.push(VenuePosition {
                symbol,
                side,
                quantity,
            });
        }
        Ok(positions)
    }
}

impl std::fmt::Debug for OkxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxClient")
            .field("api_key", &"<redacted>")
            .field("market_type", &self.market_type)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inst_id_round_trip() {
        assert_eq!(to_inst_id("BTC/USDT", MarketType::Swap), "BTC-USDT-SWAP");
        assert_eq!(to_inst_id("BTC/USDT:USDT", MarketType::Swap), "BTC-USDT-SWAP");
        assert_eq!(to_inst_id("BTC/USDT", MarketType::Spot), "BTC-USDT");
        assert_eq!(from_inst_id("BTC-USDT-SWAP"), "BTC/USDT");
    }

    #[test]
    fn signature_is_base64() {
        let client = OkxClient::new(
            Credentials {
                api_key: "k".into(),
                api_secret: "s".into(),
                passphrase: "p".into(),
            },
            MarketType::Swap,
        );
        let sig = client.sign("2024-01-01T00:00:00.000Z", "GET", "/api/v5/account/positions", "");
        assert!(B64.decode(&sig).is_ok());
    }

    #[tokio::test]
    async fn cached_instrument_meta_converts_contracts() {
        let client = OkxClient::new(Credentials::default(), MarketType::Swap);
        client.instruments.write().insert(
            "BTC-USDT-SWAP".to_string(),
            InstrumentMeta {
                contract_size: 0.01,
                min_size: 1.0,
                lot_size: 1.0,
            },
        );
        // 0.05 base at 0.01 ctVal = 5 contracts
        let sz = client.size_for_order("BTC/USDT", 0.05).await.unwrap();
        assert!((sz - 5.0).abs() < 1e-9);
        // and back
        let base = client.contracts_to_base("BTC/USDT", 5.0).await;
        assert!((base - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn lot_rounding_floors_contract_count() {
        let client = OkxClient::new(Credentials::default(), MarketType::Swap);
        client.instruments.write().insert(
            "ETH-USDT-SWAP".to_string(),
            InstrumentMeta {
                contract_size: 0.1,
                min_size: 1.0,
                lot_size: 1.0,
            },
        );
        let sz = client.size_for_order("ETH/USDT", 0.59).await.unwrap();
        assert!((sz - 5.0).abs() < 1e-9);
    }
}
