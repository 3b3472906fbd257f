// =============================================================================
// Bitget REST client — v2 API, mix (futures) and spot
// =============================================================================
//
// Quirks honored here: leverage is set per hold side on mix, and spot
// market buys are sized in quote currency, so the base quantity is
// converted through the reference price before submission.
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::exchange::{
    Credentials, ExchangeClient, ExchangeError, FillReport, InstrumentMeta, LeveragePolicy,
    OrderAck, OrderRequest, OrderSide, VenuePosition,
};
use crate::types::{MarketType, Side};

type HmacSha256 = Hmac<Sha256>;

pub struct BitgetClient {
    creds: Credentials,
    base_url: String,
    market_type: MarketType,
    product_type: String,
    margin_coin: String,
    client: reqwest::Client,
}

fn compact_symbol(symbol: &str) -> String {
    symbol
        .split(':')
        .next()
        .unwrap_or(symbol)
        .replace('/', "")
        .trim()
        .to_uppercase()
}

fn expand_symbol(symbol: &str) -> String {
    let s = symbol.trim().to_uppercase();
    if s.ends_with("USDT") && s.len() > 4 && !s.contains('/') {
        format!("{}/USDT", &s[..s.len() - 4])
    } else {
        s
    }
}

fn num(v: &Value) -> f64 {
    match v {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

impl BitgetClient {
    pub fn new(creds: Credentials, market_type: MarketType, exchange_config: &Value) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        let product_type = exchange_config
            .get("product_type")
            .and_then(|v| v.as_str())
            .unwrap_or("USDT-FUTURES")
            .to_string();
        let margin_coin = exchange_config
            .get("margin_coin")
            .and_then(|v| v.as_str())
            .unwrap_or("USDT")
            .to_string();
        Self {
            creds,
            base_url: "https://api.bitget.com".to_string(),
            market_type,
            product_type,
            margin_coin,
            client,
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
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis()
            .to_string();
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let sig = self.sign(&timestamp, method.as_str(), request_path, &body_str);

        let url = format!("{}{}", self.base_url, request_path);
        let mut builder = self
            .client
            .request(method, &url)
            .header("ACCESS-KEY", &self.creds.api_key)
            .header("ACCESS-SIGN", sig)
            .header("ACCESS-TIMESTAMP", timestamp)
            .header("ACCESS-PASSPHRASE", &self.creds.passphrase)
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
        if !status.is_success() || payload["code"].as_str().unwrap_or("00000") != "00000" {
            return Err(ExchangeError::Venue(format!(
                "bitget {request_path} returned {status}: {payload}"
            )));
        }
        Ok(payload)
    }

    async fn place(
        &self,
        req: &OrderRequest,
        order_type: &str,
        price: Option<f64>,
    ) -> Result<OrderAck, ExchangeError> {
        let symbol = compact_symbol(&req.symbol);
        let (path, body) = match self.market_type {
            MarketType::Swap => {
                let mut body = json!({
                    "symbol": symbol,
                    "productType": self.product_type,
                    "marginCoin": self.margin_coin,
                    "marginMode": if req.margin_mode.is_empty() { "crossed" } else { req.margin_mode.as_str() },
                    "side": req.side.as_str(),
                    "orderType": order_type,
                    "size": req.quantity.to_string(),
                    "clientOid": req.client_order_id,
                    "force": if req.post_only && order_type == "limit" { "post_only" } else { "gtc" },
                });
                if let Some(p) = price {
                    body["price"] = json!(p.to_string());
                }
                if req.reduce_only {
                    body["reduceOnly"] = json!("YES");
                }
                ("/api/v2/mix/order/place-order", body)
            }
            MarketType::Spot => {
                // Spot market buys are sized in quote currency.
                let size = if order_type == "market" && req.side == OrderSide::Buy && req.ref_price > 0.0
                {
                    req.quantity * req.ref_price
                } else {
                    req.quantity
                };
                let mut body = json!({
                    "symbol": symbol,
                    "side": req.side.as_str(),
                    "orderType": order_type,
                    "size": size.to_string(),
                    "clientOid": req.client_order_id,
                    "force": if req.post_only && order_type == "limit" { "post_only" } else { "gtc" },
                });
                if let Some(p) = price {
                    body["price"] = json!(p.to_string());
                }
                ("/api/v2/spot/trade/place-order", body)
            }
        };

        debug!(symbol = %symbol, order_type, "placing bitget order");
        let payload = self.request(reqwest::Method::POST, path, Some(&body)).await?;
        Ok(OrderAck {
            exchange_order_id: payload["data"]["orderId"]
                .as_str()
                .unwrap_or("")
                .to_string(),
            raw: payload,
        })
    }
}

#[async_trait]
impl ExchangeClient for BitgetClient {
    fn venue(&self) -> &'static str {
        "bitget"
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

    async fn instrument(&self, _symbol: &str) -> Result<InstrumentMeta, ExchangeError> {
        // Mix sizes are in base units already.
        Ok(InstrumentMeta::default())
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
                "leverage is a futures-only setting".to_string(),
            ));
        }
        let body = json!({
            "symbol": compact_symbol(symbol),
            "productType": self.product_type,
            "marginCoin": self.margin_coin,
            "marginMode": if margin_mode.is_empty() { "crossed" } else { margin_mode },
            "leverage": leverage.to_string(),
            // Leverage applies per hold side.
            "holdSide": pos_side.to_string(),
        });
        self.request(
            reqwest::Method::POST,
            "/api/v2/mix/account/set-leverage",
            Some(&body),
        )
        .await?;
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
        symbol: &str,
        order_id: &str,
        client_order_id: &str,
    ) -> Result<(), ExchangeError> {
        let (path, mut body) = match self.market_type {
            MarketType::Swap => (
                "/api/v2/mix/order/cancel-order",
                json!({
                    "symbol": compact_symbol(symbol),
                    "productType": self.product_type,
                }),
            ),
            MarketType::Spot => (
                "/api/v2/spot/trade/cancel-order",
                json!({ "symbol": compact_symbol(symbol) }),
            ),
        };
        if !order_id.is_empty() {
            body["orderId"] = json!(order_id);
        } else {
            body["clientOid"] = json!(client_order_id);
        }
        self.request(reqwest::Method::POST, path, Some(&body)).await?;
        Ok(())
    }

    async fn wait_for_fill(
        &self,
        symbol: &str,
        order_id: &str,
        _client_order_id: &str,
        max_wait: Duration,
    ) -> Result<FillReport, ExchangeError> {
        let path = match self.market_type {
            MarketType::Swap => format!(
                "/api/v2/mix/order/detail?symbol={}&productType={}&orderId={}",
                compact_symbol(symbol),
                self.product_type,
                order_id
            ),
            MarketType::Spot => format!("/api/v2/spot/trade/orderInfo?orderId={order_id}"),
        };

        let deadline = std::time::Instant::now() + max_wait;
        let mut report = FillReport::default();
        loop {
            match self.request(reqwest::Method::GET, &path, None).await {
                Ok(payload) => {
                    // Spot orderInfo returns a list; mix detail returns an object.
                    let order = if payload["data"].is_array() {
                        payload["data"]
                            .as_array()
                            .and_then(|a| a.first().cloned())
                            .unwrap_or(Value::Null)
                    } else {
                        payload["data"].clone()
                    };
                    report.filled = num(&order["baseVolume"]);
                    report.avg_price = num(&order["priceAvg"]);
                    let fee = num(&order["fee"]).abs();
                    if fee > 0.0 {
                        report.fee = fee;
                        if report.fee_ccy.is_empty() {
                            report.fee_ccy = self.margin_coin.clone();
                        }
                    }
                    let state = order["status"].as_str().unwrap_or("");
                    if state == "filled" || state == "cancelled" || state == "canceled" {
                        break;
                    }
                }
                Err(e) => warn!(symbol, order_id, error = %e, "bitget order query failed"),
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
        let path = format!(
            "/api/v2/mix/position/all-position?productType={}&marginCoin={}",
            self.product_type, self.margin_coin
        );
        let payload = self.request(reqwest::Method::GET, &path, None).await?;
        let data = payload["data"].as_array().cloned().unwrap_or_default();
        let mut positions = Vec::new();
        for p in &data {
            let symbol = p["symbol"].as_str().unwrap_or("");
            let total = num(&p["total"]);
            if symbol.is_empty() || total.abs() <= 0.0 {
                continue;
            }
            let side = match p["holdSide"].as_str().unwrap_or("") {
                "short" => Side::Short,
                _ => Side::Long,
            };
            positions.push(VenuePosition {
                symbol: expand_symbol(symbol),
                side,
                quantity: total.abs(),
            });
        }
        Ok(positions)
    }
}

impl std::fmt::Debug for BitgetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitgetClient")
            .field("api_key", &"<redacted>")
            .field("market_type", &self.market_type)
            .field("product_type", &self.product_type)
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
    fn symbol_mapping() {
        assert_eq!(compact_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(expand_symbol("BTCUSDT"), "BTC/USDT");
    }

    #[test]
    fn defaults_from_empty_config() {
        let client = BitgetClient::new(
            Credentials::default(),
            MarketType::Swap,
            &serde_json::json!({}),
        );
        assert_eq!(client.product_type, "USDT-FUTURES");
        assert_eq!(client.margin_coin, "USDT");
        assert_eq!(client.leverage_policy(), LeveragePolicy::BestEffort);
    }

    #[test]
    fn spot_has_no_leverage() {
        let client = BitgetClient::new(
            Credentials::default(),
            MarketType::Spot,
            &serde_json::json!({}),
        );
        assert_eq!(client.leverage_policy(), LeveragePolicy::Unsupported);
    }
}
