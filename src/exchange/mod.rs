// =============================================================================
// Exchange clients — one capability set, one implementation per venue
// =============================================================================
//
// Every venue implements the same `ExchangeClient` trait; venue quirks
// (contract sizing, quote-sized spot buys, leverage endpoints, client-id
// rules) live inside the client or are advertised through metadata so the
// execution protocol stays generic.
// =============================================================================

pub mod binance;
pub mod bitget;
pub mod gate;
pub mod kucoin;
pub mod okx;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::types::{MarketType, Side};

/// Error taxonomy for live trading.
///
/// `Venue`, `Unsupported`, and `Config` are venue-level: the request made it
/// to a decision point and was rejected; these participate in the
/// partial-success rule. `Transport` covers timeouts and malformed
/// responses and always fails the order outright.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{0}")]
    Venue(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("invalid exchange config: {0}")]
    Config(String),
}

impl ExchangeError {
    pub fn is_venue_level(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Order direction at the venue level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    pub fn as_upper(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

/// A concrete order to place. `quantity` is always in base units; clients
/// convert to contracts or quote size internally where their venue demands
/// it, using `ref_price` for quote-sized market buys.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub ref_price: f64,
    pub reduce_only: bool,
    pub pos_side: Side,
    pub post_only: bool,
    pub margin_mode: String,
    pub client_order_id: String,
}

/// Acknowledgement of a placed order.
#[derive(Debug, Clone, Default)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub raw: Value,
}

/// Fill state of an order, in base units.
#[derive(Debug, Clone, Default)]
pub struct FillReport {
    pub filled: f64,
    pub avg_price: f64,
    pub fee: f64,
    pub fee_ccy: String,
}

/// Instrument size-conversion metadata, cached per instrument by the
/// client that owns it.
#[derive(Debug, Clone)]
pub struct InstrumentMeta {
    /// Base units per contract; 1.0 when the venue sizes in base directly.
    pub contract_size: f64,
    /// Minimum order size in contracts (0 = unknown).
    pub min_size: f64,
    /// Contract count step (0 = unknown).
    pub lot_size: f64,
}

impl Default for InstrumentMeta {
    fn default() -> Self {
        Self {
            contract_size: 1.0,
            min_size: 0.0,
            lot_size: 0.0,
        }
    }
}

impl InstrumentMeta {
    /// Smallest tradable amount in base units, or 0 when unknown.
    pub fn min_base(&self) -> f64 {
        let min_contract = if self.min_size > 0.0 {
            self.min_size
        } else {
            self.lot_size
        };
        if min_contract > 0.0 && self.contract_size > 0.0 {
            min_contract * self.contract_size
        } else {
            0.0
        }
    }
}

/// How a venue treats leverage configuration before orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeveragePolicy {
    /// Must succeed or the order is aborted (Binance futures).
    Mandatory,
    /// Attempted, failures ignored.
    BestEffort,
    /// No leverage concept (spot).
    Unsupported,
}

/// One position as reported by a venue, converted to base units and the
/// engine's symbol format.
#[derive(Debug, Clone, PartialEq)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
}

/// The per-venue capability set consumed by the worker.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn venue(&self) -> &'static str;
    fn market_type(&self) -> MarketType;
    fn leverage_policy(&self) -> LeveragePolicy;

    /// How long the worker polls for fills after the market phase.
    fn market_fill_wait(&self) -> Duration {
        Duration::from_secs(3)
    }

    async fn instrument(&self, symbol: &str) -> Result<InstrumentMeta, ExchangeError>;

    async fn set_leverage(
        &self,
        symbol: &str,
        leverage: f64,
        margin_mode: &str,
        pos_side: Side,
    ) -> Result<(), ExchangeError>;

    async fn place_limit_order(
        &self,
        req: &OrderRequest,
        price: f64,
    ) -> Result<OrderAck, ExchangeError>;

    async fn place_market_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError>;

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        client_order_id: &str,
    ) -> Result<(), ExchangeError>;

    async fn wait_for_fill(
        &self,
        symbol: &str,
        order_id: &str,
        client_order_id: &str,
        max_wait: Duration,
    ) -> Result<FillReport, ExchangeError>;

    async fn get_positions(&self) -> Result<Vec<VenuePosition>, ExchangeError>;
}

/// Venues with a live crypto execution path.
pub const CRYPTO_VENUES: &[&str] = &["binance", "okx", "bitget", "kucoin", "gate"];

/// Deterministic client order id per (strategy, pending order, phase).
/// OKX enforces alphanumeric-only ids of at most 32 characters.
pub fn make_client_order_id(venue: &str, strategy_id: i64, order_id: i64, phase: &str) -> String {
    let phase = phase.trim().to_lowercase();
    if venue == "okx" {
        let base: String = format!("qd{strategy_id}{order_id}{phase}")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        let base = if base.is_empty() {
            format!("qd{strategy_id}{order_id}")
        } else {
            base
        };
        base.chars().take(32).collect()
    } else if phase.is_empty() {
        format!("qd_{strategy_id}_{order_id}")
    } else {
        format!("qd_{strategy_id}_{order_id}_{phase}")
    }
}

/// API credentials parsed from a strategy's `exchange_config` JSON.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
}

impl Credentials {
    pub fn from_config(config: &Value) -> Self {
        let get = |key: &str| {
            config
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        };
        Self {
            api_key: get("api_key"),
            api_secret: get("api_secret"),
            passphrase: get("passphrase"),
        }
    }
}

/// Build a client for the configured venue and market.
pub fn create_client(
    exchange_config: &Value,
    market_type: MarketType,
) -> Result<Arc<dyn ExchangeClient>, ExchangeError> {
    let exchange_id = exchange_config
        .get("exchange_id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if exchange_id.is_empty() {
        return Err(ExchangeError::Config("missing exchange_id".to_string()));
    }
    let creds = Credentials::from_config(exchange_config);

    match exchange_id.as_str() {
        "binance" => Ok(Arc::new(binance::BinanceClient::new(creds, market_type))),
        "okx" => Ok(Arc::new(okx::OkxClient::new(creds, market_type))),
        "bitget" => Ok(Arc::new(bitget::BitgetClient::new(
            creds,
            market_type,
            exchange_config,
        ))),
        "kucoin" => Ok(Arc::new(kucoin::KucoinClient::new(creds, market_type))),
        "gate" => Ok(Arc::new(gate::GateClient::new(creds, market_type))),
        other => Err(ExchangeError::Unsupported(format!(
            "no live client for exchange '{other}'"
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn okx_client_order_id_is_alnum_and_bounded() {
        let id = make_client_order_id("okx", 1234, 567890, "lmt");
        assert!(id.len() <= 32);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(id, "qd1234567890lmt");
    }

    #[test]
    fn generic_client_order_id_is_deterministic() {
        let a = make_client_order_id("binance", 1, 2, "mkt");
        let b = make_client_order_id("binance", 1, 2, "mkt");
        assert_eq!(a, b);
        assert_eq!(a, "qd_1_2_mkt");
        assert_eq!(make_client_order_id("binance", 1, 2, ""), "qd_1_2");
    }

    #[test]
    fn min_base_uses_min_then_lot_size() {
        let meta = InstrumentMeta {
            contract_size: 0.01,
            min_size: 1.0,
            lot_size: 0.5,
        };
        assert!((meta.min_base() - 0.01).abs() < 1e-12);
        let meta = InstrumentMeta {
            contract_size: 0.01,
            min_size: 0.0,
            lot_size: 2.0,
        };
        assert!((meta.min_base() - 0.02).abs() < 1e-12);
        assert!(InstrumentMeta::default().min_base().abs() < 1e-12);
    }

    #[test]
    fn factory_rejects_unknown_and_missing_venues() {
        let err = match create_client(&json!({}), MarketType::Swap) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, ExchangeError::Config(_)));
        let err = match create_client(&json!({"exchange_id": "ibkr"}), MarketType::Swap) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, ExchangeError::Unsupported(_)));
    }

    #[test]
    fn factory_builds_known_venues() {
        for venue in CRYPTO_VENUES {
            let cfg = json!({"exchange_id": venue, "api_key": "k", "api_secret": "s", "passphrase": "p"});
            let client = create_client(&cfg, MarketType::Swap).unwrap();
            assert_eq!(client.venue(), *venue);
        }
    }

    #[test]
    fn transport_errors_are_not_venue_level() {
        assert!(!ExchangeError::Transport("timeout".into()).is_venue_level());
        assert!(ExchangeError::Venue("min notional".into()).is_venue_level());
        assert!(ExchangeError::Unsupported("x".into()).is_venue_level());
        assert!(ExchangeError::Config("x".into()).is_venue_level());
    }
}
